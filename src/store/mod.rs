//! Persistence layer: the `TaskStore` trait and its backends.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlTaskStore;
pub use memory::MemoryTaskStore;
pub use traits::{
    BulkOutcome, ReactivateOutcome, ScoutJobData, TaskQuery, TaskStore, UpdateKey, WorkQueue,
};
