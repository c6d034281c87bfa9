//! JEDI core: task records, split rules, refinement and the production watchdog.

pub mod config;
pub mod ddm;
pub mod error;
pub mod refine;
pub mod store;
pub mod task;
mod timeout;
pub mod topology;
pub mod watchdog;

pub use error::{Error, Result};
