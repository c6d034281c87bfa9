//! Error types for the task orchestration core.

use std::time::Duration;

use crate::task::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Refine error: {0}")]
    Refine(#[from] RefineError),

    #[error("Watchdog error: {0}")]
    Watchdog(#[from] WatchdogError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task/dataset store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: i64 },

    #[error("Task {task_id} already exists")]
    Duplicate { task_id: i64 },

    #[error("Corrupt value in column {column}: {message}")]
    Corrupt { column: String, message: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Remote data catalog / data-movement errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Subscription of {dataset} to {location} failed: {reason}")]
    SubscriptionFailed {
        dataset: String,
        location: String,
        reason: String,
    },

    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

/// Site/cloud/nucleus topology errors.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Failed to read topology file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse topology: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Nucleus {nucleus} references unknown site {site}")]
    UnknownSite { nucleus: String, site: String },
}

/// Invalid task state transitions.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Task {task_id} in state {from} cannot go to {to}")]
    InvalidTransition {
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Unknown task command: {0}")]
    UnknownCommand(String),

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),
}

/// Task refinement errors. Refinement is all-or-nothing.
#[derive(Debug, thiserror::Error)]
pub enum RefineError {
    #[error("Missing task parameter: {0}")]
    MissingParam(String),

    #[error("Invalid task parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("Parent task {parent_tid} not found")]
    ParentNotFound { parent_tid: i64 },

    #[error("Store error during refinement: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error during refinement: {0}")]
    Catalog(#[from] CatalogError),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
}

impl From<CallTimedOut> for RefineError {
    fn from(e: CallTimedOut) -> Self {
        Self::Timeout {
            operation: e.operation,
            timeout: e.timeout,
        }
    }
}

/// Watchdog action errors. These never escape a pass; they are logged and
/// counted per task.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Topology lookup failed: {0}")]
    Topology(String),

    #[error("Task {task_id} update matched no row")]
    LostUpdate { task_id: i64 },
}

impl From<CallTimedOut> for WatchdogError {
    fn from(e: CallTimedOut) -> Self {
        Self::Timeout {
            operation: e.operation,
            timeout: e.timeout,
        }
    }
}

/// A store or catalog call that did not finish in time.
#[derive(Debug, thiserror::Error)]
#[error("{operation} timed out after {timeout:?}")]
pub struct CallTimedOut {
    pub operation: String,
    pub timeout: Duration,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
