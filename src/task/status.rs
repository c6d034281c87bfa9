//! Task status values, status-set predicates and the command table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;

/// Status of a task.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Submitted, awaiting refinement.
    #[default]
    Registered,
    /// Refined and persisted.
    Defined,
    Ready,
    Scouting,
    Running,
    Merging,
    ToPreprocess,
    Preprocessing,
    /// Temporarily held; the previous status sits in `old_status`.
    Pending,
    /// Waiting for brokerage to pick a cloud or nucleus.
    Assigning,
    /// Reassignment requested externally.
    Reassigning,
    /// Held back by the throttle action.
    Throttled,
    Exhausted,
    ToRetry,
    ToIncexec,
    Rerefine,
    Aborting,
    Aborted,
    Finishing,
    Prepared,
    Broken,
    Failed,
    Finished,
    Done,
}

impl TaskStatus {
    pub const ALL: &'static [TaskStatus] = &[
        TaskStatus::Registered,
        TaskStatus::Defined,
        TaskStatus::Ready,
        TaskStatus::Scouting,
        TaskStatus::Running,
        TaskStatus::Merging,
        TaskStatus::ToPreprocess,
        TaskStatus::Preprocessing,
        TaskStatus::Pending,
        TaskStatus::Assigning,
        TaskStatus::Reassigning,
        TaskStatus::Throttled,
        TaskStatus::Exhausted,
        TaskStatus::ToRetry,
        TaskStatus::ToIncexec,
        TaskStatus::Rerefine,
        TaskStatus::Aborting,
        TaskStatus::Aborted,
        TaskStatus::Finishing,
        TaskStatus::Prepared,
        TaskStatus::Broken,
        TaskStatus::Failed,
        TaskStatus::Finished,
        TaskStatus::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Defined => "defined",
            Self::Ready => "ready",
            Self::Scouting => "scouting",
            Self::Running => "running",
            Self::Merging => "merging",
            Self::ToPreprocess => "topreprocess",
            Self::Preprocessing => "preprocessing",
            Self::Pending => "pending",
            Self::Assigning => "assigning",
            Self::Reassigning => "reassigning",
            Self::Throttled => "throttled",
            Self::Exhausted => "exhausted",
            Self::ToRetry => "toretry",
            Self::ToIncexec => "toincexec",
            Self::Rerefine => "rerefine",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
            Self::Finishing => "finishing",
            Self::Prepared => "prepared",
            Self::Broken => "broken",
            Self::Failed => "failed",
            Self::Finished => "finished",
            Self::Done => "done",
        }
    }

    /// Statuses a task can be put on hold from.
    pub fn is_holdable(self) -> bool {
        matches!(
            self,
            Self::Ready
                | Self::Running
                | Self::Merging
                | Self::Scouting
                | Self::Defined
                | Self::ToPreprocess
                | Self::Preprocessing
        )
    }

    /// Task content may still be updated.
    pub fn accepts_content_update(self) -> bool {
        matches!(self, Self::Defined | Self::Pending)
    }

    /// Task ignores externally driven changes.
    pub fn rejects_external_change(self) -> bool {
        matches!(
            self,
            Self::Finished
                | Self::Done
                | Self::Prepared
                | Self::Broken
                | Self::Aborted
                | Self::Failed
                | Self::Aborting
                | Self::Finishing
        )
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Eligible for an incremental-execution restart.
    pub fn is_incexec_restartable(self) -> bool {
        self.is_retryable() || self == Self::Done
    }

    /// Job generation may run for the task.
    pub fn allows_job_generation(self) -> bool {
        matches!(
            self,
            Self::Ready
                | Self::Running
                | Self::Scouting
                | Self::ToPreprocess
                | Self::Preprocessing
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| LifecycleError::UnknownStatus(s.to_string()))
    }
}

/// Externally issued task commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCommand {
    Kill,
    Finish,
    Retry,
    Incexec,
}

impl TaskCommand {
    pub const ALL: &'static [TaskCommand] = &[
        TaskCommand::Kill,
        TaskCommand::Finish,
        TaskCommand::Retry,
        TaskCommand::Incexec,
    ];

    /// `(doing, done)` status pair for the command.
    pub fn statuses(self) -> (TaskStatus, TaskStatus) {
        match self {
            Self::Kill => (TaskStatus::Aborting, TaskStatus::Aborted),
            Self::Finish => (TaskStatus::Finishing, TaskStatus::Prepared),
            Self::Retry => (TaskStatus::ToRetry, TaskStatus::Ready),
            Self::Incexec => (TaskStatus::ToIncexec, TaskStatus::Rerefine),
        }
    }

    pub fn doing(self) -> TaskStatus {
        self.statuses().0
    }

    pub fn done(self) -> TaskStatus {
        self.statuses().1
    }

    /// Whether a task in `status` may receive this command.
    pub fn accepts(self, status: TaskStatus) -> bool {
        match self {
            Self::Kill | Self::Finish => !status.rejects_external_change(),
            Self::Retry => status.is_retryable(),
            Self::Incexec => status.is_incexec_restartable(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kill => "kill",
            Self::Finish => "finish",
            Self::Retry => "retry",
            Self::Incexec => "incexec",
        }
    }
}

impl fmt::Display for TaskCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCommand {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| LifecycleError::UnknownCommand(s.to_string()))
    }
}
