//! Status transitions on a task record.
//!
//! Transitions only touch the record; persisting them is up to the caller.

use chrono::{DateTime, TimeDelta, Utc};

use super::record::TaskRecord;
use super::status::{TaskCommand, TaskStatus};
use crate::error::LifecycleError;

impl TaskRecord {
    /// Put the task on hold, remembering where it was.
    ///
    /// Returns `false` and leaves the record alone when the status is not
    /// holdable.
    pub fn set_on_hold(&mut self) -> bool {
        let status = self.status();
        if !status.is_holdable() {
            return false;
        }
        self.set_old_status(Some(status));
        self.set_status(TaskStatus::Pending);
        if self.frozen_time().is_none() {
            self.set_frozen_time(Some(Utc::now()));
        }
        true
    }

    /// Release a held task back to its saved status.
    ///
    /// No-op unless the task is pending.
    pub fn set_in_active(&mut self) -> bool {
        if self.status() != TaskStatus::Pending {
            return false;
        }
        let restored = self.old_status().unwrap_or(TaskStatus::Ready);
        self.set_status(restored);
        self.set_old_status(None);
        self.set_error_dialog(None);
        self.set_frozen_time(None);
        true
    }

    /// Move the task into the command's in-progress status.
    pub fn apply_command(&mut self, command: TaskCommand) -> Result<TaskStatus, LifecycleError> {
        let from = self.status();
        let to = command.doing();
        if !command.accepts(from) {
            return Err(LifecycleError::InvalidTransition {
                task_id: self.task_id(),
                from,
                to,
            });
        }
        self.set_status(to);
        Ok(to)
    }

    /// Finish a command once its side effect is done.
    pub fn complete_command(&mut self, command: TaskCommand) -> Result<TaskStatus, LifecycleError> {
        let (doing, done) = command.statuses();
        let from = self.status();
        if from != doing {
            return Err(LifecycleError::InvalidTransition {
                task_id: self.task_id(),
                from,
                to: done,
            });
        }
        self.set_status(done);
        Ok(done)
    }

    /// No nucleus yet: send the task back to brokerage.
    pub fn prepare_rebrokerage(&mut self) {
        self.set_status(TaskStatus::Assigning);
        self.set_old_status(None);
        self.set_to_register_datasets();
    }

    /// Outputs are subscribed to the new destination; resume the task.
    pub fn activate_after_reassign(&mut self) -> TaskStatus {
        let next = match self.old_status() {
            None | Some(TaskStatus::Assigning) | Some(TaskStatus::Exhausted) => TaskStatus::Ready,
            Some(other) => other,
        };
        self.set_status(next);
        self.set_old_status(None);
        next
    }

    /// Hold the task back until `now + wait * attempts`.
    pub fn throttle(&mut self, wait: TimeDelta, now: DateTime<Utc>) -> DateTime<Utc> {
        let attempts = self.num_throttled().unwrap_or(0) + 1;
        let multiplier = i32::try_from(attempts).unwrap_or(i32::MAX);
        let release_at = now + wait * multiplier;
        self.set_num_throttled(Some(attempts));
        self.set_old_status(Some(self.status()));
        self.set_status(TaskStatus::Throttled);
        self.set_throttled_time(Some(release_at));
        self.set_error_dialog(Some(&format!(
            "throttled until {} since jobs are waiting in the queue",
            release_at.format("%Y-%m-%d %H:%M:%S")
        )));
        release_at
    }

    /// Return a throttled task to its saved status.
    pub fn release_throttle(&mut self) -> bool {
        if self.status() != TaskStatus::Throttled {
            return false;
        }
        let restored = self.old_status().unwrap_or(TaskStatus::Ready);
        self.set_status(restored);
        self.set_old_status(None);
        self.set_throttled_time(None);
        self.set_error_dialog(None);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::record::TaskAttr;

    fn task_in(status: TaskStatus) -> TaskRecord {
        let mut task = TaskRecord::new(42);
        task.set_status(status);
        task.reset_changed_list();
        task
    }

    #[test]
    fn hold_then_release_restores_every_holdable_status() {
        for status in TaskStatus::ALL.iter().copied().filter(|s| s.is_holdable()) {
            let mut task = task_in(status);
            task.set_error_dialog(Some("waiting for input"));
            assert!(task.set_on_hold());
            assert_eq!(task.status(), TaskStatus::Pending);
            assert_eq!(task.old_status(), Some(status));
            assert!(task.frozen_time().is_some());

            assert!(task.set_in_active());
            assert_eq!(task.status(), status);
            assert_eq!(task.old_status(), None);
            assert_eq!(task.error_dialog(), None);
            assert_eq!(task.frozen_time(), None);
        }
    }

    #[test]
    fn hold_is_noop_outside_holdable_set() {
        for status in TaskStatus::ALL.iter().copied().filter(|s| !s.is_holdable()) {
            let mut task = task_in(status);
            assert!(!task.set_on_hold());
            assert_eq!(task.status(), status);
            assert!(!task.has_changes());
        }
    }

    #[test]
    fn release_is_noop_unless_pending() {
        let mut task = task_in(TaskStatus::Running);
        task.set_error_dialog(Some("keep me"));
        assert!(!task.set_in_active());
        assert_eq!(task.error_dialog(), Some("keep me"));
    }

    #[test]
    fn commands_move_through_doing_and_done() {
        let mut task = task_in(TaskStatus::Failed);
        assert_eq!(task.apply_command(TaskCommand::Retry).unwrap(), TaskStatus::ToRetry);
        assert_eq!(task.complete_command(TaskCommand::Retry).unwrap(), TaskStatus::Ready);

        let mut task = task_in(TaskStatus::Running);
        assert_eq!(task.apply_command(TaskCommand::Kill).unwrap(), TaskStatus::Aborting);
        assert!(task.complete_command(TaskCommand::Finish).is_err());
        assert_eq!(task.complete_command(TaskCommand::Kill).unwrap(), TaskStatus::Aborted);
    }

    #[test]
    fn ineligible_command_is_rejected() {
        let mut task = task_in(TaskStatus::Running);
        let err = task.apply_command(TaskCommand::Incexec).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                task_id: 42,
                from: TaskStatus::Running,
                to: TaskStatus::ToIncexec,
            }
        ));
        assert_eq!(task.status(), TaskStatus::Running);

        let mut done = task_in(TaskStatus::Done);
        assert!(done.apply_command(TaskCommand::Kill).is_err());
        assert!(done.apply_command(TaskCommand::Incexec).is_ok());
    }

    #[test]
    fn rebrokerage_resets_to_assigning() {
        let mut task = task_in(TaskStatus::Reassigning);
        task.set_old_status(Some(TaskStatus::Running));
        task.prepare_rebrokerage();
        assert_eq!(task.status(), TaskStatus::Assigning);
        assert_eq!(task.old_status(), None);
        assert!(task.to_register_datasets());
        assert!(task.is_changed(TaskAttr::SplitRule));
    }

    #[test]
    fn activation_after_reassign() {
        for (old, expected) in [
            (None, TaskStatus::Ready),
            (Some(TaskStatus::Assigning), TaskStatus::Ready),
            (Some(TaskStatus::Exhausted), TaskStatus::Ready),
            (Some(TaskStatus::Running), TaskStatus::Running),
            (Some(TaskStatus::Scouting), TaskStatus::Scouting),
        ] {
            let mut task = task_in(TaskStatus::Reassigning);
            task.set_old_status(old);
            assert_eq!(task.activate_after_reassign(), expected);
            assert_eq!(task.old_status(), None);
        }
    }

    #[test]
    fn throttle_backs_off_per_attempt() {
        let now = Utc::now();
        let mut task = task_in(TaskStatus::Running);
        task.set_num_throttled(Some(0));

        let first = task.throttle(TimeDelta::minutes(10), now);
        assert_eq!(first, now + TimeDelta::minutes(10));
        assert_eq!(task.status(), TaskStatus::Throttled);
        assert_eq!(task.old_status(), Some(TaskStatus::Running));
        assert!(task.error_dialog().is_some());

        assert!(task.release_throttle());
        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(task.error_dialog(), None);

        let second = task.throttle(TimeDelta::minutes(10), now);
        assert_eq!(second, now + TimeDelta::minutes(20));
        assert_eq!(task.num_throttled(), Some(2));
    }
}
