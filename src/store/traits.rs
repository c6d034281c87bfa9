//! `TaskStore` trait: the narrow persistence interface the core relies on.
//!
//! Backends implement the primitives. The bulk operations used by the
//! watchdog are default methods built on those primitives; a backend may
//! override them with native statements as long as each task update stays
//! atomic on its own.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::task::{DatasetRecord, DatasetType, TaskRecord, TaskStatus};

/// Diagnostic left on tasks that sat in pending past their timeout.
pub const PENDING_TIMEOUT_DIAG: &str = "timeout while in pending";

/// Task selection criteria. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQuery {
    pub vo: Option<String>,
    pub prod_source_label: Option<String>,
    /// Empty matches any status.
    pub statuses: Vec<TaskStatus>,
    pub work_queue_id: Option<i64>,
}

impl TaskQuery {
    pub fn new(vo: &str, prod_source_label: &str) -> Self {
        Self {
            vo: Some(vo.to_string()),
            prod_source_label: Some(prod_source_label.to_string()),
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[TaskStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn with_work_queue(mut self, work_queue_id: i64) -> Self {
        self.work_queue_id = Some(work_queue_id);
        self
    }

    /// In-process evaluation of the criteria.
    pub fn matches(&self, task: &TaskRecord) -> bool {
        fn eq(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().is_none_or(|w| have == Some(w))
        }
        eq(&self.vo, task.vo())
            && eq(&self.prod_source_label, task.prod_source_label())
            && (self.statuses.is_empty() || self.statuses.contains(&task.status()))
            && self
                .work_queue_id
                .is_none_or(|q| task.work_queue_id() == Some(q))
    }
}

/// Row selector for a conditional task update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateKey {
    pub task_id: i64,
    /// Only update while the stored status still equals this.
    pub expected_status: Option<TaskStatus>,
}

impl UpdateKey {
    pub fn task(task_id: i64) -> Self {
        Self {
            task_id,
            expected_status: None,
        }
    }

    pub fn with_status(task_id: i64, status: TaskStatus) -> Self {
        Self {
            task_id,
            expected_status: Some(status),
        }
    }
}

/// A work queue tasks are grouped into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueue {
    pub id: i64,
    pub name: String,
    pub vo: String,
    /// Production source label served by the queue.
    pub queue_type: String,
}

/// Resource figures measured from a task's scout jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoutJobData {
    pub task_id: i64,
    pub walltime: Option<i64>,
    pub walltime_unit: Option<String>,
    pub ram_count: Option<i64>,
    pub ram_unit: Option<String>,
    pub out_disk_count: Option<i64>,
    pub out_disk_unit: Option<String>,
}

/// Counts reported by a bulk store operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    /// Tasks matching the selection.
    pub matched: usize,
    /// Tasks actually written.
    pub updated: usize,
    /// Tasks whose write failed or lost a race.
    pub failed: usize,
}

impl BulkOutcome {
    fn record(&mut self, result: Result<bool, StoreError>, task_id: i64, operation: &str) {
        match result {
            Ok(true) => self.updated += 1,
            Ok(false) => {
                tracing::debug!(jedi_task_id = task_id, operation, "Task changed underneath, skipped");
                self.failed += 1;
            }
            Err(e) => {
                tracing::warn!(jedi_task_id = task_id, operation, "Task update failed: {}", e);
                self.failed += 1;
            }
        }
    }
}

/// Outcome of a pending-task reactivation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactivateOutcome {
    pub released: BulkOutcome,
    /// Tasks moved to `exhausted` because they were frozen too long.
    pub timed_out: BulkOutcome,
}

/// Backend-agnostic task/dataset store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create tables or apply pending migrations.
    async fn init_schema(&self) -> Result<(), StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task together with its datasets.
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    /// Fetch a task with its datasets.
    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError>;

    /// Tasks matching `query`, each with its datasets, ordered by task id.
    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError>;

    /// Write the task's changed attributes.
    ///
    /// Returns `false` when no row matched the key. The caller resets the
    /// record's change list after a successful write.
    async fn update_task(
        &self,
        task: &TaskRecord,
        key: &UpdateKey,
        stamp_modification_time: bool,
    ) -> Result<bool, StoreError>;

    // ── Datasets ────────────────────────────────────────────────────

    /// Datasets of a task restricted to `types` (empty = all).
    async fn get_datasets(
        &self,
        task_id: i64,
        types: &[DatasetType],
    ) -> Result<Vec<DatasetRecord>, StoreError>;

    async fn update_dataset(&self, dataset: &DatasetRecord) -> Result<bool, StoreError>;

    // ── Work queues ─────────────────────────────────────────────────

    async fn register_work_queue(&self, queue: &WorkQueue) -> Result<(), StoreError>;

    /// Work queues serving a VO and source label.
    async fn get_work_queues(
        &self,
        vo: &str,
        prod_source_label: &str,
    ) -> Result<Vec<WorkQueue>, StoreError>;

    // ── Cloud assignment and scout data ─────────────────────────────

    /// Record a user-requested cloud assignment.
    async fn set_cloud_task_by_user(
        &self,
        user: &str,
        task_id: i64,
        cloud: &str,
        status: TaskStatus,
    ) -> Result<bool, StoreError>;

    async fn record_scout_job_data(&self, data: &ScoutJobData) -> Result<(), StoreError>;

    async fn get_scout_job_data(&self, task_id: i64) -> Result<Option<ScoutJobData>, StoreError>;

    // ── Composite operations ────────────────────────────────────────

    /// Task/dataset projections: one pair per dataset of the requested types.
    async fn get_tasks_with_criteria(
        &self,
        query: &TaskQuery,
        dataset_types: &[DatasetType],
        master_only: bool,
    ) -> Result<Vec<(TaskRecord, DatasetRecord)>, StoreError> {
        let tasks = self.query_tasks(query).await?;
        let mut pairs = Vec::new();
        for task in tasks {
            for dataset in &task.datasets {
                let type_ok = dataset_types.is_empty() || dataset_types.contains(&dataset.dataset_type);
                if type_ok && (!master_only || dataset.is_master()) {
                    pairs.push((task.clone(), dataset.clone()));
                }
            }
        }
        Ok(pairs)
    }

    /// Tasks whose reassignment has been requested.
    async fn get_tasks_to_reassign(
        &self,
        vo: &str,
        prod_source_label: &str,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.query_tasks(&TaskQuery::new(vo, prod_source_label).with_statuses(&[TaskStatus::Reassigning]))
            .await
    }

    /// Set the effective priority of a task.
    async fn change_task_priority(&self, task_id: i64, priority: i64) -> Result<bool, StoreError> {
        let Some(mut task) = self.get_task(task_id).await? else {
            return Ok(false);
        };
        task.set_current_priority(Some(priority));
        self.update_task(&task, &UpdateKey::task(task_id), true).await
    }

    /// Store the nucleus on a task and the destinations stamped on its datasets.
    async fn set_nucleus_to_task(
        &self,
        task_id: i64,
        nucleus: &str,
        datasets: &[DatasetRecord],
    ) -> Result<bool, StoreError> {
        let Some(mut task) = self.get_task(task_id).await? else {
            return Ok(false);
        };
        task.set_nucleus(Some(nucleus));
        if task.has_changes() && !self.update_task(&task, &UpdateKey::task(task_id), false).await? {
            return Ok(false);
        }
        for dataset in datasets {
            self.update_dataset(dataset).await?;
        }
        Ok(true)
    }

    /// Clear soft locks held longer than `timeout`.
    async fn release_stale_locks(
        &self,
        vo: &str,
        prod_source_label: &str,
        timeout: TimeDelta,
    ) -> Result<BulkOutcome, StoreError> {
        let limit = Utc::now() - timeout;
        let mut outcome = BulkOutcome::default();
        for mut task in self.query_tasks(&TaskQuery::new(vo, prod_source_label)).await? {
            if task.locked_by().is_none() || !older_than(task.locked_time(), limit) {
                continue;
            }
            outcome.matched += 1;
            let key = UpdateKey::with_status(task.task_id(), task.status());
            task.set_locked_by(None);
            task.set_locked_time(None);
            let result = self.update_task(&task, &key, false).await;
            outcome.record(result, task.task_id(), "release_stale_locks");
        }
        Ok(outcome)
    }

    /// Return throttled tasks whose release time has passed.
    async fn release_throttled_tasks(
        &self,
        vo: &str,
        prod_source_label: &str,
    ) -> Result<BulkOutcome, StoreError> {
        let now = Utc::now();
        let query = TaskQuery::new(vo, prod_source_label).with_statuses(&[TaskStatus::Throttled]);
        let mut outcome = BulkOutcome::default();
        for mut task in self.query_tasks(&query).await? {
            if task.throttled_time().is_some_and(|t| t > now) {
                continue;
            }
            outcome.matched += 1;
            let key = UpdateKey::with_status(task.task_id(), TaskStatus::Throttled);
            task.release_throttle();
            let result = self.update_task(&task, &key, true).await;
            outcome.record(result, task.task_id(), "release_throttled_tasks");
        }
        Ok(outcome)
    }

    /// Throttle tasks whose master input has files on hold while every file
    /// handed out has already been consumed.
    async fn throttle_tasks(
        &self,
        vo: &str,
        prod_source_label: &str,
        wait: TimeDelta,
    ) -> Result<BulkOutcome, StoreError> {
        let now = Utc::now();
        let query = TaskQuery::new(vo, prod_source_label).with_statuses(&[
            TaskStatus::Running,
            TaskStatus::Scouting,
            TaskStatus::Ready,
        ]);
        let mut outcome = BulkOutcome::default();
        for mut task in self.query_tasks(&query).await? {
            if task.num_throttled().is_none() || task.locked_by().is_some() {
                continue;
            }
            let starved = task.master_input().is_some_and(|ds| {
                ds.n_files_on_hold > 0 && ds.n_files_used >= ds.n_files_to_be_used
            });
            if !starved {
                continue;
            }
            outcome.matched += 1;
            let key = UpdateKey::with_status(task.task_id(), task.status());
            let release_at = task.throttle(wait, now);
            tracing::info!(jedi_task_id = task.task_id(), %release_at, "Throttling task");
            let result = self.update_task(&task, &key, true).await;
            outcome.record(result, task.task_id(), "throttle_tasks");
        }
        Ok(outcome)
    }

    /// Reactivate pending tasks idle for `idle` whose priority is at least
    /// `min_priority`. Tasks frozen longer than `pending_timeout` are
    /// exhausted instead.
    async fn reactivate_pending_tasks(
        &self,
        vo: &str,
        prod_source_label: &str,
        idle: TimeDelta,
        pending_timeout: Option<TimeDelta>,
        min_priority: i64,
    ) -> Result<ReactivateOutcome, StoreError> {
        let now = Utc::now();
        let query = TaskQuery::new(vo, prod_source_label).with_statuses(&[TaskStatus::Pending]);
        let mut outcome = ReactivateOutcome::default();
        for mut task in self.query_tasks(&query).await? {
            if task.current_priority().is_none_or(|p| p < min_priority)
                || !older_than(task.modification_time(), now - idle)
            {
                continue;
            }
            let key = UpdateKey::with_status(task.task_id(), TaskStatus::Pending);
            let timed_out = pending_timeout
                .is_some_and(|limit| older_than(task.frozen_time(), now - limit));
            if timed_out {
                outcome.timed_out.matched += 1;
                task.set_status(TaskStatus::Exhausted);
                task.set_old_status(None);
                task.set_error_dialog(Some(PENDING_TIMEOUT_DIAG));
                let result = self.update_task(&task, &key, true).await;
                outcome.timed_out.record(result, task.task_id(), "exhaust_pending_task");
            } else {
                outcome.released.matched += 1;
                task.set_in_active();
                let result = self.update_task(&task, &key, true).await;
                outcome.released.record(result, task.task_id(), "reactivate_pending_task");
            }
        }
        Ok(outcome)
    }

    /// Copy scout measurements to running tasks that lack them.
    async fn set_scout_job_data_to_tasks(
        &self,
        vo: &str,
        prod_source_label: &str,
    ) -> Result<BulkOutcome, StoreError> {
        let query = TaskQuery::new(vo, prod_source_label).with_statuses(&[TaskStatus::Running]);
        let mut outcome = BulkOutcome::default();
        for mut task in self.query_tasks(&query).await? {
            if task.use_scout() || task.walltime().is_some() {
                continue;
            }
            let data = match self.get_scout_job_data(task.task_id()).await {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    outcome.matched += 1;
                    outcome.record(Err(e), task.task_id(), "get_scout_job_data");
                    continue;
                }
            };
            outcome.matched += 1;
            task.set_walltime(data.walltime);
            task.set_walltime_unit(data.walltime_unit.as_deref());
            task.set_ram_count(data.ram_count);
            task.set_ram_unit(data.ram_unit.as_deref());
            task.set_out_disk_count(data.out_disk_count);
            task.set_out_disk_unit(data.out_disk_unit.as_deref());
            let key = UpdateKey::with_status(task.task_id(), TaskStatus::Running);
            let result = self.update_task(&task, &key, false).await;
            outcome.record(result, task.task_id(), "set_scout_job_data");
        }
        Ok(outcome)
    }
}

/// `time` is set and strictly before `limit`.
fn older_than(time: Option<DateTime<Utc>>, limit: DateTime<Utc>) -> bool {
    time.is_some_and(|t| t < limit)
}
