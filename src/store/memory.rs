//! In-memory task store, for tests and dry runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::{ScoutJobData, TaskQuery, TaskStore, UpdateKey, WorkQueue};
use crate::error::StoreError;
use crate::task::{DatasetRecord, DatasetType, TaskRecord, TaskStatus};

/// A user-requested cloud assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudTaskRow {
    pub task_id: i64,
    pub cloud: String,
    pub user: String,
    pub status: TaskStatus,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: BTreeMap<i64, TaskRecord>,
    work_queues: BTreeMap<i64, WorkQueue>,
    cloud_tasks: HashMap<i64, CloudTaskRow>,
    scout_data: HashMap<i64, ScoutJobData>,
}

/// Task store held in a `RwLock`. Each update is applied under one write
/// lock, which gives the same per-task atomicity a database row update has.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    inner: RwLock<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cloud assignment recorded for a task.
    pub async fn cloud_task(&self, task_id: i64) -> Option<CloudTaskRow> {
        self.inner.read().await.cloud_tasks.get(&task_id).cloned()
    }
}

/// Copy of a record as it would come back from storage: bounded text clipped,
/// timestamps filled in, change list empty.
fn persisted_copy(task: &TaskRecord) -> Result<TaskRecord, StoreError> {
    let mut stored = TaskRecord::new(task.task_id());
    for (attr, value) in task.values_map(false) {
        stored.load_value(attr, value)?;
    }
    let now = Utc::now();
    if stored.creation_date().is_none() {
        stored.set_creation_date(Some(now));
    }
    if stored.modification_time().is_none() {
        stored.set_modification_time(Some(now));
    }
    stored.job_params_template = task.job_params_template.clone();
    stored.datasets = task.datasets.clone();
    stored.reset_changed_list();
    Ok(stored)
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let stored = persisted_copy(task)?;
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.task_id()) {
            return Err(StoreError::Duplicate {
                task_id: task.task_id(),
            });
        }
        debug!(jedi_task_id = task.task_id(), "Inserted task");
        inner.tasks.insert(task.task_id(), stored);
        Ok(())
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.inner.read().await.tasks.get(&task_id).cloned())
    }

    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect())
    }

    async fn update_task(
        &self,
        task: &TaskRecord,
        key: &UpdateKey,
        stamp_modification_time: bool,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(stored) = inner.tasks.get_mut(&key.task_id) else {
            return Ok(false);
        };
        if key.expected_status.is_some_and(|s| s != stored.status()) {
            return Ok(false);
        }
        for (attr, value) in task.values_map(true) {
            stored.load_value(attr, value)?;
        }
        if stamp_modification_time {
            stored.set_modification_time(Some(Utc::now()));
        }
        stored.reset_changed_list();
        Ok(true)
    }

    async fn get_datasets(
        &self,
        task_id: i64,
        types: &[DatasetType],
    ) -> Result<Vec<DatasetRecord>, StoreError> {
        let inner = self.inner.read().await;
        let Some(task) = inner.tasks.get(&task_id) else {
            return Ok(Vec::new());
        };
        Ok(task
            .datasets
            .iter()
            .filter(|d| types.is_empty() || types.contains(&d.dataset_type))
            .cloned()
            .collect())
    }

    async fn update_dataset(&self, dataset: &DatasetRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&dataset.task_id) else {
            return Ok(false);
        };
        match task
            .datasets
            .iter_mut()
            .find(|d| d.dataset_id == dataset.dataset_id)
        {
            Some(slot) => {
                *slot = dataset.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn register_work_queue(&self, queue: &WorkQueue) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .work_queues
            .insert(queue.id, queue.clone());
        Ok(())
    }

    async fn get_work_queues(
        &self,
        vo: &str,
        prod_source_label: &str,
    ) -> Result<Vec<WorkQueue>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .work_queues
            .values()
            .filter(|q| q.vo == vo && q.queue_type == prod_source_label)
            .cloned()
            .collect())
    }

    async fn set_cloud_task_by_user(
        &self,
        user: &str,
        task_id: i64,
        cloud: &str,
        status: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&task_id) {
            return Ok(false);
        }
        inner.cloud_tasks.insert(
            task_id,
            CloudTaskRow {
                task_id,
                cloud: cloud.to_string(),
                user: user.to_string(),
                status,
            },
        );
        Ok(true)
    }

    async fn record_scout_job_data(&self, data: &ScoutJobData) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .scout_data
            .insert(data.task_id, data.clone());
        Ok(())
    }

    async fn get_scout_job_data(&self, task_id: i64) -> Result<Option<ScoutJobData>, StoreError> {
        Ok(self.inner.read().await.scout_data.get(&task_id).cloned())
    }
}
