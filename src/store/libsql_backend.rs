//! libSQL backend for the task store.
//!
//! Task columns are driven by the attribute registry: selects list every
//! `TaskAttr` column in registry order, and updates write only the record's
//! changed attributes with positional parameters.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{ScoutJobData, TaskQuery, TaskStore, UpdateKey, WorkQueue};
use crate::task::{AttrValue, DatasetRecord, DatasetType, TaskAttr, TaskRecord, TaskStatus};

const DATASET_COLUMNS: &str = "jedi_task_id, dataset_id, dataset_name, dataset_type, storage_token, \
     attributes, master_id, template, destination, n_files, n_files_used, n_files_to_be_used, \
     n_files_finished, n_files_failed, n_files_on_hold";

/// libSQL task store.
///
/// One connection is shared by all operations; `libsql::Connection` is
/// `Send + Sync`.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db)?;
        store.init_schema().await?;
        info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// In-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        let store = Self::from_database(db)?;
        store.init_schema().await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn load_datasets(&self, task_id: i64) -> Result<Vec<DatasetRecord>, StoreError> {
        let sql = format!(
            "SELECT {DATASET_COLUMNS} FROM jedi_datasets WHERE jedi_task_id = ?1 ORDER BY dataset_id"
        );
        let mut rows = self
            .conn()
            .query(&sql, libsql::params![task_id])
            .await
            .map_err(|e| StoreError::Query(format!("get_datasets: {e}")))?;

        let mut datasets = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_datasets row: {e}")))?
        {
            datasets.push(row_to_dataset(&row)?);
        }
        Ok(datasets)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn task_columns() -> String {
    let mut columns: Vec<&str> = TaskAttr::ALL.iter().map(|a| a.column()).collect();
    columns.push("job_params_template");
    columns.join(", ")
}

fn to_sql_value(value: AttrValue) -> Value {
    match value {
        AttrValue::Null => Value::Null,
        AttrValue::Int(v) => Value::Integer(v),
        AttrValue::Text(s) => Value::Text(s),
        AttrValue::Time(t) => Value::Text(t.to_rfc3339()),
    }
}

fn from_sql_value(value: Value, column: &str) -> Result<AttrValue, StoreError> {
    match value {
        Value::Null => Ok(AttrValue::Null),
        Value::Integer(v) => Ok(AttrValue::Int(v)),
        Value::Real(f) => Ok(AttrValue::Int(f as i64)),
        Value::Text(s) => Ok(AttrValue::Text(s)),
        Value::Blob(_) => Err(StoreError::Corrupt {
            column: column.to_string(),
            message: "unexpected blob".into(),
        }),
    }
}

fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

fn opt_int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

fn column_value(row: &libsql::Row, idx: i32, column: &str) -> Result<Value, StoreError> {
    row.get_value(idx)
        .map_err(|e| StoreError::Query(format!("read {column}: {e}")))
}

fn column_text(row: &libsql::Row, idx: i32, column: &str) -> Result<Option<String>, StoreError> {
    match column_value(row, idx, column)? {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s)),
        other => Err(StoreError::Corrupt {
            column: column.to_string(),
            message: format!("expected text, got {other:?}"),
        }),
    }
}

fn column_int(row: &libsql::Row, idx: i32, column: &str) -> Result<Option<i64>, StoreError> {
    match column_value(row, idx, column)? {
        Value::Null => Ok(None),
        Value::Integer(v) => Ok(Some(v)),
        other => Err(StoreError::Corrupt {
            column: column.to_string(),
            message: format!("expected integer, got {other:?}"),
        }),
    }
}

/// Map a row selected with `task_columns()` to a record without datasets.
fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, StoreError> {
    let mut task = TaskRecord::new(0);
    for (idx, attr) in TaskAttr::ALL.iter().enumerate() {
        let value = column_value(row, idx as i32, attr.column())?;
        task.load_value(*attr, from_sql_value(value, attr.column())?)?;
    }
    task.job_params_template =
        column_text(row, TaskAttr::ALL.len() as i32, "job_params_template")?;
    task.reset_changed_list();
    Ok(task)
}

/// Column order matches `DATASET_COLUMNS`.
fn row_to_dataset(row: &libsql::Row) -> Result<DatasetRecord, StoreError> {
    let count = |idx: i32, column: &str| -> Result<i64, StoreError> {
        Ok(column_int(row, idx, column)?.unwrap_or(0))
    };
    let task_id = count(0, "jedi_task_id")?;
    let name = column_text(row, 2, "dataset_name")?.unwrap_or_default();
    let type_text = column_text(row, 3, "dataset_type")?.unwrap_or_default();
    let dataset_type: DatasetType = type_text.parse().map_err(|message| StoreError::Corrupt {
        column: "dataset_type".into(),
        message,
    })?;

    let mut dataset = DatasetRecord::new(task_id, name, dataset_type);
    dataset.dataset_id = count(1, "dataset_id")?;
    dataset.storage_token = column_text(row, 4, "storage_token")?;
    dataset.set_attributes_string(&column_text(row, 5, "attributes")?.unwrap_or_default());
    dataset.master_id = column_int(row, 6, "master_id")?;
    dataset.template = column_text(row, 7, "template")?;
    dataset.destination = column_text(row, 8, "destination")?;
    dataset.n_files = count(9, "n_files")?;
    dataset.n_files_used = count(10, "n_files_used")?;
    dataset.n_files_to_be_used = count(11, "n_files_to_be_used")?;
    dataset.n_files_finished = count(12, "n_files_finished")?;
    dataset.n_files_failed = count(13, "n_files_failed")?;
    dataset.n_files_on_hold = count(14, "n_files_on_hold")?;
    Ok(dataset)
}

fn dataset_values(dataset: &DatasetRecord) -> Vec<Value> {
    vec![
        Value::Integer(dataset.task_id),
        Value::Integer(dataset.dataset_id),
        Value::Text(dataset.name.clone()),
        Value::Text(dataset.dataset_type.as_str().to_string()),
        opt_text(dataset.storage_token.as_deref()),
        Value::Text(dataset.attributes_string()),
        opt_int(dataset.master_id),
        opt_text(dataset.template.as_deref()),
        opt_text(dataset.destination.as_deref()),
        Value::Integer(dataset.n_files),
        Value::Integer(dataset.n_files_used),
        Value::Integer(dataset.n_files_to_be_used),
        Value::Integer(dataset.n_files_finished),
        Value::Integer(dataset.n_files_failed),
        Value::Integer(dataset.n_files_on_hold),
    ]
}

fn placeholders(from: usize, count: usize) -> String {
    (from..from + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── TaskStore implementation ────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut values: Vec<Value> = Vec::with_capacity(TaskAttr::ALL.len() + 1);
        for (attr, value) in task.values_map(false) {
            let value = match (attr, value) {
                (TaskAttr::CreationDate | TaskAttr::ModificationTime, AttrValue::Null) => {
                    AttrValue::Time(now)
                }
                (_, value) => value,
            };
            values.push(to_sql_value(value));
        }
        values.push(opt_text(task.job_params_template.as_deref()));

        let sql = format!(
            "INSERT INTO jedi_tasks ({}) VALUES ({})",
            task_columns(),
            placeholders(1, values.len())
        );

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| StoreError::Query(format!("insert_task begin: {e}")))?;
        tx.execute(&sql, Params::Positional(values)).await.map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                StoreError::Duplicate {
                    task_id: task.task_id(),
                }
            } else {
                StoreError::Query(format!("insert_task: {e}"))
            }
        })?;

        let dataset_sql = format!(
            "INSERT INTO jedi_datasets ({DATASET_COLUMNS}) VALUES ({})",
            placeholders(1, 15)
        );
        for dataset in &task.datasets {
            tx.execute(&dataset_sql, Params::Positional(dataset_values(dataset)))
                .await
                .map_err(|e| StoreError::Query(format!("insert_dataset {}: {e}", dataset.name)))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("insert_task commit: {e}")))?;

        debug!(jedi_task_id = task.task_id(), datasets = task.datasets.len(), "Inserted task");
        Ok(())
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM jedi_tasks WHERE jedi_task_id = ?1",
            task_columns()
        );
        let mut rows = self
            .conn()
            .query(&sql, libsql::params![task_id])
            .await
            .map_err(|e| StoreError::Query(format!("get_task: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_task row: {e}")))?
        else {
            return Ok(None);
        };
        let mut task = row_to_task(&row)?;
        task.datasets = self.load_datasets(task_id).await?;
        Ok(Some(task))
    }

    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        let mut bind = |clause: &str, value: Value, values: &mut Vec<Value>| {
            values.push(value);
            clauses.push(format!("{clause} ?{}", values.len()));
        };
        if let Some(vo) = &query.vo {
            bind("vo =", Value::Text(vo.clone()), &mut values);
        }
        if let Some(label) = &query.prod_source_label {
            bind("prod_source_label =", Value::Text(label.clone()), &mut values);
        }
        if let Some(queue) = query.work_queue_id {
            bind("work_queue_id =", Value::Integer(queue), &mut values);
        }
        if !query.statuses.is_empty() {
            let start = values.len() + 1;
            for status in &query.statuses {
                values.push(Value::Text(status.as_str().to_string()));
            }
            clauses.push(format!(
                "status IN ({})",
                placeholders(start, query.statuses.len())
            ));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM jedi_tasks{where_clause} ORDER BY jedi_task_id",
            task_columns()
        );

        let mut rows = self
            .conn()
            .query(&sql, Params::Positional(values))
            .await
            .map_err(|e| StoreError::Query(format!("query_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("query_tasks row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        for task in &mut tasks {
            task.datasets = self.load_datasets(task.task_id()).await?;
        }
        Ok(tasks)
    }

    async fn update_task(
        &self,
        task: &TaskRecord,
        key: &UpdateKey,
        stamp_modification_time: bool,
    ) -> Result<bool, StoreError> {
        let mut sets = Vec::new();
        let mut values = Vec::new();
        for (attr, value) in task.values_map(true) {
            if stamp_modification_time && attr == TaskAttr::ModificationTime {
                continue;
            }
            values.push(to_sql_value(value));
            sets.push(format!("{} = ?{}", attr.column(), values.len()));
        }
        if stamp_modification_time {
            values.push(Value::Text(Utc::now().to_rfc3339()));
            sets.push(format!("modification_time = ?{}", values.len()));
        }
        if sets.is_empty() {
            sets.push("jedi_task_id = jedi_task_id".to_string());
        }

        values.push(Value::Integer(key.task_id));
        let mut where_clause = format!("jedi_task_id = ?{}", values.len());
        if let Some(status) = key.expected_status {
            values.push(Value::Text(status.as_str().to_string()));
            where_clause.push_str(&format!(" AND status = ?{}", values.len()));
        }

        let sql = format!("UPDATE jedi_tasks SET {} WHERE {where_clause}", sets.join(", "));
        let affected = self
            .conn()
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(|e| StoreError::Query(format!("update_task: {e}")))?;
        Ok(affected > 0)
    }

    async fn get_datasets(
        &self,
        task_id: i64,
        types: &[DatasetType],
    ) -> Result<Vec<DatasetRecord>, StoreError> {
        let datasets = self.load_datasets(task_id).await?;
        Ok(datasets
            .into_iter()
            .filter(|d| types.is_empty() || types.contains(&d.dataset_type))
            .collect())
    }

    async fn update_dataset(&self, dataset: &DatasetRecord) -> Result<bool, StoreError> {
        let mut values = dataset_values(dataset);
        // Key columns go last.
        let key: Vec<Value> = values.drain(..2).collect();
        values.extend(key);
        let affected = self
            .conn()
            .execute(
                "UPDATE jedi_datasets SET dataset_name = ?1, dataset_type = ?2, storage_token = ?3,
                    attributes = ?4, master_id = ?5, template = ?6, destination = ?7, n_files = ?8,
                    n_files_used = ?9, n_files_to_be_used = ?10, n_files_finished = ?11,
                    n_files_failed = ?12, n_files_on_hold = ?13
                 WHERE jedi_task_id = ?14 AND dataset_id = ?15",
                Params::Positional(values),
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_dataset: {e}")))?;
        Ok(affected > 0)
    }

    async fn register_work_queue(&self, queue: &WorkQueue) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO jedi_work_queues (queue_id, queue_name, vo, queue_type)
                 VALUES (?1, ?2, ?3, ?4)",
                libsql::params![
                    queue.id,
                    queue.name.as_str(),
                    queue.vo.as_str(),
                    queue.queue_type.as_str()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("register_work_queue: {e}")))?;
        Ok(())
    }

    async fn get_work_queues(
        &self,
        vo: &str,
        prod_source_label: &str,
    ) -> Result<Vec<WorkQueue>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT queue_id, queue_name, vo, queue_type FROM jedi_work_queues
                 WHERE vo = ?1 AND queue_type = ?2 ORDER BY queue_id",
                libsql::params![vo, prod_source_label],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_work_queues: {e}")))?;

        let mut queues = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_work_queues row: {e}")))?
        {
            queues.push(WorkQueue {
                id: column_int(&row, 0, "queue_id")?.unwrap_or_default(),
                name: column_text(&row, 1, "queue_name")?.unwrap_or_default(),
                vo: column_text(&row, 2, "vo")?.unwrap_or_default(),
                queue_type: column_text(&row, 3, "queue_type")?.unwrap_or_default(),
            });
        }
        Ok(queues)
    }

    async fn set_cloud_task_by_user(
        &self,
        user: &str,
        task_id: i64,
        cloud: &str,
        status: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jedi_tasks WHERE jedi_task_id = ?1",
                libsql::params![task_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_cloud_task_by_user: {e}")))?;
        let exists = match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("set_cloud_task_by_user row: {e}")))?
        {
            Some(row) => column_int(&row, 0, "count")?.unwrap_or(0) > 0,
            None => false,
        };
        if !exists {
            return Ok(false);
        }

        self.conn()
            .execute(
                "INSERT OR REPLACE INTO jedi_cloud_tasks (jedi_task_id, cloud, user_name, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                libsql::params![
                    task_id,
                    cloud,
                    user,
                    status.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_cloud_task_by_user: {e}")))?;
        Ok(true)
    }

    async fn record_scout_job_data(&self, data: &ScoutJobData) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO jedi_scout_data
                    (jedi_task_id, walltime, walltime_unit, ram_count, ram_unit, out_disk_count, out_disk_unit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                Params::Positional(vec![
                    Value::Integer(data.task_id),
                    opt_int(data.walltime),
                    opt_text(data.walltime_unit.as_deref()),
                    opt_int(data.ram_count),
                    opt_text(data.ram_unit.as_deref()),
                    opt_int(data.out_disk_count),
                    opt_text(data.out_disk_unit.as_deref()),
                ]),
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_scout_job_data: {e}")))?;
        Ok(())
    }

    async fn get_scout_job_data(&self, task_id: i64) -> Result<Option<ScoutJobData>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT walltime, walltime_unit, ram_count, ram_unit, out_disk_count, out_disk_unit
                 FROM jedi_scout_data WHERE jedi_task_id = ?1",
                libsql::params![task_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_scout_job_data: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_scout_job_data row: {e}")))?
        else {
            return Ok(None);
        };
        Ok(Some(ScoutJobData {
            task_id,
            walltime: column_int(&row, 0, "walltime")?,
            walltime_unit: column_text(&row, 1, "walltime_unit")?,
            ram_count: column_int(&row, 2, "ram_count")?,
            ram_unit: column_text(&row, 3, "ram_unit")?,
            out_disk_count: column_int(&row, 4, "out_disk_count")?,
            out_disk_unit: column_text(&row, 5, "out_disk_unit")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::task::SplitRule;

    fn sample_task(id: i64) -> TaskRecord {
        let mut task = TaskRecord::new(id);
        task.set_vo(Some("atlas"));
        task.set_prod_source_label(Some("managed"));
        task.set_status(TaskStatus::Running);
        task.set_task_name(Some("mc16.simul"));
        task.set_split_rule(SplitRule::parse("NF=50,UB=1"));
        task.set_current_priority(Some(800));
        task.job_params_template = Some("--inputFile=${IN}".into());

        let mut input = DatasetRecord::new(id, "mc16.123.evgen.EVNT.e1", DatasetType::Input);
        input.dataset_id = 1;
        input.n_files = 20;
        let mut output = DatasetRecord::new(id, "mc16.123.simul.HITS.s1", DatasetType::Output);
        output.dataset_id = 2;
        output.template = Some("HITS.pool.root.1".into());
        output.add_attribute("repeat");
        task.datasets = vec![input, output];
        task
    }

    #[tokio::test]
    async fn insert_and_read_back() {
        let store = LibSqlTaskStore::new_memory().await.unwrap();
        store.insert_task(&sample_task(100)).await.unwrap();

        let task = store.get_task(100).await.unwrap().unwrap();
        assert_eq!(task.task_id(), 100);
        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(task.num_files_per_job(), Some(50));
        assert!(task.use_build());
        assert_eq!(task.job_params_template.as_deref(), Some("--inputFile=${IN}"));
        assert!(task.creation_date().is_some());
        assert!(!task.has_changes());

        assert_eq!(task.datasets.len(), 2);
        assert_eq!(task.datasets[1].template.as_deref(), Some("HITS.pool.root.1"));
        assert!(task.datasets[1].has_attribute("repeat"));

        assert!(store.get_task(101).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_is_reported() {
        let store = LibSqlTaskStore::new_memory().await.unwrap();
        store.insert_task(&sample_task(1)).await.unwrap();
        let err = store.insert_task(&sample_task(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { task_id: 1 }));
    }

    #[tokio::test]
    async fn update_is_conditional_on_status() {
        let store = LibSqlTaskStore::new_memory().await.unwrap();
        store.insert_task(&sample_task(7)).await.unwrap();

        let mut task = store.get_task(7).await.unwrap().unwrap();
        task.set_on_hold();
        assert!(
            !store
                .update_task(&task, &UpdateKey::with_status(7, TaskStatus::Ready), true)
                .await
                .unwrap()
        );
        assert!(
            store
                .update_task(&task, &UpdateKey::with_status(7, TaskStatus::Running), true)
                .await
                .unwrap()
        );

        let stored = store.get_task(7).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Pending);
        assert_eq!(stored.old_status(), Some(TaskStatus::Running));
        assert!(stored.frozen_time().is_some());
    }

    #[tokio::test]
    async fn query_filters_by_status_and_queue() {
        let store = LibSqlTaskStore::new_memory().await.unwrap();
        let mut a = sample_task(1);
        a.set_work_queue_id(Some(3));
        store.insert_task(&a).await.unwrap();
        let mut b = sample_task(2);
        b.set_status(TaskStatus::Pending);
        store.insert_task(&b).await.unwrap();

        let running = store
            .query_tasks(&TaskQuery::new("atlas", "managed").with_statuses(&[TaskStatus::Running]))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id(), 1);
        assert_eq!(running[0].datasets.len(), 2);

        let queued = store
            .query_tasks(&TaskQuery::new("atlas", "managed").with_work_queue(3))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);

        let other_vo = store.query_tasks(&TaskQuery::new("cms", "managed")).await.unwrap();
        assert!(other_vo.is_empty());
    }

    #[tokio::test]
    async fn dataset_update_and_type_filter() {
        let store = LibSqlTaskStore::new_memory().await.unwrap();
        store.insert_task(&sample_task(3)).await.unwrap();

        let mut outputs = store.get_datasets(3, &[DatasetType::Output]).await.unwrap();
        assert_eq!(outputs.len(), 1);
        outputs[0].destination = Some("CERN-PROD_DATADISK".into());
        assert!(store.update_dataset(&outputs[0]).await.unwrap());

        let again = store.get_datasets(3, &[DatasetType::Output]).await.unwrap();
        assert_eq!(again[0].destination.as_deref(), Some("CERN-PROD_DATADISK"));
    }

    #[tokio::test]
    async fn work_queues_cloud_tasks_and_scout_data() {
        let store = LibSqlTaskStore::new_memory().await.unwrap();
        store.insert_task(&sample_task(4)).await.unwrap();

        let queue = WorkQueue {
            id: 3,
            name: "MCore".into(),
            vo: "atlas".into(),
            queue_type: "managed".into(),
        };
        store.register_work_queue(&queue).await.unwrap();
        assert_eq!(store.get_work_queues("atlas", "managed").await.unwrap(), vec![queue]);
        assert!(store.get_work_queues("atlas", "test").await.unwrap().is_empty());

        assert!(store.set_cloud_task_by_user("watchdog", 4, "DE", TaskStatus::Reassigning).await.unwrap());
        assert!(!store.set_cloud_task_by_user("watchdog", 99, "DE", TaskStatus::Reassigning).await.unwrap());

        let data = ScoutJobData {
            task_id: 4,
            walltime: Some(120),
            walltime_unit: None,
            ram_count: Some(1800),
            ram_unit: Some("MB".into()),
            out_disk_count: None,
            out_disk_unit: None,
        };
        store.record_scout_job_data(&data).await.unwrap();
        assert_eq!(store.get_scout_job_data(4).await.unwrap(), Some(data));
        assert_eq!(store.get_scout_job_data(5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bulk_lock_release_works_against_sql() {
        let store = LibSqlTaskStore::new_memory().await.unwrap();
        let mut task = sample_task(9);
        task.set_locked_by(Some("jedi-brokerage"));
        task.set_locked_time(Some(Utc::now() - TimeDelta::hours(3)));
        store.insert_task(&task).await.unwrap();

        let outcome = store
            .release_stale_locks("atlas", "managed", TimeDelta::minutes(60))
            .await
            .unwrap();
        assert_eq!(outcome.updated, 1);
        let stored = store.get_task(9).await.unwrap().unwrap();
        assert_eq!(stored.locked_by(), None);
        assert_eq!(stored.locked_time(), None);
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jedi.db");
        {
            let store = LibSqlTaskStore::new_local(&path).await.unwrap();
            store.insert_task(&sample_task(11)).await.unwrap();
        }
        let store = LibSqlTaskStore::new_local(&path).await.unwrap();
        assert!(store.get_task(11).await.unwrap().is_some());
    }
}
