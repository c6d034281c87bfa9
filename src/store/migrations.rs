//! Version-tracked schema migrations for the libSQL task store.
//!
//! `run_migrations()` reads the highest applied version from `_migrations`
//! and applies the newer steps in order.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "task_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jedi_tasks (
                jedi_task_id INTEGER PRIMARY KEY,
                task_name TEXT,
                status TEXT NOT NULL,
                old_status TEXT,
                user_name TEXT,
                creation_date TEXT,
                modification_time TEXT,
                start_time TEXT,
                end_time TEXT,
                frozen_time TEXT,
                prod_source_label TEXT,
                working_group TEXT,
                vo TEXT,
                core_count INTEGER,
                task_type TEXT,
                processing_type TEXT,
                task_priority INTEGER,
                current_priority INTEGER,
                architecture TEXT,
                trans_home TEXT,
                trans_path TEXT,
                locked_by TEXT,
                locked_time TEXT,
                term_condition TEXT,
                split_rule TEXT,
                walltime INTEGER,
                walltime_unit TEXT,
                out_disk_count INTEGER,
                out_disk_unit TEXT,
                work_disk_count INTEGER,
                work_disk_unit TEXT,
                ram_count INTEGER,
                ram_unit TEXT,
                io_intensity INTEGER,
                io_intensity_unit TEXT,
                work_queue_id INTEGER,
                progress INTEGER,
                failure_rate INTEGER,
                cloud TEXT,
                site TEXT,
                nucleus TEXT,
                num_throttled INTEGER,
                throttled_time TEXT,
                error_dialog TEXT,
                parent_tid INTEGER,
                job_params_template TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jedi_tasks_selection
                ON jedi_tasks(vo, prod_source_label, status);
            CREATE INDEX IF NOT EXISTS idx_jedi_tasks_parent ON jedi_tasks(parent_tid);

            CREATE TABLE IF NOT EXISTS jedi_datasets (
                jedi_task_id INTEGER NOT NULL REFERENCES jedi_tasks(jedi_task_id) ON DELETE CASCADE,
                dataset_id INTEGER NOT NULL,
                dataset_name TEXT NOT NULL,
                dataset_type TEXT NOT NULL,
                storage_token TEXT,
                attributes TEXT NOT NULL DEFAULT '',
                master_id INTEGER,
                template TEXT,
                destination TEXT,
                n_files INTEGER NOT NULL DEFAULT 0,
                n_files_used INTEGER NOT NULL DEFAULT 0,
                n_files_to_be_used INTEGER NOT NULL DEFAULT 0,
                n_files_finished INTEGER NOT NULL DEFAULT 0,
                n_files_failed INTEGER NOT NULL DEFAULT 0,
                n_files_on_hold INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (jedi_task_id, dataset_id)
            );
            CREATE INDEX IF NOT EXISTS idx_jedi_datasets_type
                ON jedi_datasets(jedi_task_id, dataset_type);

            CREATE TABLE IF NOT EXISTS jedi_work_queues (
                queue_id INTEGER PRIMARY KEY,
                queue_name TEXT NOT NULL,
                vo TEXT NOT NULL,
                queue_type TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "cloud_tasks_and_scout_data",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jedi_cloud_tasks (
                jedi_task_id INTEGER PRIMARY KEY,
                cloud TEXT NOT NULL,
                user_name TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS jedi_scout_data (
                jedi_task_id INTEGER PRIMARY KEY,
                walltime INTEGER,
                walltime_unit TEXT,
                ram_count INTEGER,
                ram_unit TEXT,
                out_disk_count INTEGER,
                out_disk_unit TEXT,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Task store migrations complete");
    Ok(())
}

/// Highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskAttr;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "jedi_tasks",
            "jedi_datasets",
            "jedi_work_queues",
            "jedi_cloud_tasks",
            "jedi_scout_data",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn migrations_run_on_a_spawned_task() {
        let conn = test_conn().await;
        let version = tokio::spawn(async move {
            run_migrations(&conn).await?;
            get_current_version(&conn).await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn task_table_has_a_column_per_attribute() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for attr in TaskAttr::ALL {
            let sql = format!("SELECT {} FROM jedi_tasks LIMIT 0", attr.column());
            assert!(
                conn.query(&sql, ()).await.is_ok(),
                "column {} missing",
                attr.column()
            );
        }
    }
}
