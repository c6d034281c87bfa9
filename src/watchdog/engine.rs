use std::future::Future;
use std::sync::Arc;

use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use super::{ActionSummary, WatchdogReport};
use crate::config::WatchdogConfig;
use crate::ddm::DataCatalog;
use crate::error::WatchdogError;
use crate::store::{TaskQuery, TaskStore};
use crate::timeout;
use crate::task::{DatasetType, TaskStatus};
use crate::topology::SiteMapper;

/// Watchdog for one VO and production source label.
pub struct WatchDog {
    pub(super) config: WatchdogConfig,
    pub(super) store: Arc<dyn TaskStore>,
    pub(super) catalog: Arc<dyn DataCatalog>,
    pub(super) topology: Arc<dyn SiteMapper>,
    pub(super) vo: String,
    pub(super) prod_source_label: String,
}

impl WatchDog {
    pub fn new(
        config: WatchdogConfig,
        store: Arc<dyn TaskStore>,
        catalog: Arc<dyn DataCatalog>,
        topology: Arc<dyn SiteMapper>,
        vo: impl Into<String>,
        prod_source_label: impl Into<String>,
    ) -> Self {
        Self {
            config,
            store,
            catalog,
            topology,
            vo: vo.into(),
            prod_source_label: prod_source_label.into(),
        }
    }

    pub fn vo(&self) -> &str {
        &self.vo
    }

    pub fn prod_source_label(&self) -> &str {
        &self.prod_source_label
    }

    /// Run one pass of every action.
    pub async fn do_action(&self) -> WatchdogReport {
        let pass_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "watchdog_pass",
            pass = %pass_id,
            vo = %self.vo,
            prod_source_label = %self.prod_source_label,
        );
        self.run_pass(pass_id).instrument(span).await
    }

    async fn run_pass(&self, pass_id: Uuid) -> WatchdogReport {
        debug!("Watchdog pass started");
        let mut report = WatchdogReport::new(pass_id);

        report.stale_locks = self.release_stale_locks().await;
        report.priority_boost = self.boost_priorities().await;
        report.reassign = self.reassign_tasks().await;
        report.throttle_release = self.release_throttled().await;
        report.throttle = self.throttle().await;
        for &(min_priority, idle) in &self.config.high_prio_pending {
            let summary = self.reactivate_high_prio_pending(min_priority, idle).await;
            report.pending_reactivation.push((min_priority, summary));
        }
        report.scout_data = self.set_scout_job_data().await;

        info!(
            reassigned = report.reassign.succeeded,
            throttled = report.throttle.succeeded,
            failed = report.total_failed(),
            "Watchdog pass done"
        );
        report
    }

    /// Await a store or catalog call with the configured timeout.
    pub(super) async fn call<T, E>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, WatchdogError>
    where
        WatchdogError: From<E>,
    {
        timeout::bounded(operation, self.config.call_timeout, fut).await
    }

    async fn release_stale_locks(&self) -> ActionSummary {
        let result = self
            .call(
                "release_stale_locks",
                self.store
                    .release_stale_locks(&self.vo, &self.prod_source_label, self.config.lock_timeout),
            )
            .await;
        match result {
            Ok(outcome) => {
                if outcome.matched > 0 {
                    info!(released = outcome.updated, "Released stale task locks");
                }
                outcome.into()
            }
            Err(e) => {
                error!("Failed to release stale locks: {}", e);
                ActionSummary::call_failed()
            }
        }
    }

    /// Raise nearly finished running tasks to the boosted priority.
    async fn boost_priorities(&self) -> ActionSummary {
        let mut summary = ActionSummary::default();
        let boosted = self.config.boosted_priority;

        let queues = match self
            .call(
                "get_work_queues",
                self.store.get_work_queues(&self.vo, &self.prod_source_label),
            )
            .await
        {
            Ok(queues) => queues,
            Err(e) => {
                error!("Failed to list work queues: {}", e);
                return ActionSummary::call_failed();
            }
        };

        for queue in queues {
            debug!(work_queue = %queue.name, "Checking work queue for priority boost");
            let query = TaskQuery::new(&self.vo, &self.prod_source_label)
                .with_statuses(&[TaskStatus::Running])
                .with_work_queue(queue.id);
            let pairs = match self
                .call(
                    "get_tasks_with_criteria",
                    self.store.get_tasks_with_criteria(
                        &query,
                        &[DatasetType::Input, DatasetType::PseudoInput],
                        true,
                    ),
                )
                .await
            {
                Ok(pairs) => pairs,
                Err(e) => {
                    error!(work_queue = %queue.name, "Failed to get tasks to boost: {}", e);
                    summary.failed += 1;
                    continue;
                }
            };

            for (task, dataset) in pairs {
                summary.processed += 1;
                let task_id = task.task_id();
                if task.current_priority().is_some_and(|p| p >= boosted) {
                    summary.skipped += 1;
                    continue;
                }
                let Some(ratio) = dataset.completion_ratio() else {
                    summary.skipped += 1;
                    continue;
                };
                info!(
                    jedi_task_id = task_id,
                    n_files = dataset.n_files,
                    n_files_finished_failed = dataset.n_files_finished + dataset.n_files_failed,
                    "Checked task progress"
                );
                if ratio < self.config.boost_ratio {
                    summary.skipped += 1;
                    continue;
                }

                info!(jedi_task_id = task_id, priority = boosted, "Boosting task priority");
                match self
                    .call(
                        "change_task_priority",
                        self.store.change_task_priority(task_id, boosted),
                    )
                    .await
                {
                    Ok(true) => summary.succeeded += 1,
                    Ok(false) => {
                        warn!(jedi_task_id = task_id, "Task vanished before priority boost");
                        summary.failed += 1;
                    }
                    Err(e) => {
                        warn!(jedi_task_id = task_id, "Priority boost failed: {}", e);
                        summary.failed += 1;
                    }
                }
            }
        }
        summary
    }

    async fn release_throttled(&self) -> ActionSummary {
        match self
            .call(
                "release_throttled_tasks",
                self.store
                    .release_throttled_tasks(&self.vo, &self.prod_source_label),
            )
            .await
        {
            Ok(outcome) => {
                debug!(released = outcome.updated, "Released throttled tasks");
                outcome.into()
            }
            Err(e) => {
                error!("Failed to release throttled tasks: {}", e);
                ActionSummary::call_failed()
            }
        }
    }

    async fn throttle(&self) -> ActionSummary {
        match self
            .call(
                "throttle_tasks",
                self.store.throttle_tasks(
                    &self.vo,
                    &self.prod_source_label,
                    self.config.wait_for_throttled,
                ),
            )
            .await
        {
            Ok(outcome) => {
                debug!(throttled = outcome.updated, "Throttled tasks");
                outcome.into()
            }
            Err(e) => {
                error!("Failed to throttle tasks: {}", e);
                ActionSummary::call_failed()
            }
        }
    }

    async fn reactivate_high_prio_pending(
        &self,
        min_priority: i64,
        idle: chrono::TimeDelta,
    ) -> ActionSummary {
        let pending_timeout = self
            .config
            .timeout_for_pending(&self.vo, &self.prod_source_label);
        match self
            .call(
                "reactivate_pending_tasks",
                self.store.reactivate_pending_tasks(
                    &self.vo,
                    &self.prod_source_label,
                    idle,
                    pending_timeout,
                    min_priority,
                ),
            )
            .await
        {
            Ok(outcome) => {
                info!(
                    min_priority,
                    reactivated = outcome.released.updated,
                    exhausted = outcome.timed_out.updated,
                    "Reactivated high priority pending tasks"
                );
                outcome.into()
            }
            Err(e) => {
                error!(min_priority, "Failed to reactivate high priority tasks: {}", e);
                ActionSummary::call_failed()
            }
        }
    }

    async fn set_scout_job_data(&self) -> ActionSummary {
        match self
            .call(
                "set_scout_job_data_to_tasks",
                self.store
                    .set_scout_job_data_to_tasks(&self.vo, &self.prod_source_label),
            )
            .await
        {
            Ok(outcome) => {
                info!(updated = outcome.updated, "Set scout job data");
                outcome.into()
            }
            Err(e) => {
                error!("Failed to set scout job data: {}", e);
                ActionSummary::call_failed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ddm::DryRunCatalog;
    use crate::error::StoreError;
    use crate::store::MemoryTaskStore;
    use crate::topology::StaticTopology;

    fn watchdog(timeout: Duration) -> WatchDog {
        let config = WatchdogConfig {
            call_timeout: timeout,
            ..WatchdogConfig::default()
        };
        WatchDog::new(
            config,
            Arc::new(MemoryTaskStore::new()),
            Arc::new(DryRunCatalog::new()),
            Arc::new(StaticTopology::new()),
            "atlas",
            "managed",
        )
    }

    #[tokio::test]
    async fn call_maps_store_errors() {
        let dog = watchdog(Duration::from_secs(1));
        let err = dog
            .call("get_task", async {
                Err::<(), _>(StoreError::TaskNotFound { task_id: 7 })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WatchdogError::Store(StoreError::TaskNotFound { task_id: 7 })));
    }

    #[tokio::test]
    async fn call_times_out() {
        let dog = watchdog(Duration::from_millis(50));
        let err = dog
            .call("slow", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WatchdogError::Timeout { ref operation, .. } if operation == "slow"));
    }

    #[tokio::test]
    async fn empty_store_pass_is_clean() {
        let dog = watchdog(Duration::from_secs(1));
        let report = dog.do_action().await;
        assert_eq!(report.total_failed(), 0);
        assert_eq!(report.pending_reactivation.len(), 2);
        assert_eq!(report.pending_reactivation[0].0, 950);
        assert_eq!(report.reassign, ActionSummary::default());
    }
}
