//! Reassignment of tasks to a new cloud or nucleus.
//!
//! A task in `reassigning` either goes back to brokerage (nucleus model, no
//! nucleus yet) or has its outputs subscribed to the new destination and is
//! resumed. A subscription failure leaves the status untouched so the next
//! pass retries; only the diagnostic trail is persisted.

use futures::stream::{self, StreamExt};
use tracing::{Instrument, debug, error, info, warn};

use super::ActionSummary;
use super::engine::WatchDog;
use crate::ddm::PRODUCTION_OUTPUT_ACTIVITY;
use crate::error::{CatalogError, WatchdogError};
use crate::store::UpdateKey;
use crate::task::{DatasetRecord, DatasetType, TaskRecord, TaskStatus};
use crate::topology::NucleusSpec;

/// User recorded on cloud assignments made by the watchdog.
const CLOUD_TASK_USER: &str = "jedi";

/// What happened to a reassigned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reassigned {
    /// No nucleus yet; the task is back in `assigning`.
    Rebrokered,
    /// Outputs subscribed; the task resumed in this status.
    Activated(TaskStatus),
}

enum Destination<'a> {
    Nucleus(&'a NucleusSpec),
    Cloud(String),
}

impl WatchDog {
    pub(super) async fn reassign_tasks(&self) -> ActionSummary {
        let tasks = match self
            .call(
                "get_tasks_to_reassign",
                self.store
                    .get_tasks_to_reassign(&self.vo, &self.prod_source_label),
            )
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to get tasks to reassign: {}", e);
                return ActionSummary::call_failed();
            }
        };
        debug!(count = tasks.len(), "Got tasks to reassign");

        let results: Vec<Result<Reassigned, WatchdogError>> = stream::iter(tasks)
            .map(|task| {
                let span = tracing::info_span!("reassign", jedi_task_id = task.task_id());
                self.reassign_task(task).instrument(span)
            })
            .buffer_unordered(self.config.max_workers)
            .collect()
            .await;

        let mut summary = ActionSummary::default();
        for result in results {
            summary.processed += 1;
            match result {
                Ok(_) => summary.succeeded += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    async fn reassign_task(&self, task: TaskRecord) -> Result<Reassigned, WatchdogError> {
        debug!("Start to reassign");
        let result = self.try_reassign(task).await;
        match &result {
            Ok(outcome) => debug!(?outcome, "Finished reassign"),
            Err(e) => error!("Reassignment failed: {}", e),
        }
        result
    }

    async fn try_reassign(&self, mut task: TaskRecord) -> Result<Reassigned, WatchdogError> {
        let task_id = task.task_id();
        let ddm_back_end = task.ddm_back_end();
        let mut datasets = self
            .call(
                "get_datasets",
                self.store
                    .get_datasets(task_id, &[DatasetType::Output, DatasetType::Log]),
            )
            .await?;

        let destination = if task.use_world_cloud() {
            let Some(name) = task.nucleus().filter(|n| !n.is_empty()) else {
                task.prepare_rebrokerage();
                self.persist(&mut task).await?;
                info!(status = %task.status(), "No nucleus, task sent back to brokerage");
                return Ok(Reassigned::Rebrokered);
            };
            let nucleus = self
                .topology
                .nucleus(name)
                .ok_or_else(|| WatchdogError::Topology(format!("nucleus={name} doesn't exist")))?;
            Destination::Nucleus(nucleus)
        } else {
            let cloud = task.cloud().unwrap_or_default().to_string();
            let recorded = self
                .call(
                    "set_cloud_task_by_user",
                    self.store.set_cloud_task_by_user(
                        CLOUD_TASK_USER,
                        task_id,
                        &cloud,
                        TaskStatus::Assigning,
                    ),
                )
                .await?;
            if !recorded {
                return Err(WatchdogError::LostUpdate { task_id });
            }
            if !self.topology.cloud_exists(&cloud) {
                return Err(WatchdogError::Topology(format!("cloud={cloud} doesn't exist")));
            }
            Destination::Cloud(cloud)
        };

        for dataset in datasets.iter_mut() {
            if dataset.is_distributed() {
                debug!(dataset = %dataset.name, "Skip distributed dataset");
                continue;
            }
            let token = dataset.storage_token.as_deref();
            let location = self.subscription_location(&destination, token)?;
            debug!(
                dataset = %dataset.name,
                location = %location,
                back_end = ?ddm_back_end,
                "Registering subscription"
            );
            let subscribed = self
                .call(
                    "register_dataset_subscription",
                    self.catalog.register_dataset_subscription(
                        &dataset.name,
                        &location,
                        PRODUCTION_OUTPUT_ACTIVITY,
                        true,
                    ),
                )
                .await;
            let failure = match subscribed {
                Ok(true) => None,
                Ok(false) => Some(WatchdogError::from(CatalogError::SubscriptionFailed {
                    dataset: dataset.name.clone(),
                    location: location.clone(),
                    reason: "rejected by catalog".into(),
                })),
                Err(e) => Some(e),
            };
            if let Some(e) = failure {
                task.append_error_dialog(&format!(
                    "failed to make subscription of {} to {}.",
                    dataset.name, location
                ));
                if let Err(persist_err) = self.persist(&mut task).await {
                    warn!("Failed to record subscription failure: {}", persist_err);
                }
                return Err(e);
            }
            if let Destination::Nucleus(nucleus) = &destination {
                dataset.destination = Some(nucleus.associated_endpoint(token).to_string());
            }
        }

        if let Destination::Nucleus(nucleus) = &destination {
            let stamped: Vec<DatasetRecord> =
                datasets.into_iter().filter(|d| !d.is_distributed()).collect();
            let stored = self
                .call(
                    "set_nucleus_to_task",
                    self.store.set_nucleus_to_task(task_id, &nucleus.name, &stamped),
                )
                .await?;
            if !stored {
                return Err(WatchdogError::LostUpdate { task_id });
            }
        }

        let status = task.activate_after_reassign();
        self.persist(&mut task).await?;
        info!(%status, "Task reassigned");
        Ok(Reassigned::Activated(status))
    }

    fn subscription_location(
        &self,
        destination: &Destination<'_>,
        token: Option<&str>,
    ) -> Result<String, WatchdogError> {
        match destination {
            Destination::Nucleus(nucleus) => Ok(nucleus
                .sites
                .first()
                .and_then(|site| self.topology.ddm_endpoint(site, token))
                .unwrap_or_else(|| nucleus.associated_endpoint(token).to_string())),
            Destination::Cloud(cloud) => self
                .topology
                .cloud_destination(cloud, token)
                .ok_or_else(|| WatchdogError::Topology(format!("no destination site for cloud={cloud}"))),
        }
    }

    /// Write the task while it is still `reassigning` in the store.
    async fn persist(&self, task: &mut TaskRecord) -> Result<(), WatchdogError> {
        let task_id = task.task_id();
        let key = UpdateKey::with_status(task_id, TaskStatus::Reassigning);
        let updated = self
            .call("update_task", self.store.update_task(task, &key, true))
            .await?;
        if !updated {
            return Err(WatchdogError::LostUpdate { task_id });
        }
        task.reset_changed_list();
        Ok(())
    }
}
