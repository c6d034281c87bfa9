//! Task refinement: turn submitted parameters into a persist-ready task.
//!
//! Refinement is all-or-nothing. Every failure is logged with the task id and
//! returned to the caller; nothing is written to the store here, so a failed
//! refinement never leaves a half-built task behind.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info};

use super::job_params::{add_event_service_params, render_template, versioned_output_template};
use super::params::{JobParamKind, TaskParams};
use crate::config::DEFAULT_CALL_TIMEOUT;
use crate::ddm::naming;
use crate::ddm::{DataCatalog, TRANSIENT_METADATA_KEY};
use crate::error::RefineError;
use crate::store::TaskStore;
use crate::task::dataset::{ATTR_CONSISTENCY_CHECK, ATTR_NOSPLIT, ATTR_REPEAT};
use crate::task::{
    DatasetRecord, DatasetType, DdmBackEnd, GroupBoundary, SplitOption, TaskRecord, TaskStatus,
};
use crate::timeout;

/// Processing type of merge tasks.
const MERGE_PROCESSING_TYPE: &str = "merge";

/// Refines submitted tasks.
pub struct TaskRefiner {
    store: Arc<dyn TaskStore>,
    catalog: Arc<dyn DataCatalog>,
    call_timeout: Duration,
}

impl TaskRefiner {
    pub fn new(store: Arc<dyn TaskStore>, catalog: Arc<dyn DataCatalog>) -> Self {
        Self {
            store,
            catalog,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound each store and catalog call by `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Refine `task` from `params`. The returned record carries its datasets
    /// and job-parameter template and has status `defined`.
    pub async fn refine(&self, task: TaskRecord, params: TaskParams) -> Result<TaskRecord, RefineError> {
        let task_id = task.task_id();
        debug!(jedi_task_id = task_id, task_type = ?params.task_type, "Refining task");
        match self.do_refine(task, params).await {
            Ok(task) => {
                info!(
                    jedi_task_id = task_id,
                    datasets = task.datasets.len(),
                    split_rule = %task.split_rule(),
                    "Task refined"
                );
                Ok(task)
            }
            Err(e) => {
                error!(jedi_task_id = task_id, "Refinement failed: {}", e);
                Err(e)
            }
        }
    }

    async fn do_refine(&self, mut task: TaskRecord, mut params: TaskParams) -> Result<TaskRecord, RefineError> {
        if params.add_es_params {
            add_event_service_params(&mut params.job_parameters);
        }
        extract_common(&mut task, &params)?;
        basic_refine(&mut task, &params)?;

        // Conditions data rides along with every job.
        for dataset in task.datasets.iter_mut().filter(|d| is_secondary_input(d)) {
            if naming::is_conditions_dataset(&dataset.name) {
                dataset.attributes = vec![ATTR_REPEAT.to_string(), ATTR_NOSPLIT.to_string()];
            }
        }

        if task.has_distinct_parent() {
            for dataset in task
                .datasets
                .iter_mut()
                .filter(|d| d.dataset_type == DatasetType::Input && d.is_master())
            {
                dataset.add_attribute(ATTR_CONSISTENCY_CHECK);
            }
        }

        for dataset in task.datasets.iter_mut().filter(|d| d.dataset_type.is_produced()) {
            if let Some(template) = dataset.template.as_deref() {
                dataset.template = Some(versioned_output_template(template));
            }
        }

        if !params.no_throttle {
            task.set_num_throttled(Some(0));
        }
        task.set_to_register_datasets();

        if task.processing_type() == Some(MERGE_PROCESSING_TYPE) && task.has_distinct_parent() {
            self.mark_parent_outputs_transient(&task).await?;
        }

        task.set_status(TaskStatus::Defined);
        Ok(task)
    }

    /// Tag parent outputs whose data type this merge task both reads and writes.
    async fn mark_parent_outputs_transient(&self, task: &TaskRecord) -> Result<(), RefineError> {
        let Some(parent_tid) = task.parent_tid() else {
            return Ok(());
        };
        let types_in = data_types(task.datasets.iter().filter(|d| d.dataset_type.is_input()));
        let types_out = data_types(task.datasets.iter().filter(|d| d.dataset_type.is_produced()));

        let parent = self
            .call("get_task", self.store.get_task(parent_tid))
            .await?
            .ok_or(RefineError::ParentNotFound { parent_tid })?;

        let transient = Value::Bool(true);
        for dataset in parent.datasets.iter().filter(|d| d.dataset_type.is_produced()) {
            let Some(data_type) = naming::dataset_type(&dataset.name) else {
                continue;
            };
            if types_in.contains(data_type) && types_out.contains(data_type) {
                info!(
                    jedi_task_id = task.task_id(),
                    parent_tid,
                    dataset_id = dataset.dataset_id,
                    dataset = %dataset.name,
                    "Setting transient metadata on parent dataset"
                );
                self.call(
                    "set_dataset_metadata",
                    self.catalog
                        .set_dataset_metadata(&dataset.name, TRANSIENT_METADATA_KEY, &transient),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn call<T, E>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, RefineError>
    where
        RefineError: From<E>,
    {
        timeout::bounded(operation, self.call_timeout, fut).await
    }
}

fn is_secondary_input(dataset: &DatasetRecord) -> bool {
    dataset.dataset_type.is_input() && !dataset.is_master()
}

fn data_types<'a>(datasets: impl Iterator<Item = &'a DatasetRecord>) -> HashSet<String> {
    datasets
        .filter_map(|d| naming::dataset_type(&d.name))
        .map(str::to_string)
        .collect()
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, RefineError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RefineError::MissingParam(name.to_string()))
}

/// Copy classification, scheduling and resource attributes and encode the
/// split options.
fn extract_common(task: &mut TaskRecord, params: &TaskParams) -> Result<(), RefineError> {
    task.set_task_name(Some(required(&params.task_name, "taskName")?));
    task.set_vo(Some(required(&params.vo, "vo")?));
    task.set_prod_source_label(Some(required(&params.prod_source_label, "prodSourceLabel")?));

    task.set_user_name(params.user_name.as_deref());
    task.set_working_group(params.working_group.as_deref());
    task.set_task_type(params.task_type.as_deref());
    task.set_processing_type(params.processing_type.as_deref());
    task.set_task_priority(params.task_priority);
    task.set_current_priority(params.task_priority);
    task.set_architecture(params.architecture.as_deref());
    task.set_trans_home(params.trans_home.as_deref());
    task.set_trans_path(params.trans_path.as_deref());
    task.set_core_count(params.core_count);
    task.set_work_queue_id(params.work_queue_id);
    task.set_cloud(params.cloud.as_deref());
    task.set_site(params.site.as_deref());
    task.set_nucleus(params.nucleus.as_deref());
    task.set_parent_tid(params.parent_tid);

    task.set_walltime(params.walltime);
    task.set_walltime_unit(params.walltime_unit.as_deref());
    task.set_out_disk_count(params.out_disk_count);
    task.set_out_disk_unit(params.out_disk_unit.as_deref());
    task.set_work_disk_count(params.work_disk_count);
    task.set_work_disk_unit(params.work_disk_unit.as_deref());
    task.set_ram_count(params.ram_count);
    task.set_ram_unit(params.ram_unit.as_deref());
    task.set_io_intensity(params.io_intensity);
    task.set_io_intensity_unit(params.io_intensity_unit.as_deref());

    let back_end = params
        .ddm_back_end
        .as_deref()
        .unwrap_or(DdmBackEnd::Rucio.as_str())
        .parse::<DdmBackEnd>()
        .map_err(|reason| RefineError::InvalidParam {
            name: "ddmBackEnd".into(),
            reason,
        })?;
    task.set_ddm_back_end(back_end);

    let numeric = [
        (SplitOption::NumFilesPerJob, params.n_files_per_job),
        (SplitOption::NumEventsPerJob, params.n_events_per_job),
        (SplitOption::NumGbPerJob, params.n_gb_per_job),
        (SplitOption::MaxFilesPerJob, params.max_files_per_job),
        (SplitOption::NumEventsPerInput, params.n_events_per_input_file),
        (SplitOption::NumEventsPerWorker, params.n_events_per_worker),
        (SplitOption::NumFilesPerMergeJob, params.n_files_per_merge_job),
        (SplitOption::NumEventsPerMergeJob, params.n_events_per_merge_job),
        (SplitOption::NumGbPerMergeJob, params.n_gb_per_merge_job),
        (SplitOption::MaxFilesPerMergeJob, params.max_files_per_merge_job),
        (SplitOption::RandomSeed, params.random_seed),
        (SplitOption::FirstEvent, params.first_event),
    ];
    for (opt, value) in numeric {
        if let Some(value) = value {
            task.set_split_option(opt, value);
        }
    }

    if let Some(id) = params.group_boundary_id {
        if GroupBoundary::from_id(id).is_none() {
            return Err(RefineError::InvalidParam {
                name: "groupBoundaryID".into(),
                reason: format!("{id} is outside 1-4"),
            });
        }
        task.set_split_option(SplitOption::GroupBoundaryId, id);
    }

    let flags = [
        (SplitOption::UseBuild, params.use_build),
        (SplitOption::UseLocalIo, params.use_local_io),
        (SplitOption::MergeOutput, params.merge_output),
        (SplitOption::LimitedSites, params.limited_sites),
        (SplitOption::LoadXml, params.load_xml),
        (SplitOption::UsePrePro, params.use_pre_processing),
        (SplitOption::AllowEmptyInput, params.allow_empty_input),
        (SplitOption::DisableAutoRetry, params.disable_auto_retry),
        (SplitOption::PfnList, params.pfn_list),
        (SplitOption::InstantiateTemplate, params.instantiate_template),
        (SplitOption::InstantiateTemplateAtSite, params.instantiate_template_at_site),
        (SplitOption::UseScout, !params.skip_scout),
    ];
    for (opt, enabled) in flags {
        if enabled {
            task.set_split_option(opt, 1);
        }
    }
    Ok(())
}

/// Build dataset records and the job-parameter template.
fn basic_refine(task: &mut TaskRecord, params: &TaskParams) -> Result<(), RefineError> {
    let task_id = task.task_id();
    let mut datasets: Vec<DatasetRecord> = Vec::new();
    let mut master_id: Option<i64> = None;

    let items = params.job_parameters.iter().chain(params.log.iter());
    for item in items.filter(|i| i.kind == JobParamKind::Template) {
        let Some(param_type) = item.param_type else {
            continue;
        };
        let name = item
            .dataset
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| RefineError::InvalidParam {
                name: "jobParameters".into(),
                reason: format!("template {} has no dataset", item.value),
            })?;

        let mut dataset = DatasetRecord::new(task_id, name, param_type);
        dataset.dataset_id = datasets.len() as i64 + 1;
        dataset.storage_token = item.token.clone();
        if param_type.is_input() {
            match master_id {
                None => master_id = Some(dataset.dataset_id),
                Some(master) => dataset.master_id = Some(master),
            }
        } else {
            dataset.template = Some(item.filename_template().to_string());
        }
        datasets.push(dataset);
    }

    task.datasets = datasets;
    task.job_params_template = Some(render_template(&params.job_parameters));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddm::{CatalogCall, DryRunCatalog};
    use crate::refine::params::JobParam;
    use crate::store::MemoryTaskStore;
    use crate::task::TaskAttr;

    fn base_params() -> TaskParams {
        TaskParams {
            task_name: Some("mc16_13TeV.410470.simul".into()),
            vo: Some("atlas".into()),
            prod_source_label: Some("managed".into()),
            task_priority: Some(880),
            processing_type: Some("simul".into()),
            n_files_per_job: Some(5),
            job_parameters: vec![
                JobParam::constant("--maxEvents=1000"),
                JobParam::template(
                    "--inputEVNTFile=${IN}",
                    DatasetType::Input,
                    "mc16_13TeV.410470.PhPy8EG.evgen.EVNT.e6337",
                ),
                JobParam::template(
                    "--DBRelease=${DBR}",
                    DatasetType::Input,
                    "ddo.000001.Atlas.Ideal.DBRelease.v310101",
                ),
                JobParam::template(
                    "--outputHITSFile=HITS.pool.root",
                    DatasetType::Output,
                    "mc16_13TeV.410470.PhPy8EG.simul.HITS.s3126",
                )
                .with_token("ATLASDATADISK"),
            ],
            log: Some(JobParam::template(
                "log.tgz",
                DatasetType::Log,
                "mc16_13TeV.410470.PhPy8EG.simul.log.s3126",
            )),
            ..TaskParams::default()
        }
    }

    fn refiner() -> (TaskRefiner, Arc<MemoryTaskStore>, Arc<DryRunCatalog>) {
        let store = Arc::new(MemoryTaskStore::new());
        let catalog = Arc::new(DryRunCatalog::new());
        (TaskRefiner::new(store.clone(), catalog.clone()), store, catalog)
    }

    #[tokio::test]
    async fn refines_basic_production_task() {
        let (refiner, _, catalog) = refiner();
        let task = refiner.refine(TaskRecord::new(1000), base_params()).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Defined);
        assert_eq!(task.num_files_per_job(), Some(5));
        assert_eq!(task.ddm_back_end(), Some(DdmBackEnd::Rucio));
        assert!(task.to_register_datasets());
        assert!(task.use_scout());
        assert_eq!(task.num_throttled(), Some(0));
        assert_eq!(task.current_priority(), Some(880));
        assert!(task.is_changed(TaskAttr::SplitRule));
        assert!(task.is_changed(TaskAttr::TaskName));

        let ds = &task.datasets;
        assert_eq!(ds.len(), 4);
        assert!(ds[0].is_master());
        assert_eq!(ds[1].master_id, Some(1));
        assert_eq!(ds[1].attributes_string(), "repeat,nosplit");
        assert!(!ds[0].has_attribute(ATTR_CONSISTENCY_CHECK));
        assert_eq!(ds[2].template.as_deref(), Some("HITS.pool.root.1"));
        assert_eq!(ds[2].storage_token.as_deref(), Some("ATLASDATADISK"));
        assert_eq!(ds[3].template.as_deref(), Some("log.tgz.1"));

        assert_eq!(
            task.job_params_template.as_deref(),
            Some("--maxEvents=1000 --inputEVNTFile=${IN} --DBRelease=${DBR} --outputHITSFile=HITS.pool.root")
        );
        assert!(catalog.calls().is_empty());
    }

    #[tokio::test]
    async fn no_throttle_leaves_counter_unset() {
        let (refiner, _, _) = refiner();
        let params = TaskParams {
            no_throttle: true,
            ..base_params()
        };
        let task = refiner.refine(TaskRecord::new(1), params).await.unwrap();
        assert_eq!(task.num_throttled(), None);
        assert!(task.to_register_datasets());
    }

    #[tokio::test]
    async fn distinct_parent_enables_consistency_check() {
        let (refiner, _, _) = refiner();
        let params = TaskParams {
            parent_tid: Some(900),
            ..base_params()
        };
        let task = refiner.refine(TaskRecord::new(1000), params).await.unwrap();
        assert!(task.datasets[0].has_attribute(ATTR_CONSISTENCY_CHECK));

        let own = TaskParams {
            parent_tid: Some(1000),
            ..base_params()
        };
        let task = refiner.refine(TaskRecord::new(1000), own).await.unwrap();
        assert!(!task.datasets[0].has_attribute(ATTR_CONSISTENCY_CHECK));
    }

    #[tokio::test]
    async fn merge_task_marks_shared_parent_types_transient() {
        let (refiner, store, catalog) = refiner();

        let mut parent = TaskRecord::new(900);
        parent.set_vo(Some("atlas"));
        let mut hits = DatasetRecord::new(900, "mc16.410470.PhPy8EG.simul.HITS.s3126_tid01", DatasetType::Output);
        hits.dataset_id = 1;
        let mut aod = DatasetRecord::new(900, "mc16.410470.PhPy8EG.recon.AOD.r1_tid01", DatasetType::Output);
        aod.dataset_id = 2;
        let mut log = DatasetRecord::new(900, "mc16.410470.PhPy8EG.simul.log.s3126_tid01", DatasetType::Log);
        log.dataset_id = 3;
        parent.datasets = vec![hits, aod, log];
        store.insert_task(&parent).await.unwrap();

        let params = TaskParams {
            processing_type: Some("merge".into()),
            parent_tid: Some(900),
            job_parameters: vec![
                JobParam::template("--inputHITSFile=${IN}", DatasetType::Input, "mc16.410470.PhPy8EG.simul.HITS.s3126_tid01"),
                JobParam::template("--outputHITSFile=HITS.pool.root", DatasetType::Output, "mc16.410470.PhPy8EG.merge.HITS.s3126_s3136"),
            ],
            log: None,
            ..base_params()
        };
        refiner.refine(TaskRecord::new(1001), params).await.unwrap();

        let calls = catalog.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            CatalogCall::Metadata {
                dataset: "mc16.410470.PhPy8EG.simul.HITS.s3126_tid01".into(),
                key: "transient".into(),
                value: Value::Bool(true),
            }
        );
    }

    struct StalledCatalog;

    #[async_trait::async_trait]
    impl DataCatalog for StalledCatalog {
        async fn register_dataset_subscription(
            &self,
            _dataset: &str,
            _location: &str,
            _activity: &str,
            _asynchronous: bool,
        ) -> Result<bool, crate::error::CatalogError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }

        async fn set_dataset_metadata(
            &self,
            _dataset: &str,
            _key: &str,
            _value: &Value,
        ) -> Result<(), crate::error::CatalogError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_catalog_call_times_out() {
        let store = Arc::new(MemoryTaskStore::new());
        let refiner = TaskRefiner::new(store.clone(), Arc::new(StalledCatalog))
            .with_call_timeout(Duration::from_millis(50));

        let mut parent = TaskRecord::new(900);
        let mut hits = DatasetRecord::new(900, "mc16.410470.PhPy8EG.simul.HITS.s3126_tid01", DatasetType::Output);
        hits.dataset_id = 1;
        parent.datasets = vec![hits];
        store.insert_task(&parent).await.unwrap();

        let params = TaskParams {
            processing_type: Some("merge".into()),
            parent_tid: Some(900),
            job_parameters: vec![
                JobParam::template("--inputHITSFile=${IN}", DatasetType::Input, "mc16.410470.PhPy8EG.simul.HITS.s3126_tid01"),
                JobParam::template("--outputHITSFile=HITS.pool.root", DatasetType::Output, "mc16.410470.PhPy8EG.merge.HITS.s3126_s3136"),
            ],
            log: None,
            ..base_params()
        };
        let err = refiner.refine(TaskRecord::new(1001), params).await.unwrap_err();
        assert!(matches!(
            err,
            RefineError::Timeout { ref operation, .. } if operation == "set_dataset_metadata"
        ));
    }

    #[tokio::test]
    async fn merge_task_with_missing_parent_fails() {
        let (refiner, _, _) = refiner();
        let params = TaskParams {
            processing_type: Some("merge".into()),
            parent_tid: Some(12345),
            ..base_params()
        };
        let err = refiner.refine(TaskRecord::new(1), params).await.unwrap_err();
        assert!(matches!(err, RefineError::ParentNotFound { parent_tid: 12345 }));
    }

    #[tokio::test]
    async fn event_service_fragments_are_injected() {
        let (refiner, _, _) = refiner();
        let params = TaskParams {
            add_es_params: true,
            ..base_params()
        };
        let task = refiner.refine(TaskRecord::new(1), params).await.unwrap();
        let template = task.job_params_template.unwrap();
        assert!(template.contains(r#"<PANDA_ES_ONLY>preInclude="AthenaMP/AthenaMP_EventService.py"</PANDA_ES_ONLY>"#));
        assert!(template.contains("<PANDA_ES_ONLY>preExec=\"import os;"));
    }

    #[tokio::test]
    async fn validation_errors() {
        let (refiner, _, _) = refiner();

        let err = refiner
            .refine(TaskRecord::new(1), TaskParams { vo: None, ..base_params() })
            .await
            .unwrap_err();
        assert!(matches!(err, RefineError::MissingParam(name) if name == "vo"));

        let err = refiner
            .refine(
                TaskRecord::new(1),
                TaskParams {
                    group_boundary_id: Some(7),
                    ..base_params()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RefineError::InvalidParam { name, .. } if name == "groupBoundaryID"));

        let mut params = base_params();
        params.job_parameters.push(JobParam {
            dataset: None,
            ..JobParam::template("--out=${OUT}", DatasetType::Output, "x")
        });
        let err = refiner.refine(TaskRecord::new(1), params).await.unwrap_err();
        assert!(matches!(err, RefineError::InvalidParam { name, .. } if name == "jobParameters"));

        let err = refiner
            .refine(
                TaskRecord::new(1),
                TaskParams {
                    ddm_back_end: Some("dq2".into()),
                    ..base_params()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RefineError::InvalidParam { name, .. } if name == "ddmBackEnd"));
    }
}
