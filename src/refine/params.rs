//! Submitted task parameters.

use serde::{Deserialize, Serialize};

use crate::task::DatasetType;

/// How a job-parameter item is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobParamKind {
    /// Passed through verbatim.
    Constant,
    /// Filled per job from a dataset.
    Template,
}

/// One item of the job-parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParam {
    #[serde(rename = "type")]
    pub kind: JobParamKind,
    pub value: String,
    #[serde(default)]
    pub param_type: Option<DatasetType>,
    #[serde(default)]
    pub dataset: Option<String>,
    /// Storage token for outputs.
    #[serde(default)]
    pub token: Option<String>,
}

impl JobParam {
    pub fn constant(value: impl Into<String>) -> Self {
        Self {
            kind: JobParamKind::Constant,
            value: value.into(),
            param_type: None,
            dataset: None,
            token: None,
        }
    }

    pub fn template(value: impl Into<String>, param_type: DatasetType, dataset: impl Into<String>) -> Self {
        Self {
            kind: JobParamKind::Template,
            value: value.into(),
            param_type: Some(param_type),
            dataset: Some(dataset.into()),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Filename template: the part after the last `=`, or the whole value.
    pub fn filename_template(&self) -> &str {
        self.value
            .rsplit_once('=')
            .map_or(self.value.as_str(), |(_, tail)| tail)
    }
}

/// Raw parameters of a submitted task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskParams {
    pub task_name: Option<String>,
    pub user_name: Option<String>,
    pub vo: Option<String>,
    pub prod_source_label: Option<String>,
    pub working_group: Option<String>,
    pub task_type: Option<String>,
    pub processing_type: Option<String>,
    pub task_priority: Option<i64>,
    pub architecture: Option<String>,
    pub trans_home: Option<String>,
    pub trans_path: Option<String>,
    pub core_count: Option<i64>,
    pub work_queue_id: Option<i64>,
    pub cloud: Option<String>,
    pub site: Option<String>,
    pub nucleus: Option<String>,
    pub parent_tid: Option<i64>,

    pub walltime: Option<i64>,
    pub walltime_unit: Option<String>,
    pub out_disk_count: Option<i64>,
    pub out_disk_unit: Option<String>,
    pub work_disk_count: Option<i64>,
    pub work_disk_unit: Option<String>,
    pub ram_count: Option<i64>,
    pub ram_unit: Option<String>,
    pub io_intensity: Option<i64>,
    pub io_intensity_unit: Option<String>,

    pub n_files_per_job: Option<u64>,
    pub n_events_per_job: Option<u64>,
    pub n_gb_per_job: Option<u64>,
    pub max_files_per_job: Option<u64>,
    pub n_events_per_input_file: Option<u64>,
    pub n_events_per_worker: Option<u64>,
    pub n_files_per_merge_job: Option<u64>,
    pub n_events_per_merge_job: Option<u64>,
    pub n_gb_per_merge_job: Option<u64>,
    pub max_files_per_merge_job: Option<u64>,
    pub random_seed: Option<u64>,
    pub first_event: Option<u64>,
    pub group_boundary_id: Option<u64>,
    pub use_build: bool,
    pub use_local_io: bool,
    pub merge_output: bool,
    pub limited_sites: bool,
    pub load_xml: bool,
    pub use_pre_processing: bool,
    pub allow_empty_input: bool,
    pub disable_auto_retry: bool,
    pub pfn_list: bool,
    pub instantiate_template: bool,
    pub instantiate_template_at_site: bool,
    pub skip_scout: bool,

    pub job_parameters: Vec<JobParam>,
    pub log: Option<JobParam>,
    pub add_es_params: bool,
    pub no_throttle: bool,
    pub ddm_back_end: Option<String>,
}
