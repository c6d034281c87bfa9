//! Task record with explicit dirty tracking.
//!
//! Every persisted attribute is declared once in the `task_attributes!`
//! table below. Mutation goes through generated setters which compare the old
//! and new value and record the attribute in the record's change set, so the
//! store can write back only what actually changed.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::dataset::DatasetRecord;
use super::split_rule::{DdmBackEnd, GroupBoundary, PreProcessing, SplitOption, SplitRule};
use super::status::TaskStatus;
use crate::error::StoreError;

/// Cloud value meaning "nucleus model, no fixed cloud".
pub const WORLD_CLOUD: &str = "WORLD";

const GIB: u64 = 1024 * 1024 * 1024;

/// A persistable attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Null,
    Int(i64),
    Text(String),
    Time(DateTime<Utc>),
}

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }
}

/// Conversion between a field type and its stored representation.
trait AttrType: Sized {
    fn to_attr(&self) -> AttrValue;
    fn from_attr(value: AttrValue) -> Result<Self, String>;
}

impl AttrType for i64 {
    fn to_attr(&self) -> AttrValue {
        AttrValue::Int(*self)
    }

    fn from_attr(value: AttrValue) -> Result<Self, String> {
        match value {
            AttrValue::Int(v) => Ok(v),
            AttrValue::Text(s) => s.parse().map_err(|e| format!("{s}: {e}")),
            other => Err(format!("expected integer, got {other:?}")),
        }
    }
}

impl AttrType for Option<i64> {
    fn to_attr(&self) -> AttrValue {
        self.map_or(AttrValue::Null, AttrValue::Int)
    }

    fn from_attr(value: AttrValue) -> Result<Self, String> {
        match value {
            AttrValue::Null => Ok(None),
            other => i64::from_attr(other).map(Some),
        }
    }
}

impl AttrType for Option<String> {
    fn to_attr(&self) -> AttrValue {
        self.clone().map_or(AttrValue::Null, AttrValue::Text)
    }

    fn from_attr(value: AttrValue) -> Result<Self, String> {
        match value {
            AttrValue::Null => Ok(None),
            AttrValue::Text(s) => Ok(Some(s)),
            AttrValue::Int(v) => Ok(Some(v.to_string())),
            AttrValue::Time(t) => Ok(Some(t.to_rfc3339())),
        }
    }
}

impl AttrType for TaskStatus {
    fn to_attr(&self) -> AttrValue {
        AttrValue::Text(self.as_str().to_string())
    }

    fn from_attr(value: AttrValue) -> Result<Self, String> {
        match value {
            AttrValue::Text(s) => s.parse().map_err(|e| format!("{e}")),
            other => Err(format!("expected status text, got {other:?}")),
        }
    }
}

impl AttrType for Option<TaskStatus> {
    fn to_attr(&self) -> AttrValue {
        self.map_or(AttrValue::Null, |s| s.to_attr())
    }

    fn from_attr(value: AttrValue) -> Result<Self, String> {
        match value {
            AttrValue::Null => Ok(None),
            other => TaskStatus::from_attr(other).map(Some),
        }
    }
}

impl AttrType for Option<DateTime<Utc>> {
    fn to_attr(&self) -> AttrValue {
        self.map_or(AttrValue::Null, AttrValue::Time)
    }

    fn from_attr(value: AttrValue) -> Result<Self, String> {
        match value {
            AttrValue::Null => Ok(None),
            AttrValue::Time(t) => Ok(Some(t)),
            AttrValue::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| format!("{s}: {e}")),
            other => Err(format!("expected timestamp, got {other:?}")),
        }
    }
}

impl AttrType for SplitRule {
    fn to_attr(&self) -> AttrValue {
        if self.is_empty() {
            AttrValue::Null
        } else {
            AttrValue::Text(self.to_string())
        }
    }

    fn from_attr(value: AttrValue) -> Result<Self, String> {
        match value {
            AttrValue::Null => Ok(SplitRule::new()),
            AttrValue::Text(s) => Ok(SplitRule::parse(&s)),
            other => Err(format!("expected split rule text, got {other:?}")),
        }
    }
}

macro_rules! task_attributes {
    ( $( $variant:ident => $field:ident : $ty:ty = $column:literal ),* $(,)? ) => {
        /// Persisted task attributes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum TaskAttr {
            $( $variant, )*
        }

        impl TaskAttr {
            pub const ALL: &'static [TaskAttr] = &[ $( TaskAttr::$variant, )* ];

            /// Column name in the task table.
            pub fn column(self) -> &'static str {
                match self {
                    $( TaskAttr::$variant => $column, )*
                }
            }
        }

        #[derive(Debug, Clone, Default, PartialEq)]
        struct TaskFields {
            $( $field: $ty, )*
        }

        impl TaskFields {
            fn get(&self, attr: TaskAttr) -> AttrValue {
                match attr {
                    $( TaskAttr::$variant => self.$field.to_attr(), )*
                }
            }

            fn put(&mut self, attr: TaskAttr, value: AttrValue) -> Result<(), String> {
                match attr {
                    $( TaskAttr::$variant => self.$field = <$ty as AttrType>::from_attr(value)?, )*
                }
                Ok(())
            }
        }
    };
}

task_attributes! {
    TaskId => task_id: i64 = "jedi_task_id",
    TaskName => task_name: Option<String> = "task_name",
    Status => status: TaskStatus = "status",
    OldStatus => old_status: Option<TaskStatus> = "old_status",
    UserName => user_name: Option<String> = "user_name",
    CreationDate => creation_date: Option<DateTime<Utc>> = "creation_date",
    ModificationTime => modification_time: Option<DateTime<Utc>> = "modification_time",
    StartTime => start_time: Option<DateTime<Utc>> = "start_time",
    EndTime => end_time: Option<DateTime<Utc>> = "end_time",
    FrozenTime => frozen_time: Option<DateTime<Utc>> = "frozen_time",
    ProdSourceLabel => prod_source_label: Option<String> = "prod_source_label",
    WorkingGroup => working_group: Option<String> = "working_group",
    Vo => vo: Option<String> = "vo",
    CoreCount => core_count: Option<i64> = "core_count",
    TaskType => task_type: Option<String> = "task_type",
    ProcessingType => processing_type: Option<String> = "processing_type",
    TaskPriority => task_priority: Option<i64> = "task_priority",
    CurrentPriority => current_priority: Option<i64> = "current_priority",
    Architecture => architecture: Option<String> = "architecture",
    TransHome => trans_home: Option<String> = "trans_home",
    TransPath => trans_path: Option<String> = "trans_path",
    LockedBy => locked_by: Option<String> = "locked_by",
    LockedTime => locked_time: Option<DateTime<Utc>> = "locked_time",
    TermCondition => term_condition: Option<String> = "term_condition",
    SplitRule => split_rule: SplitRule = "split_rule",
    Walltime => walltime: Option<i64> = "walltime",
    WalltimeUnit => walltime_unit: Option<String> = "walltime_unit",
    OutDiskCount => out_disk_count: Option<i64> = "out_disk_count",
    OutDiskUnit => out_disk_unit: Option<String> = "out_disk_unit",
    WorkDiskCount => work_disk_count: Option<i64> = "work_disk_count",
    WorkDiskUnit => work_disk_unit: Option<String> = "work_disk_unit",
    RamCount => ram_count: Option<i64> = "ram_count",
    RamUnit => ram_unit: Option<String> = "ram_unit",
    IoIntensity => io_intensity: Option<i64> = "io_intensity",
    IoIntensityUnit => io_intensity_unit: Option<String> = "io_intensity_unit",
    WorkQueueId => work_queue_id: Option<i64> = "work_queue_id",
    Progress => progress: Option<i64> = "progress",
    FailureRate => failure_rate: Option<i64> = "failure_rate",
    Cloud => cloud: Option<String> = "cloud",
    Site => site: Option<String> = "site",
    Nucleus => nucleus: Option<String> = "nucleus",
    NumThrottled => num_throttled: Option<i64> = "num_throttled",
    ThrottledTime => throttled_time: Option<DateTime<Utc>> = "throttled_time",
    ErrorDialog => error_dialog: Option<String> = "error_dialog",
    ParentTid => parent_tid: Option<i64> = "parent_tid",
}

impl TaskAttr {
    /// Maximum persisted length in characters, for bounded text columns.
    pub fn max_len(self) -> Option<usize> {
        match self {
            TaskAttr::ErrorDialog => Some(255),
            TaskAttr::TaskName => Some(132),
            _ => None,
        }
    }

    /// Attributes written on every update, changed or not.
    pub fn always_persist(self) -> bool {
        matches!(self, TaskAttr::LockedBy | TaskAttr::LockedTime)
    }

    pub fn from_column(column: &str) -> Option<TaskAttr> {
        TaskAttr::ALL.iter().copied().find(|a| a.column() == column)
    }
}

/// Accessors for `Copy` attributes: getter returns the value, setter compares.
macro_rules! value_accessors {
    ( $( $get:ident / $set:ident => $field:ident : $ty:ty = $variant:ident; )* ) => {
        impl TaskRecord {
            $(
                pub fn $get(&self) -> $ty {
                    self.fields.$field
                }

                pub fn $set(&mut self, value: $ty) {
                    let changed = self.fields.$field != value;
                    self.fields.$field = value;
                    self.mark(TaskAttr::$variant, changed);
                }
            )*
        }
    };
}

/// Accessors for text attributes, borrowed in and out.
macro_rules! text_accessors {
    ( $( $get:ident / $set:ident => $field:ident = $variant:ident; )* ) => {
        impl TaskRecord {
            $(
                pub fn $get(&self) -> Option<&str> {
                    self.fields.$field.as_deref()
                }

                pub fn $set(&mut self, value: Option<&str>) {
                    let changed = self.fields.$field.as_deref() != value;
                    self.fields.$field = value.map(str::to_string);
                    self.mark(TaskAttr::$variant, changed);
                }
            )*
        }
    };
}

/// A task and the datasets and job template attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    fields: TaskFields,
    changed: BTreeSet<TaskAttr>,
    /// Job-parameter template produced by refinement.
    pub job_params_template: Option<String>,
    /// Datasets in insertion order.
    pub datasets: Vec<DatasetRecord>,
}

impl TaskRecord {
    /// A fresh record. The id is marked as changed so an insert carries it.
    pub fn new(task_id: i64) -> Self {
        let mut record = Self {
            fields: TaskFields::default(),
            changed: BTreeSet::new(),
            job_params_template: None,
            datasets: Vec::new(),
        };
        record.fields.task_id = task_id;
        record.changed.insert(TaskAttr::TaskId);
        record.changed.insert(TaskAttr::Status);
        record
    }

    pub fn task_id(&self) -> i64 {
        self.fields.task_id
    }

    fn mark(&mut self, attr: TaskAttr, changed: bool) {
        if changed || attr.always_persist() {
            self.changed.insert(attr);
        }
    }

    /// Mark an attribute dirty without touching its value.
    pub fn force_update(&mut self, attr: TaskAttr) {
        self.changed.insert(attr);
    }

    /// Forget pending changes, after a successful persist.
    pub fn reset_changed_list(&mut self) {
        self.changed.clear();
    }

    pub fn is_changed(&self, attr: TaskAttr) -> bool {
        self.changed.contains(&attr)
    }

    pub fn changed_attrs(&self) -> impl Iterator<Item = TaskAttr> + '_ {
        self.changed.iter().copied()
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    /// In-memory value of an attribute, untruncated.
    pub fn value(&self, attr: TaskAttr) -> AttrValue {
        self.fields.get(attr)
    }

    /// Persistable values, with bounded text clipped to its column limit.
    pub fn values_map(&self, only_changed: bool) -> Vec<(TaskAttr, AttrValue)> {
        TaskAttr::ALL
            .iter()
            .copied()
            .filter(|attr| !only_changed || self.changed.contains(attr))
            .map(|attr| {
                let value = match (self.fields.get(attr), attr.max_len()) {
                    (AttrValue::Text(s), Some(max)) if s.chars().count() > max => {
                        AttrValue::Text(s.chars().take(max).collect())
                    }
                    (value, _) => value,
                };
                (attr, value)
            })
            .collect()
    }

    /// Fill an attribute from storage. Does not mark it dirty.
    pub fn load_value(&mut self, attr: TaskAttr, value: AttrValue) -> Result<(), StoreError> {
        self.fields
            .put(attr, value)
            .map_err(|message| StoreError::Corrupt {
                column: attr.column().to_string(),
                message,
            })
    }

    // ── Split rule ──────────────────────────────────────────────────

    pub fn split_rule(&self) -> &SplitRule {
        &self.fields.split_rule
    }

    pub fn set_split_rule(&mut self, rule: SplitRule) {
        let changed = self.fields.split_rule != rule;
        self.fields.split_rule = rule;
        self.mark(TaskAttr::SplitRule, changed);
    }

    pub fn set_split_option(&mut self, opt: SplitOption, value: u64) {
        let before = self.fields.split_rule.clone();
        self.fields.split_rule.set(opt, value);
        let changed = self.fields.split_rule != before;
        self.mark(TaskAttr::SplitRule, changed);
    }

    pub fn unset_split_option(&mut self, opt: SplitOption) {
        let before = self.fields.split_rule.clone();
        self.fields.split_rule.unset(opt);
        let changed = self.fields.split_rule != before;
        self.mark(TaskAttr::SplitRule, changed);
    }

    fn rule(&self, opt: SplitOption) -> Option<u64> {
        self.fields.split_rule.get(opt)
    }

    fn flag(&self, opt: SplitOption) -> bool {
        self.fields.split_rule.has(opt)
    }

    pub fn use_build(&self) -> bool {
        self.flag(SplitOption::UseBuild)
    }

    pub fn num_files_per_job(&self) -> Option<u64> {
        self.rule(SplitOption::NumFilesPerJob)
    }

    pub fn num_events_per_job(&self) -> Option<u64> {
        self.rule(SplitOption::NumEventsPerJob)
    }

    pub fn num_events_per_input(&self) -> Option<u64> {
        self.rule(SplitOption::NumEventsPerInput)
    }

    /// Input size per job in bytes.
    pub fn num_gb_per_job(&self) -> Option<u64> {
        self.rule(SplitOption::NumGbPerJob)
            .map(|gb| gb.saturating_mul(GIB))
    }

    pub fn max_files_per_job(&self) -> Option<u64> {
        self.rule(SplitOption::MaxFilesPerJob)
    }

    pub fn num_files_per_merge_job(&self) -> Option<u64> {
        self.rule(SplitOption::NumFilesPerMergeJob)
    }

    pub fn num_events_per_merge_job(&self) -> Option<u64> {
        self.rule(SplitOption::NumEventsPerMergeJob)
    }

    /// Merge input size per job in bytes.
    pub fn num_gb_per_merge_job(&self) -> Option<u64> {
        self.rule(SplitOption::NumGbPerMergeJob)
            .map(|gb| gb.saturating_mul(GIB))
    }

    pub fn max_files_per_merge_job(&self) -> Option<u64> {
        self.rule(SplitOption::MaxFilesPerMergeJob)
    }

    pub fn random_seed_offset(&self) -> Option<u64> {
        self.rule(SplitOption::RandomSeed)
    }

    pub fn first_event(&self) -> Option<u64> {
        self.rule(SplitOption::FirstEvent)
    }

    pub fn group_boundary(&self) -> Option<GroupBoundary> {
        self.fields.split_rule.group_boundary()
    }

    /// Input files may be split; true when no boundary policy is set.
    pub fn is_input_splittable(&self) -> bool {
        self.group_boundary().is_none_or(|gb| gb.input_splittable)
    }

    pub fn is_output_mapped(&self) -> bool {
        self.group_boundary().is_some_and(|gb| gb.output_mapped)
    }

    pub fn use_local_io(&self) -> bool {
        self.flag(SplitOption::UseLocalIo)
    }

    pub fn num_events_per_worker(&self) -> Option<u64> {
        self.rule(SplitOption::NumEventsPerWorker)
    }

    pub fn use_event_service(&self) -> bool {
        self.flag(SplitOption::NumEventsPerWorker)
    }

    pub fn merge_output(&self) -> bool {
        self.flag(SplitOption::MergeOutput)
    }

    pub fn use_limited_sites(&self) -> bool {
        self.flag(SplitOption::LimitedSites)
    }

    pub fn use_load_xml(&self) -> bool {
        self.flag(SplitOption::LoadXml)
    }

    pub fn use_pre_processing(&self) -> bool {
        self.flag(SplitOption::UsePrePro)
    }

    pub fn to_pre_process(&self) -> bool {
        self.fields.split_rule.pre_processing() == Some(PreProcessing::ToBeProcessed)
    }

    pub fn is_pre_processed(&self) -> bool {
        self.fields.split_rule.pre_processing() == Some(PreProcessing::Processed)
    }

    pub fn set_pre_processed(&mut self) {
        self.set_split_option(SplitOption::UsePrePro, PreProcessing::Processed.value());
    }

    pub fn allow_empty_input(&self) -> bool {
        self.flag(SplitOption::AllowEmptyInput)
    }

    pub fn disable_auto_retry(&self) -> bool {
        self.flag(SplitOption::DisableAutoRetry)
    }

    pub fn use_pfn_list(&self) -> bool {
        self.flag(SplitOption::PfnList)
    }

    pub fn instantiate_template(&self) -> bool {
        self.flag(SplitOption::InstantiateTemplate)
    }

    pub fn instantiate_template_at_site(&self) -> bool {
        self.flag(SplitOption::InstantiateTemplateAtSite)
    }

    pub fn use_scout(&self) -> bool {
        self.flag(SplitOption::UseScout)
    }

    pub fn ddm_back_end(&self) -> Option<DdmBackEnd> {
        self.fields.split_rule.ddm_back_end()
    }

    pub fn set_ddm_back_end(&mut self, back_end: DdmBackEnd) {
        self.set_split_option(SplitOption::DdmBackEnd, back_end.value());
    }

    pub fn to_register_datasets(&self) -> bool {
        self.flag(SplitOption::RegisterDatasets)
    }

    pub fn set_to_register_datasets(&mut self) {
        self.set_split_option(SplitOption::RegisterDatasets, 1);
    }

    // ── Derived values ──────────────────────────────────────────────

    /// Scratch disk per job in bytes.
    pub fn work_disk_size(&self) -> u64 {
        size_in_bytes(self.fields.work_disk_count, self.fields.work_disk_unit.as_deref())
    }

    /// Output size per input unit in bytes.
    pub fn out_disk_size(&self) -> u64 {
        size_in_bytes(self.fields.out_disk_count, self.fields.out_disk_unit.as_deref())
    }

    /// Task follows the nucleus model rather than a fixed cloud.
    pub fn use_world_cloud(&self) -> bool {
        self.fields.cloud.as_deref().is_none_or(|c| c == WORLD_CLOUD)
    }

    /// Parent differs from the task itself.
    pub fn has_distinct_parent(&self) -> bool {
        self.fields
            .parent_tid
            .is_some_and(|p| p != self.fields.task_id)
    }

    /// Master input dataset, if any.
    pub fn master_input(&self) -> Option<&DatasetRecord> {
        self.datasets
            .iter()
            .find(|d| d.dataset_type.is_input() && d.is_master())
    }

    pub fn append_error_dialog(&mut self, message: &str) {
        let next = match self.fields.error_dialog.as_deref() {
            Some(existing) if !existing.is_empty() => format!("{existing} {message}"),
            _ => message.to_string(),
        };
        self.set_error_dialog(Some(&next));
    }
}

fn size_in_bytes(count: Option<i64>, unit: Option<&str>) -> u64 {
    let Some(count) = count else {
        return 0;
    };
    let count = u64::try_from(count).unwrap_or(0);
    let multiplier = match unit {
        Some(u) if u.starts_with("GB") => GIB,
        Some(u) if u.starts_with("MB") => 1024 * 1024,
        Some(u) if u.starts_with("kB") => 1024,
        _ => 1,
    };
    count.saturating_mul(multiplier)
}

value_accessors! {
    status / set_status => status: TaskStatus = Status;
    old_status / set_old_status => old_status: Option<TaskStatus> = OldStatus;
    creation_date / set_creation_date => creation_date: Option<DateTime<Utc>> = CreationDate;
    modification_time / set_modification_time => modification_time: Option<DateTime<Utc>> = ModificationTime;
    start_time / set_start_time => start_time: Option<DateTime<Utc>> = StartTime;
    end_time / set_end_time => end_time: Option<DateTime<Utc>> = EndTime;
    frozen_time / set_frozen_time => frozen_time: Option<DateTime<Utc>> = FrozenTime;
    core_count / set_core_count => core_count: Option<i64> = CoreCount;
    task_priority / set_task_priority => task_priority: Option<i64> = TaskPriority;
    current_priority / set_current_priority => current_priority: Option<i64> = CurrentPriority;
    locked_time / set_locked_time => locked_time: Option<DateTime<Utc>> = LockedTime;
    walltime / set_walltime => walltime: Option<i64> = Walltime;
    out_disk_count / set_out_disk_count => out_disk_count: Option<i64> = OutDiskCount;
    work_disk_count / set_work_disk_count => work_disk_count: Option<i64> = WorkDiskCount;
    ram_count / set_ram_count => ram_count: Option<i64> = RamCount;
    io_intensity / set_io_intensity => io_intensity: Option<i64> = IoIntensity;
    work_queue_id / set_work_queue_id => work_queue_id: Option<i64> = WorkQueueId;
    progress / set_progress => progress: Option<i64> = Progress;
    failure_rate / set_failure_rate => failure_rate: Option<i64> = FailureRate;
    num_throttled / set_num_throttled => num_throttled: Option<i64> = NumThrottled;
    throttled_time / set_throttled_time => throttled_time: Option<DateTime<Utc>> = ThrottledTime;
    parent_tid / set_parent_tid => parent_tid: Option<i64> = ParentTid;
}

text_accessors! {
    task_name / set_task_name => task_name = TaskName;
    user_name / set_user_name => user_name = UserName;
    prod_source_label / set_prod_source_label => prod_source_label = ProdSourceLabel;
    working_group / set_working_group => working_group = WorkingGroup;
    vo / set_vo => vo = Vo;
    task_type / set_task_type => task_type = TaskType;
    processing_type / set_processing_type => processing_type = ProcessingType;
    architecture / set_architecture => architecture = Architecture;
    trans_home / set_trans_home => trans_home = TransHome;
    trans_path / set_trans_path => trans_path = TransPath;
    locked_by / set_locked_by => locked_by = LockedBy;
    term_condition / set_term_condition => term_condition = TermCondition;
    walltime_unit / set_walltime_unit => walltime_unit = WalltimeUnit;
    out_disk_unit / set_out_disk_unit => out_disk_unit = OutDiskUnit;
    work_disk_unit / set_work_disk_unit => work_disk_unit = WorkDiskUnit;
    ram_unit / set_ram_unit => ram_unit = RamUnit;
    io_intensity_unit / set_io_intensity_unit => io_intensity_unit = IoIntensityUnit;
    cloud / set_cloud => cloud = Cloud;
    site / set_site => site = Site;
    nucleus / set_nucleus => nucleus = Nucleus;
    error_dialog / set_error_dialog => error_dialog = ErrorDialog;
}
