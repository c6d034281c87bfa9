//! Dataset records attached to a task.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ddm::naming;

/// Role of a dataset within its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetType {
    Input,
    PseudoInput,
    Output,
    Log,
}

impl DatasetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::PseudoInput => "pseudo_input",
            Self::Output => "output",
            Self::Log => "log",
        }
    }

    pub fn is_input(self) -> bool {
        matches!(self, Self::Input | Self::PseudoInput)
    }

    /// Output or log; the datasets a reassignment has to move.
    pub fn is_produced(self) -> bool {
        matches!(self, Self::Output | Self::Log)
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(Self::Input),
            "pseudo_input" => Ok(Self::PseudoInput),
            "output" => Ok(Self::Output),
            "log" => Ok(Self::Log),
            other => Err(format!("unknown dataset type: {other}")),
        }
    }
}

/// Per-dataset attribute flags, stored as a comma list.
pub const ATTR_REPEAT: &str = "repeat";
pub const ATTR_NOSPLIT: &str = "nosplit";
/// Consistency check against the parent task's outputs.
pub const ATTR_CONSISTENCY_CHECK: &str = "cc";

/// A dataset referenced by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub task_id: i64,
    /// Sequential id within the task, assigned at refinement.
    pub dataset_id: i64,
    pub name: String,
    pub dataset_type: DatasetType,
    pub storage_token: Option<String>,
    /// Attribute flags in insertion order.
    pub attributes: Vec<String>,
    /// Id of the master dataset for secondaries; `None` for a master.
    pub master_id: Option<i64>,
    /// Output filename template (outputs and logs).
    pub template: Option<String>,
    /// Destination endpoint stamped by reassignment.
    pub destination: Option<String>,
    pub n_files: i64,
    pub n_files_used: i64,
    pub n_files_to_be_used: i64,
    pub n_files_finished: i64,
    pub n_files_failed: i64,
    pub n_files_on_hold: i64,
}

impl DatasetRecord {
    pub fn new(task_id: i64, name: impl Into<String>, dataset_type: DatasetType) -> Self {
        Self {
            task_id,
            dataset_id: 0,
            name: name.into(),
            dataset_type,
            storage_token: None,
            attributes: Vec::new(),
            master_id: None,
            template: None,
            destination: None,
            n_files: 0,
            n_files_used: 0,
            n_files_to_be_used: 0,
            n_files_finished: 0,
            n_files_failed: 0,
            n_files_on_hold: 0,
        }
    }

    pub fn is_master(&self) -> bool {
        self.master_id.is_none()
    }

    pub fn has_attribute(&self, attr: &str) -> bool {
        self.attributes.iter().any(|a| a == attr)
    }

    /// Add an attribute flag once.
    pub fn add_attribute(&mut self, attr: &str) {
        if !self.has_attribute(attr) {
            self.attributes.push(attr.to_string());
        }
    }

    pub fn attributes_string(&self) -> String {
        self.attributes.join(",")
    }

    /// Parse a stored comma list.
    pub fn set_attributes_string(&mut self, s: &str) {
        self.attributes = s
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
    }

    /// Storage token designates a distributed destination.
    pub fn is_distributed(&self) -> bool {
        self.storage_token
            .as_deref()
            .is_some_and(naming::is_distributed_token)
    }

    /// Fraction of files finished or failed; `None` when the dataset is empty.
    pub fn completion_ratio(&self) -> Option<f64> {
        if self.n_files <= 0 {
            return None;
        }
        Some((self.n_files_finished + self.n_files_failed) as f64 / self.n_files as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_are_deduplicated() {
        let mut ds = DatasetRecord::new(1, "ddo.000001.Atlas.Ideal.DBRelease.v1", DatasetType::Input);
        ds.add_attribute(ATTR_REPEAT);
        ds.add_attribute(ATTR_NOSPLIT);
        ds.add_attribute(ATTR_REPEAT);
        assert_eq!(ds.attributes_string(), "repeat,nosplit");

        let mut copy = DatasetRecord::new(1, "x", DatasetType::Input);
        copy.set_attributes_string("repeat, nosplit,");
        assert_eq!(copy.attributes, ds.attributes);
    }

    #[test]
    fn completion_ratio_guards_empty_dataset() {
        let mut ds = DatasetRecord::new(1, "in", DatasetType::Input);
        assert_eq!(ds.completion_ratio(), None);

        ds.n_files = 20;
        ds.n_files_finished = 18;
        ds.n_files_failed = 1;
        assert_eq!(ds.completion_ratio(), Some(0.95));
    }

    #[test]
    fn distributed_storage_token() {
        let mut ds = DatasetRecord::new(1, "out", DatasetType::Output);
        assert!(!ds.is_distributed());
        ds.storage_token = Some("dst:CERN-PROD_DATADISK".into());
        assert!(ds.is_distributed());
        ds.storage_token = Some("ATLASDATADISK".into());
        assert!(!ds.is_distributed());
    }

    #[test]
    fn dataset_type_text() {
        assert_eq!("pseudo_input".parse::<DatasetType>().unwrap(), DatasetType::PseudoInput);
        assert!(DatasetType::Log.is_produced());
        assert!(!DatasetType::Input.is_produced());
        assert!("bogus".parse::<DatasetType>().is_err());
    }
}
