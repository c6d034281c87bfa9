//! Task model: split-rule codec, record, datasets and lifecycle.

pub mod dataset;
mod lifecycle;
pub mod record;
pub mod split_rule;
pub mod status;

pub use dataset::{DatasetRecord, DatasetType};
pub use record::{AttrValue, TaskAttr, TaskRecord, WORLD_CLOUD};
pub use split_rule::{DdmBackEnd, GroupBoundary, PreProcessing, SplitOption, SplitRule};
pub use status::{TaskCommand, TaskStatus};
