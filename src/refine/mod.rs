//! Task refinement: submitted parameters to a persist-ready task.

pub mod job_params;
pub mod params;
pub mod refiner;

pub use params::{JobParam, JobParamKind, TaskParams};
pub use refiner::TaskRefiner;
