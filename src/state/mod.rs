//! State module for task lifecycle and parameters
//!
//! # Components
//!
//! - `TaskStatus`: lifecycle state machine (pending, running, paused, terminal states)
//! - `TaskType`: the six data categories a task can harvest
//! - `TaskParameters`: per-type parameters, validated once at task creation

mod parameters;
mod task_status;
mod task_type;

// Re-export main types
pub use parameters::{
    resolve_regions, DateRange, DateSpec, GraphParameters, Granularity, ProfileParameters,
    RawTaskParameters, Region, RegionEntry, RegionSpec, SeriesParameters, TaskParameters,
    DEFAULT_DAYS, NATIONAL_REGION_CODE,
};
pub use task_status::TaskStatus;
pub use task_type::TaskType;
