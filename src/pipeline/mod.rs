//! Per-item orchestration: work items, stage contracts, lifecycle and the driver loop.

mod driver;
mod item;
mod lifecycle;
mod metrics;
pub mod resume;
mod stages;

#[cfg(test)]
mod driver_integration_tests;

pub use driver::{
    plan_run, resolve_work, Pipeline, PlanState, PlannedItem, RunOutcome, RunPlan, RunStats,
    StageSet,
};
pub use item::{output_name, ItemGeometry, ItemState, WorkItem};
pub use lifecycle::{delete_raw_stores, ItemResources};
pub use metrics::{Metrics, MetricsSnapshot};
pub use stages::{
    Augmentation, Checkpoint, EnsembleLoader, EnsembleState, InferenceOutcome, InferenceStage,
    PostProcessStage, RawStores,
};
