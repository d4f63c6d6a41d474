//! Contracts between the driver and the model-facing stages.
//!
//! The driver owns sequencing, resumability and cleanup; everything that touches models or
//! prediction data sits behind these traits:
//!
//! ```text
//! ┌────────────────┐         ┌────────────────┐           ┌──────────────────┐
//! │ EnsembleLoader │────────▶│ InferenceStage │──────────▶│ PostProcessStage │
//! └────────────────┘         └────────────────┘           └──────────────────┘
//!     once per run             EnsembleState                   RawStores
//! ```
//!
//! Stage calls are blocking; the driver runs them on the blocking thread pool.

use crate::config::Config;
use crate::io::ArrayStore;
use crate::pipeline::{ItemGeometry, WorkItem};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Test-time augmentation view: one of the eight symmetries of the square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Augmentation {
    Identity,
    Rot90,
    Rot180,
    Rot270,
    FlipHorizontal,
    FlipVertical,
    Transpose,
    AntiTranspose,
}

impl Augmentation {
    /// All views, in the order they are added as the TTA count grows.
    pub const ALL: [Augmentation; 8] = [
        Augmentation::Identity,
        Augmentation::FlipHorizontal,
        Augmentation::FlipVertical,
        Augmentation::Rot180,
        Augmentation::Rot90,
        Augmentation::Rot270,
        Augmentation::Transpose,
        Augmentation::AntiTranspose,
    ];

    /// The first `count` views, clamped to 1..=8.
    pub fn views(count: usize) -> Vec<Augmentation> {
        Self::ALL[..count.clamp(1, Self::ALL.len())].to_vec()
    }
}

/// A resolved model checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// Checkpoint directory
    pub path: PathBuf,
    /// Training dataset family, e.g. `lizard` or `pannuke`
    pub dataset: String,
}

/// Models and augmentations shared read-only by every item of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleState {
    pub checkpoints: Vec<Checkpoint>,
    pub augmentations: Vec<Augmentation>,
    pub color_augmentation: bool,
}

impl EnsembleState {
    pub fn dataset(&self) -> Option<&str> {
        self.checkpoints.first().map(|c| c.dataset.as_str())
    }
}

/// Instance and class probability stores produced by inference.
#[derive(Debug, Clone)]
pub struct RawStores {
    pub instance: ArrayStore,
    pub class: ArrayStore,
}

/// Result of one inference call.
#[derive(Debug)]
pub enum InferenceOutcome {
    /// Fresh stores, plus the geometry the stage derived for the item
    Produced {
        stores: RawStores,
        geometry: Option<ItemGeometry>,
    },
    /// Inference did not run because its outputs already exist
    Skipped,
}

/// Loads the ensemble once per run.
pub trait EnsembleLoader: Send + Sync {
    fn load(&self, config: &Config) -> anyhow::Result<EnsembleState>;
}

/// Runs model inference for one item.
pub trait InferenceStage: Send + Sync {
    fn run(
        &self,
        config: &Config,
        ensemble: &EnsembleState,
        item: &WorkItem,
    ) -> anyhow::Result<InferenceOutcome>;
}

/// Stitches raw stores into the final instance segmentation.
///
/// Implementations must not close the raw stores they are given; the driver does.
pub trait PostProcessStage: Send + Sync {
    fn run(
        &self,
        config: &Config,
        ensemble: &EnsembleState,
        item: &WorkItem,
        raw: &RawStores,
    ) -> anyhow::Result<ArrayStore>;
}
