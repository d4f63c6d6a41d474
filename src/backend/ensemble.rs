//! Checkpoint resolution for the model ensemble.

use crate::config::Config;
use crate::error::PipelineError;
use crate::pipeline::{Augmentation, Checkpoint, EnsembleLoader, EnsembleState};
use std::path::Path;

/// File every checkpoint directory must contain.
pub const TRAIN_PARAMS_FILE: &str = "train_params.toml";

/// Resolves checkpoint ids against `model.checkpoint_root`.
///
/// Checkpoint `lizard_convnextv2_large` lives in `<checkpoint_root>/lizard_convnextv2_large/`.
/// The part of the id before the first `_` names the training dataset; all members of an
/// ensemble must share it since their class layouts have to agree.
#[derive(Debug, Default, Clone)]
pub struct CheckpointLoader;

impl CheckpointLoader {
    pub fn new() -> Self {
        Self
    }

    fn resolve(root: &Path, id: &str) -> Result<Checkpoint, PipelineError> {
        let path = root.join(id);
        if !path.join(TRAIN_PARAMS_FILE).is_file() {
            return Err(PipelineError::ModelLoad(format!(
                "Unknown checkpoint '{}': {} not found in {}",
                id,
                TRAIN_PARAMS_FILE,
                path.display()
            )));
        }

        let dataset = id.split('_').next().unwrap_or(id).to_string();
        Ok(Checkpoint {
            id: id.to_string(),
            path,
            dataset,
        })
    }
}

impl EnsembleLoader for CheckpointLoader {
    fn load(&self, config: &Config) -> anyhow::Result<EnsembleState> {
        let root = &config.model.checkpoint_root;

        let checkpoints = config
            .model
            .checkpoints
            .iter()
            .map(|id| Self::resolve(root, id))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(first) = checkpoints.first() {
            if let Some(other) = checkpoints.iter().find(|c| c.dataset != first.dataset) {
                return Err(PipelineError::ModelLoad(format!(
                    "Checkpoints '{}' ({}) and '{}' ({}) were trained on different datasets",
                    first.id, first.dataset, other.id, other.dataset
                ))
                .into());
            }
        }

        for cp in &checkpoints {
            tracing::debug!("Resolved checkpoint {} at {}", cp.id, cp.path.display());
        }

        Ok(EnsembleState {
            checkpoints,
            augmentations: Augmentation::views(config.model.tta),
            color_augmentation: config.model.color_augmentation,
        })
    }
}
