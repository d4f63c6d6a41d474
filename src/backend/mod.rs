//! Default stage implementations: checkpoint directories and worker processes.

mod ensemble;
mod worker;

pub use ensemble::{CheckpointLoader, TRAIN_PARAMS_FILE};
pub use worker::{WorkerInference, WorkerPostProcess};

use crate::pipeline::{Metrics, StageSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stages backed by checkpoint directories and the configured worker commands.
///
/// Cancelling `shutdown` kills any worker process that is still running.
pub fn default_stages(metrics: &Arc<Metrics>, shutdown: &CancellationToken) -> StageSet {
    StageSet {
        loader: Arc::new(CheckpointLoader::new()),
        inference: Arc::new(WorkerInference::new(Some(metrics.clone()), shutdown.clone())),
        post_process: Arc::new(WorkerPostProcess::new(Some(metrics.clone()), shutdown.clone())),
    }
}
