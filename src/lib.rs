//! HoVer-NeXt Pipeline
//!
//! Batch orchestration of nuclei segmentation and classification over single images, numpy
//! arrays and whole-slide images.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Input**: resolution of paths, glob patterns and list files into an ordered item list,
//!   plus extension-based classification
//! - **I/O**: Zarr array store handles, cache staging and remote (`s3://`) inputs via object_store
//! - **Pipeline**: the per-item state machine, resumability, handle lifecycle and the driver loop
//! - **Backend**: checkpoint resolution and the worker processes that run the models
//!
//! # Usage
//!
//! ```no_run
//! use hover_next_pipeline::{run_pipeline, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> hover_next_pipeline::Result<()> {
//!     let config = Config::from_file("config.yaml".as_ref())?;
//!     let outcome = run_pipeline(config, CancellationToken::new()).await?;
//!     std::process::exit(outcome.exit_code().into());
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod input;
pub mod io;
pub mod pipeline;

pub use backend::{default_stages, CheckpointLoader, WorkerInference, WorkerPostProcess};
pub use config::{Config, FaultMode, Metric, Overrides};
pub use error::{PipelineError, Result};
pub use pipeline::{
    plan_run, EnsembleLoader, Metrics, Pipeline, RunOutcome, RunPlan, RunStats, StageSet,
};

use tokio_util::sync::CancellationToken;

/// Run the full pipeline with the default stages.
///
/// Cancelling `shutdown` abandons the current item, closes its store handles and returns
/// [`PipelineError::Interrupted`].
pub async fn run_pipeline(config: Config, shutdown: CancellationToken) -> Result<RunOutcome> {
    tracing::info!("Starting HoVer-NeXt pipeline");

    let metrics = Metrics::new();
    let stages = default_stages(&metrics, &shutdown);
    let pipeline = Pipeline::with_metrics(config, stages, shutdown, metrics.clone());

    let outcome = pipeline.run().await?;
    metrics.snapshot().print_summary();

    Ok(outcome)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    builder
        .build()
        .map_err(|e| PipelineError::io("building the async runtime", e))
}
