//! Stages backed by external worker processes.
//!
//! A worker is any program that reads one JSON request from stdin, writes the stores named in
//! the request, and exits with status 0. Progress output belongs on stderr, which is passed
//! through. The last stdout line starting with `{` is read as an optional JSON response.
//!
//! Workers always write to `<store>.partial` paths. The stores are moved to their real names
//! only after the worker exited successfully, so a store under its real name is complete.

use crate::config::{Config, Metric};
use crate::io::{delete_store, ArrayStore, StoreRole};
use crate::pipeline::{
    resume, Augmentation, Checkpoint, EnsembleState, InferenceOutcome, InferenceStage,
    ItemGeometry, Metrics, PostProcessStage, RawStores, WorkItem,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

#[derive(Serialize)]
struct InferenceRequest<'a> {
    item: &'a WorkItem,
    checkpoints: &'a [Checkpoint],
    augmentations: &'a [Augmentation],
    color_augmentation: bool,
    batch_size: usize,
    tile_size: usize,
    overlap: f64,
    workers: usize,
    writers: usize,
    compression_level: i32,
    instance_store: &'a Path,
    class_store: &'a Path,
}

#[derive(Serialize)]
struct PostProcessRequest<'a> {
    item: &'a WorkItem,
    dataset: Option<&'a str>,
    metric: Metric,
    tiling: usize,
    overlap: usize,
    workers: usize,
    save_polygon: bool,
    compression_level: i32,
    instance_store: &'a Path,
    class_store: &'a Path,
    final_store: &'a Path,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerResponse {
    #[serde(default)]
    geometry: Option<ItemGeometry>,
}

/// Path a worker writes `store` to before it is promoted.
pub fn partial_path(store: &Path) -> PathBuf {
    let mut name = store.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Remove a leftover partial store from an earlier failed or interrupted worker.
fn clear_partial(partial: &Path) -> Result<()> {
    if delete_store(partial)
        .with_context(|| format!("Failed to remove stale {}", partial.display()))?
    {
        tracing::info!("Removed incomplete store {}", partial.display());
    }
    Ok(())
}

/// Move a finished partial store to its real name, replacing whatever is there.
fn promote(partial: &Path, target: &Path) -> Result<()> {
    if !partial.exists() {
        anyhow::bail!("Worker did not produce {}", partial.display());
    }
    delete_store(target).with_context(|| format!("Failed to replace {}", target.display()))?;
    std::fs::rename(partial, target).with_context(|| {
        format!("Failed to move {} to {}", partial.display(), target.display())
    })
}

/// Run a worker command with `request` on stdin.
///
/// Blocks the calling thread. Cancelling `shutdown` kills the worker and returns an error.
fn run_worker<R: Serialize>(
    command: &[String],
    request: &R,
    shutdown: &CancellationToken,
) -> Result<Option<WorkerResponse>> {
    let payload = serde_json::to_vec(request).context("Failed to encode worker request")?;
    let worker = supervise(command, payload, shutdown);

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(worker),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build worker runtime")?
            .block_on(worker),
    }
}

async fn supervise(
    command: &[String],
    payload: Vec<u8>,
    shutdown: &CancellationToken,
) -> Result<Option<WorkerResponse>> {
    let (program, args) = command.split_first().context("Worker command is empty")?;

    tracing::debug!("Starting worker: {}", command.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start worker '{}'", program))?;

    let finished = tokio::select! {
        result = exchange(&mut child, payload) => Some(result),
        _ = shutdown.cancelled() => None,
    };

    let (status, stdout) = match finished {
        Some(result) => result.with_context(|| format!("Failed to talk to worker '{}'", program))?,
        None => {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill worker '{}': {}", program, e);
            }
            anyhow::bail!("Worker '{}' killed on shutdown", program);
        }
    };

    if !status.success() {
        anyhow::bail!("Worker '{}' exited with {}", program, status);
    }

    String::from_utf8_lossy(&stdout)
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .last()
        .map(|line| serde_json::from_str(line).context("Invalid worker response"))
        .transpose()
}

/// Send the request, collect stdout and wait for the worker to exit.
async fn exchange(
    child: &mut Child,
    payload: Vec<u8>,
) -> std::io::Result<(std::process::ExitStatus, Vec<u8>)> {
    if let Some(mut stdin) = child.stdin.take() {
        let written = match stdin.write_all(&payload).await {
            Ok(()) => stdin.write_all(b"\n").await,
            Err(e) => Err(e),
        };
        // A worker that does not read its request may already be gone; its exit status decides
        if let Err(e) = written {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e);
            }
        }
    }

    let mut stdout = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_end(&mut stdout).await?;
    }
    let status = child.wait().await?;
    Ok((status, stdout))
}

/// Inference through the configured inference worker.
///
/// Skips the worker when the item's final store or both raw stores already exist.
#[derive(Debug, Default, Clone)]
pub struct WorkerInference {
    metrics: Option<Arc<Metrics>>,
    shutdown: CancellationToken,
}

impl WorkerInference {
    pub fn new(metrics: Option<Arc<Metrics>>, shutdown: CancellationToken) -> Self {
        Self { metrics, shutdown }
    }
}

impl InferenceStage for WorkerInference {
    fn run(
        &self,
        config: &Config,
        ensemble: &EnsembleState,
        item: &WorkItem,
    ) -> Result<InferenceOutcome> {
        if resume::is_complete(item) || resume::raw_stores_present(item) {
            return Ok(InferenceOutcome::Skipped);
        }

        std::fs::create_dir_all(&item.output_dir)
            .with_context(|| format!("Failed to create {}", item.output_dir.display()))?;

        let instance_path = item.instance_store_path();
        let class_path = item.class_store_path();
        let instance_partial = partial_path(&instance_path);
        let class_partial = partial_path(&class_path);
        clear_partial(&instance_partial)?;
        clear_partial(&class_partial)?;

        let request = InferenceRequest {
            item,
            checkpoints: &ensemble.checkpoints,
            augmentations: &ensemble.augmentations,
            color_augmentation: ensemble.color_augmentation,
            batch_size: config.model.batch_size,
            tile_size: config.inference.tile_size,
            overlap: config.inference.overlap,
            workers: config.inference.workers,
            writers: config.inference.writers,
            compression_level: config.output.compression_level,
            instance_store: &instance_partial,
            class_store: &class_partial,
        };
        let response = run_worker(&config.backend.inference_command, &request, &self.shutdown)?;

        // Instance last: raw_stores_present() needs both names
        promote(&class_partial, &class_path)
            .context("Inference worker did not finish the class store")?;
        promote(&instance_partial, &instance_path)
            .context("Inference worker did not finish the instance store")?;

        let instance = ArrayStore::open(&instance_path, StoreRole::Instance, self.metrics.clone())?;
        let class = match ArrayStore::open(&class_path, StoreRole::Class, self.metrics.clone()) {
            Ok(class) => class,
            Err(e) => {
                instance.close();
                return Err(e);
            }
        };

        Ok(InferenceOutcome::Produced {
            stores: RawStores { instance, class },
            geometry: response.and_then(|r| r.geometry),
        })
    }
}

/// Post-processing through the configured post-processing worker.
///
/// The worker writes to a `.partial` store that is renamed to the final store name only after
/// the worker succeeded, so the final store never exists half-written.
#[derive(Debug, Default, Clone)]
pub struct WorkerPostProcess {
    metrics: Option<Arc<Metrics>>,
    shutdown: CancellationToken,
}

impl WorkerPostProcess {
    pub fn new(metrics: Option<Arc<Metrics>>, shutdown: CancellationToken) -> Self {
        Self { metrics, shutdown }
    }
}

impl PostProcessStage for WorkerPostProcess {
    fn run(
        &self,
        config: &Config,
        ensemble: &EnsembleState,
        item: &WorkItem,
        raw: &RawStores,
    ) -> Result<ArrayStore> {
        let final_path = item.final_store_path();
        let partial = partial_path(&final_path);
        clear_partial(&partial)?;

        let request = PostProcessRequest {
            item,
            dataset: ensemble.dataset(),
            metric: config.post_process.metric,
            tiling: config.post_process.tiling,
            overlap: config.post_process.overlap,
            workers: config.post_process.workers,
            save_polygon: config.output.save_polygon,
            compression_level: config.output.compression_level,
            instance_store: raw.instance.path(),
            class_store: raw.class.path(),
            final_store: &partial,
        };
        run_worker(&config.backend.post_process_command, &request, &self.shutdown)?;
        promote(&partial, &final_path).context("Post-processing worker did not finish")?;

        ArrayStore::open(&final_path, StoreRole::Final, self.metrics.clone())
    }
}
