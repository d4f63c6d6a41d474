//! Top-level item loop.
//!
//! Items are processed one at a time in resolver order. Each item walks
//! `Resolved → Classified → Cached → Inferred → (SkippedPostProcess | PostProcessed) → Cleaned`;
//! every blocking step runs on the blocking pool and is raced against the shutdown token so an
//! interrupt abandons the current item immediately.

use crate::config::{Config, FaultMode};
use crate::error::{PipelineError, Result, StageKind, EXIT_FAILURE, EXIT_INFERENCE_ONLY, EXIT_SUCCESS};
use crate::input::{resolve_inputs, ItemSource};
use crate::io::{self, ArrayStore, StoreRole};
use crate::pipeline::item::output_name;
use crate::pipeline::lifecycle::{delete_raw_stores, ItemResources};
use crate::pipeline::stages::{
    EnsembleLoader, EnsembleState, InferenceOutcome, InferenceStage, PostProcessStage, RawStores,
};
use crate::pipeline::{resume, ItemState, Metrics, WorkItem};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How long a cancelled stage gets to stop its worker before the item is abandoned.
const STAGE_STOP_GRACE: Duration = Duration::from_secs(5);

/// The collaborators a run is wired with.
#[derive(Clone)]
pub struct StageSet {
    pub loader: Arc<dyn EnsembleLoader>,
    pub inference: Arc<dyn InferenceStage>,
    pub post_process: Arc<dyn PostProcessStage>,
}

/// Counts for one run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunStats {
    /// Items resolved from the input specification
    pub total: usize,

    /// Items that reached `Cleaned`
    pub completed: usize,

    /// Items whose post-processing ran in this run
    pub post_processed: usize,

    /// Items whose post-processing was already done
    pub post_process_skipped: usize,

    /// Items abandoned after a stage failure
    pub failed: usize,
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Completed: {}, Post-processed: {}, Already done: {}, Failed: {}, Total: {}",
            self.completed, self.post_processed, self.post_process_skipped, self.failed, self.total
        )
    }
}

/// How a run ended when it did not end in an error.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Every item was visited
    Completed(RunStats),
    /// Inference-only mode stopped the run after the first item's inference
    InferenceOnly(RunStats),
}

impl RunOutcome {
    pub fn stats(&self) -> &RunStats {
        match self {
            RunOutcome::Completed(stats) | RunOutcome::InferenceOnly(stats) => stats,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Completed(stats) if stats.failed > 0 => EXIT_FAILURE,
            RunOutcome::Completed(_) => EXIT_SUCCESS,
            RunOutcome::InferenceOnly(_) => EXIT_INFERENCE_ONLY,
        }
    }
}

/// Terminal status of one item.
enum ItemStatus {
    Done { post_processed: bool },
    /// Stop the whole run after this item (inference-only mode)
    StopRun,
}

/// Resolve the input specification into work items.
///
/// Fails before any model is touched if the inputs are unusable: nothing matches, a remote item
/// has no cache directory to land in, or two items would write to the same output directory.
pub fn resolve_work(config: &Config) -> Result<Vec<(ItemSource, WorkItem)>> {
    let sources = resolve_inputs(&config.input.spec)?;

    if config.input.cache_dir.is_none() {
        if let Some(remote) = sources.iter().find(|s| s.is_remote()) {
            return Err(PipelineError::Configuration(format!(
                "Remote input {} requires a cache directory (--cache)",
                remote
            )));
        }
    }

    let mut seen: HashMap<String, &ItemSource> = HashMap::new();
    for source in &sources {
        let name = output_name(source).ok_or_else(|| {
            PipelineError::Configuration(format!("Cannot derive an output name from {}", source))
        })?;
        if let Some(first) = seen.insert(name.clone(), source) {
            return Err(PipelineError::Configuration(format!(
                "Inputs {} and {} would both write to {}",
                first,
                source,
                config.output.dir.join(&name).display()
            )));
        }
    }

    sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            WorkItem::new(index, source, &config.output.dir).map(|item| (source.clone(), item))
        })
        .collect()
}

/// Drives a run over all resolved items.
pub struct Pipeline {
    config: Arc<Config>,
    stages: StageSet,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(config: Config, stages: StageSet, shutdown: CancellationToken) -> Self {
        Self::with_metrics(config, stages, shutdown, Metrics::new())
    }

    pub fn with_metrics(
        config: Config,
        stages: StageSet,
        shutdown: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            stages,
            metrics,
            shutdown,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run every item. Errors that end the run are returned; stage failures of single items
    /// are counted instead when fault isolation is set to `continue`.
    pub async fn run(&self) -> Result<RunOutcome> {
        self.config.validate()?;
        tracing::info!(
            "Optimizing post-processing for: {}",
            self.config.post_process.metric
        );

        let work = resolve_work(&self.config)?;

        std::fs::create_dir_all(&self.config.output.dir).map_err(|e| {
            PipelineError::io(
                format!("creating output directory {}", self.config.output.dir.display()),
                e,
            )
        })?;
        tracing::info!("Results will be saved to: {}", self.config.output.dir.display());

        let ensemble = self.load_ensemble().await?;

        let mut stats = RunStats {
            total: work.len(),
            ..Default::default()
        };
        tracing::info!("Running inference on {} file(s)", stats.total);

        for (source, mut item) in work {
            if self.shutdown.is_cancelled() {
                return Err(PipelineError::Interrupted);
            }

            match self.process_item(&source, &mut item, &ensemble).await {
                Ok(ItemStatus::Done { post_processed }) => {
                    stats.completed += 1;
                    self.metrics.add_item_completed();
                    if post_processed {
                        stats.post_processed += 1;
                    } else {
                        stats.post_process_skipped += 1;
                    }
                }
                Ok(ItemStatus::StopRun) => {
                    stats.completed += 1;
                    self.metrics.add_item_completed();
                    tracing::info!("Exiting after inference");
                    self.finish(&stats);
                    return Ok(RunOutcome::InferenceOnly(stats));
                }
                Err(e)
                    if !e.is_process_fatal()
                        && self.config.execution.on_item_error == FaultMode::Continue =>
                {
                    tracing::error!("Skipping {}: {}", item.source, e);
                    stats.failed += 1;
                    self.metrics.add_item_failed();
                }
                Err(e) => return Err(e),
            }
        }

        self.finish(&stats);
        Ok(RunOutcome::Completed(stats))
    }

    async fn load_ensemble(&self) -> Result<Arc<EnsembleState>> {
        let loader = self.stages.loader.clone();
        let config = self.config.clone();
        tracing::info!("Loading model from: {:?}", self.config.model.checkpoints);

        let ensemble = self
            .blocking(move || loader.load(&config))
            .await?
            .map_err(|e| match e.downcast::<PipelineError>() {
                Ok(inner) => inner,
                Err(e) => PipelineError::ModelLoad(format!("{:#}", e)),
            })?;

        tracing::info!(
            "Loaded {} checkpoint(s) with {} TTA view(s)",
            ensemble.checkpoints.len(),
            ensemble.augmentations.len()
        );
        Ok(Arc::new(ensemble))
    }

    async fn process_item(
        &self,
        source: &ItemSource,
        item: &mut WorkItem,
        ensemble: &Arc<EnsembleState>,
    ) -> Result<ItemStatus> {
        let start = Instant::now();
        item.classify()?;
        tracing::info!("Processing {} as {} (item #{})", item.source, item.mode, item.index + 1);

        let staged = match &self.config.input.cache_dir {
            Some(cache_dir) => {
                let cache_start = Instant::now();
                tracing::info!("Caching input at: {}", cache_dir.display());
                let staged = tokio::select! {
                    staged = io::stage_item(source, cache_dir, &self.config.input, &self.metrics) => staged?,
                    _ = self.shutdown.cancelled() => return Err(PipelineError::Interrupted),
                };
                self.metrics.add_cache_time(cache_start.elapsed());
                tracing::info!("{}", staged.path.display());
                item.set_effective_path(staged.path.clone())?;
                Some(staged)
            }
            None => {
                let path = item.input_path.clone();
                item.set_effective_path(path)?;
                None
            }
        };

        let mut resources = ItemResources::new();
        let result = self.run_stages(item, ensemble, &mut resources, start).await;

        let closed = resources.close_all();
        debug_assert!(resources.is_empty());
        if result.is_err() && closed > 0 {
            tracing::warn!(
                "Closed {} open store handle(s) of {} after failure",
                closed,
                item.name()
            );
        }

        if let Some(staged) = staged.filter(|_| self.config.input.evict_cache) {
            io::evict(&staged);
        }
        result
    }

    async fn run_stages(
        &self,
        item: &mut WorkItem,
        ensemble: &Arc<EnsembleState>,
        resources: &mut ItemResources,
        start: Instant,
    ) -> Result<ItemStatus> {
        let inference_start = Instant::now();
        let outcome = {
            let stage = self.stages.inference.clone();
            let config = self.config.clone();
            let ensemble = ensemble.clone();
            let snapshot = item.clone();
            self.blocking(move || stage.run(&config, &ensemble, &snapshot))
                .await?
                .map_err(|e| PipelineError::stage(StageKind::Inference, item.name(), e))?
        };
        self.metrics.add_inference_time(inference_start.elapsed());

        match outcome {
            InferenceOutcome::Produced { stores, geometry } => {
                resources.set_raw(stores);
                if geometry.is_some() {
                    item.geometry = geometry;
                }
            }
            InferenceOutcome::Skipped => {
                tracing::info!("Inference outputs for {} already exist", item.name());
            }
        }
        item.advance(ItemState::Inferred)?;
        tracing::info!(
            "::: finished or skipped inference after {:.1}s",
            inference_start.elapsed().as_secs_f64()
        );

        if self.config.inference.only_inference {
            resources.close_raw();
            item.advance(ItemState::Cleaned)?;
            return Ok(ItemStatus::StopRun);
        }

        let post_start = Instant::now();
        let post_processed = if resume::is_complete(item) {
            tracing::info!(
                "Final store {} exists, skipping post-processing",
                resume::marker_path(item).display()
            );
            resources.close_raw();
            item.advance(ItemState::SkippedPostProcess)?;
            self.metrics.add_item_post_process_skipped();
            false
        } else {
            if resources.raw().is_none() {
                resources.set_raw(self.reopen_raw_stores(item)?);
            }
            let raw = resources.raw().cloned().ok_or_else(|| {
                PipelineError::Other(anyhow::anyhow!("No raw stores held for {}", item.name()))
            })?;

            tracing::info!("Running post-processing for {}", item.name());
            let final_store = {
                let stage = self.stages.post_process.clone();
                let config = self.config.clone();
                let ensemble = ensemble.clone();
                let snapshot = item.clone();
                self.blocking(move || stage.run(&config, &ensemble, &snapshot, &raw))
                    .await?
                    .map_err(|e| PipelineError::stage(StageKind::PostProcess, item.name(), e))?
            };
            resources.set_final(final_store);
            item.advance(ItemState::PostProcessed)?;
            self.metrics.add_post_process_time(post_start.elapsed());
            self.metrics.add_item_post_processed();

            // Raw stores must be closed before their directories go away
            resources.close_raw();
            if !self.config.output.keep_raw {
                delete_raw_stores(item, &self.metrics);
            }
            true
        };

        tracing::info!(
            "::: post-processing took {:.1}s, total elapsed time {:.1}s",
            post_start.elapsed().as_secs_f64(),
            start.elapsed().as_secs_f64()
        );

        resources.close_all();
        item.advance(ItemState::Cleaned)?;
        Ok(ItemStatus::Done { post_processed })
    }

    /// Open the raw stores an earlier inference-only run left behind.
    fn reopen_raw_stores(&self, item: &WorkItem) -> Result<RawStores> {
        let missing = |e: anyhow::Error| {
            PipelineError::stage(
                StageKind::Inference,
                item.name(),
                e.context("inference was skipped but its raw stores cannot be opened"),
            )
        };

        let instance = ArrayStore::open(
            &item.instance_store_path(),
            StoreRole::Instance,
            Some(self.metrics.clone()),
        )
        .map_err(missing)?;
        let class = match ArrayStore::open(
            &item.class_store_path(),
            StoreRole::Class,
            Some(self.metrics.clone()),
        ) {
            Ok(class) => class,
            Err(e) => {
                instance.close();
                return Err(missing(e));
            }
        };
        Ok(RawStores { instance, class })
    }

    /// Run `f` on the blocking pool, giving up on it when shutdown is requested.
    ///
    /// Stages see the same token. A cancelled stage gets [`STAGE_STOP_GRACE`] to kill its
    /// worker process before the item is abandoned.
    async fn blocking<T, F>(&self, f: F) -> Result<anyhow::Result<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut task = tokio::task::spawn_blocking(f);
        tokio::select! {
            joined = &mut task => joined.map_err(|e| PipelineError::Other(anyhow::anyhow!("Stage task failed: {}", e))),
            _ = self.shutdown.cancelled() => {
                if tokio::time::timeout(STAGE_STOP_GRACE, task).await.is_err() {
                    tracing::warn!("Stage did not stop within {:?} of shutdown", STAGE_STOP_GRACE);
                }
                Err(PipelineError::Interrupted)
            }
        }
    }

    fn finish(&self, stats: &RunStats) {
        tracing::info!("Pipeline complete: {}", stats);

        let snapshot = self.metrics.snapshot();
        tracing::debug!("{}", snapshot);
        if let Some(ref path) = self.config.execution.metrics_output_path {
            if let Err(e) = snapshot.save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }
    }
}

/// Resumability state of one item, as reported by a dry run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    /// Nothing produced yet
    Pending,
    /// Raw stores exist; only post-processing is left
    Inferred,
    /// Final store exists; the item will be skipped
    Complete,
}

/// One item of a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedItem {
    pub item: WorkItem,
    pub state: PlanState,
}

/// Dry-run report: what a run with this configuration would do.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub items: Vec<PlannedItem>,
}

impl RunPlan {
    pub fn count(&self, state: PlanState) -> usize {
        self.items.iter().filter(|p| p.state == state).count()
    }
}

impl std::fmt::Display for RunPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Items: {}, Pending: {}, Inferred: {}, Complete: {}",
            self.items.len(),
            self.count(PlanState::Pending),
            self.count(PlanState::Inferred),
            self.count(PlanState::Complete)
        )
    }
}

/// Resolve and classify the inputs and report each item's resumability state, without loading
/// models or touching any output.
pub fn plan_run(config: &Config) -> Result<RunPlan> {
    config.validate()?;

    let items = resolve_work(config)?
        .into_iter()
        .map(|(_, mut item)| {
            item.classify()?;
            let state = if resume::is_complete(&item) {
                PlanState::Complete
            } else if resume::raw_stores_present(&item) {
                PlanState::Inferred
            } else {
                PlanState::Pending
            };
            Ok(PlannedItem { item, state })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RunPlan { items })
}
