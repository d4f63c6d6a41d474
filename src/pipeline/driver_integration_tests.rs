//! End-to-end driver runs against in-process stages that write real Zarr stores.

use crate::config::{Config, FaultMode};
use crate::error::{PipelineError, EXIT_FAILURE, EXIT_INFERENCE_ONLY, EXIT_SUCCESS};
use crate::io::{ArrayStore, StoreLayout, StoreRole};
use crate::pipeline::{
    resume, Augmentation, EnsembleLoader, EnsembleState, InferenceOutcome, InferenceStage,
    ItemGeometry, Metrics, Pipeline, PostProcessStage, RawStores, RunOutcome, StageSet, WorkItem,
};
use ndarray::Array3;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn layout() -> StoreLayout {
    StoreLayout {
        shape: [2, 8, 8],
        chunk_shape: [2, 8, 8],
        compression_level: 1,
    }
}

fn write_store(path: &Path, role: StoreRole, metrics: &Arc<Metrics>) -> anyhow::Result<ArrayStore> {
    let store = ArrayStore::create(path, role, &layout(), Some(metrics.clone()))?;
    store.write_chunk(&[0, 0, 0], Array3::from_elem((2, 8, 8), 0.5f32))?;
    Ok(store)
}

#[derive(Default)]
struct MockLoader {
    calls: AtomicUsize,
}

impl EnsembleLoader for MockLoader {
    fn load(&self, config: &Config) -> anyhow::Result<EnsembleState> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EnsembleState {
            checkpoints: Vec::new(),
            augmentations: Augmentation::views(config.model.tta),
            color_augmentation: false,
        })
    }
}

struct MockInference {
    metrics: Arc<Metrics>,
    calls: AtomicUsize,
    produced: AtomicUsize,
    fail_for: Option<&'static str>,
    always_skip: bool,
    seen_paths: Mutex<Vec<PathBuf>>,
}

impl InferenceStage for MockInference {
    fn run(
        &self,
        _config: &Config,
        _ensemble: &EnsembleState,
        item: &WorkItem,
    ) -> anyhow::Result<InferenceOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_paths
            .lock()
            .unwrap()
            .push(item.input_path.clone());

        if self.fail_for == Some(item.name().as_str()) {
            anyhow::bail!("CUDA out of memory");
        }
        if self.always_skip || resume::is_complete(item) || resume::raw_stores_present(item) {
            return Ok(InferenceOutcome::Skipped);
        }

        std::fs::create_dir_all(&item.output_dir)?;
        let instance = write_store(&item.instance_store_path(), StoreRole::Instance, &self.metrics)?;
        let class = write_store(&item.class_store_path(), StoreRole::Class, &self.metrics)?;
        self.produced.fetch_add(1, Ordering::SeqCst);

        Ok(InferenceOutcome::Produced {
            stores: RawStores { instance, class },
            geometry: Some(ItemGeometry {
                width: 8,
                height: 8,
                mpp: Some(0.5),
            }),
        })
    }
}

#[derive(Clone, Copy)]
enum PostBehavior {
    Succeed,
    Fail,
    /// Block until shutdown is requested, like a worker that is killed on interrupt
    WaitForShutdown,
}

struct MockPostProcess {
    metrics: Arc<Metrics>,
    calls: AtomicUsize,
    behavior: PostBehavior,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl PostProcessStage for MockPostProcess {
    fn run(
        &self,
        _config: &Config,
        _ensemble: &EnsembleState,
        item: &WorkItem,
        raw: &RawStores,
    ) -> anyhow::Result<ArrayStore> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        assert!(raw.instance.is_open() && raw.class.is_open());
        assert_eq!(raw.instance.shape()?, vec![2, 8, 8]);

        match self.behavior {
            PostBehavior::Succeed => write_store(&item.final_store_path(), StoreRole::Final, &self.metrics),
            PostBehavior::Fail => anyhow::bail!("watershed failed"),
            PostBehavior::WaitForShutdown => {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !self.shutdown.is_cancelled() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                anyhow::bail!("post-processing cancelled")
            }
        }
    }
}

struct Harness {
    dir: TempDir,
    metrics: Arc<Metrics>,
    loader: Arc<MockLoader>,
    inference: Arc<MockInference>,
    post: Arc<MockPostProcess>,
    shutdown: CancellationToken,
}

impl Harness {
    fn new(behavior: PostBehavior) -> Self {
        Self::with_inference(behavior, None, false)
    }

    fn with_inference(
        behavior: PostBehavior,
        fail_for: Option<&'static str>,
        always_skip: bool,
    ) -> Self {
        let metrics = Metrics::new();
        let shutdown = CancellationToken::new();
        Self {
            dir: TempDir::new().unwrap(),
            loader: Arc::new(MockLoader::default()),
            inference: Arc::new(MockInference {
                metrics: metrics.clone(),
                calls: AtomicUsize::new(0),
                produced: AtomicUsize::new(0),
                fail_for,
                always_skip,
                seen_paths: Mutex::new(Vec::new()),
            }),
            post: Arc::new(MockPostProcess {
                metrics: metrics.clone(),
                calls: AtomicUsize::new(0),
                behavior,
                started: AtomicBool::new(false),
                shutdown: shutdown.clone(),
            }),
            metrics,
            shutdown,
        }
    }

    fn input(&self, name: &str) -> PathBuf {
        let inputs = self.dir.path().join("inputs");
        std::fs::create_dir_all(&inputs).unwrap();
        let path = inputs.join(name);
        std::fs::write(&path, b"image bytes").unwrap();
        path
    }

    fn out(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    fn config(&self, spec: String) -> Config {
        let mut config = Config::default();
        config.input.spec = spec;
        config.output.dir = self.out();
        config.model.checkpoints = vec!["lizard_convnextv2_large".to_string()];
        config
    }

    fn pipeline(&self, config: Config) -> Pipeline {
        let stages = StageSet {
            loader: self.loader.clone(),
            inference: self.inference.clone(),
            post_process: self.post.clone(),
        };
        Pipeline::with_metrics(config, stages, self.shutdown.clone(), self.metrics.clone())
    }

    async fn run(&self, config: Config) -> crate::error::Result<RunOutcome> {
        self.pipeline(config).run().await
    }

    fn item_dir(&self, stem: &str) -> PathBuf {
        self.out().join(stem)
    }
}

#[tokio::test]
async fn test_single_image_end_to_end() {
    let h = Harness::new(PostBehavior::Succeed);
    let image = h.input("tile.png");

    let outcome = h.run(h.config(image.display().to_string())).await.unwrap();

    assert_eq!(outcome.exit_code(), EXIT_SUCCESS);
    assert_eq!(outcome.stats().post_processed, 1);
    let item_dir = h.item_dir("tile");
    assert!(item_dir.join("pinst_pp.zarr").join("zarr.json").exists());
    assert!(!item_dir.join("pred_inst.zarr").exists());
    assert!(!item_dir.join("pred_cls.zarr").exists());
    assert_eq!(h.metrics.open_stores(), 0);
    assert_eq!(h.metrics.stores_opened.load(Ordering::SeqCst), 3);
    assert_eq!(h.metrics.raw_stores_deleted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_only_inference_stops_after_first_item() {
    let h = Harness::new(PostBehavior::Succeed);
    let slides: Vec<_> = ["a.svs", "b.svs", "c.svs"].iter().map(|n| h.input(n)).collect();
    let list = h.dir.path().join("slides.txt");
    std::fs::write(
        &list,
        slides
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    )
    .unwrap();

    let mut config = h.config(list.display().to_string());
    config.inference.only_inference = true;
    let outcome = h.run(config).await.unwrap();

    assert!(matches!(outcome, RunOutcome::InferenceOnly(_)));
    assert_eq!(outcome.exit_code(), EXIT_INFERENCE_ONLY);
    assert_eq!(h.inference.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.post.calls.load(Ordering::SeqCst), 0);
    assert!(!h.item_dir("a").join("pinst_pp.zarr").exists());
    assert!(h.item_dir("a").join("pred_inst.zarr").exists());
    assert!(!h.item_dir("b").exists());
    assert_eq!(h.metrics.open_stores(), 0);
}

#[tokio::test]
async fn test_no_match_fails_before_loading_models() {
    let h = Harness::new(PostBehavior::Succeed);
    let spec = format!("{}/*.svs", h.dir.path().display());

    let err = h.run(h.config(spec)).await.unwrap_err();

    assert!(matches!(err, PipelineError::Configuration(_)));
    assert_eq!(err.exit_code(), EXIT_FAILURE);
    assert_eq!(h.loader.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.inference.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rerun_skips_post_processing() {
    let h = Harness::new(PostBehavior::Succeed);
    h.input("a.svs");
    h.input("b.svs");
    let spec = format!("{}/inputs/*.svs", h.dir.path().display());

    let first = h.run(h.config(spec.clone())).await.unwrap();
    assert_eq!(first.stats().post_processed, 2);

    let second = h.run(h.config(spec)).await.unwrap();
    assert_eq!(second.exit_code(), EXIT_SUCCESS);
    assert_eq!(second.stats().post_processed, 0);
    assert_eq!(second.stats().post_process_skipped, 2);
    assert_eq!(h.post.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.inference.produced.load(Ordering::SeqCst), 2);
    assert_eq!(h.metrics.open_stores(), 0);
}

#[tokio::test]
async fn test_post_process_failure_closes_handles() {
    let h = Harness::new(PostBehavior::Fail);
    let slide = h.input("a.svs");

    let err = h.run(h.config(slide.display().to_string())).await.unwrap_err();

    assert!(matches!(err, PipelineError::Stage { .. }));
    assert!(err.to_string().contains("watershed failed"));
    assert_eq!(h.metrics.stores_opened.load(Ordering::SeqCst), 2);
    assert_eq!(h.metrics.stores_closed.load(Ordering::SeqCst), 2);
    // Raw stores are only deleted after successful post-processing
    assert!(h.item_dir("a").join("pred_inst.zarr").exists());
    assert!(h.item_dir("a").join("pred_cls.zarr").exists());
    assert!(!h.item_dir("a").join("pinst_pp.zarr").exists());
}

#[tokio::test]
async fn test_keep_raw_retains_intermediate_stores() {
    let h = Harness::new(PostBehavior::Succeed);
    let slide = h.input("a.svs");

    let mut config = h.config(slide.display().to_string());
    config.output.keep_raw = true;
    h.run(config).await.unwrap();

    let item_dir = h.item_dir("a");
    assert!(item_dir.join("pinst_pp.zarr").exists());
    assert!(item_dir.join("pred_inst.zarr").exists());
    assert!(item_dir.join("pred_cls.zarr").exists());
    assert_eq!(h.metrics.raw_stores_deleted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_post_process_after_inference_only_run() {
    let h = Harness::new(PostBehavior::Succeed);
    let slide = h.input("a.svs");

    let mut config = h.config(slide.display().to_string());
    config.inference.only_inference = true;
    let first = h.run(config).await.unwrap();
    assert_eq!(first.exit_code(), EXIT_INFERENCE_ONLY);

    // Second invocation finds the raw stores, skips inference and post-processes them
    let second = h.run(h.config(slide.display().to_string())).await.unwrap();
    assert_eq!(second.exit_code(), EXIT_SUCCESS);
    assert_eq!(second.stats().post_processed, 1);
    assert_eq!(h.inference.produced.load(Ordering::SeqCst), 1);
    assert!(h.item_dir("a").join("pinst_pp.zarr").exists());
    assert!(!h.item_dir("a").join("pred_inst.zarr").exists());
    assert_eq!(h.metrics.open_stores(), 0);
}

#[tokio::test]
async fn test_skipped_inference_without_stores_is_stage_error() {
    let h = Harness::with_inference(PostBehavior::Succeed, None, true);
    let slide = h.input("a.svs");

    let err = h.run(h.config(slide.display().to_string())).await.unwrap_err();

    assert!(matches!(err, PipelineError::Stage { .. }));
    assert_eq!(h.post.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.metrics.open_stores(), 0);
}

#[tokio::test]
async fn test_interrupt_during_post_processing() {
    let h = Harness::new(PostBehavior::WaitForShutdown);
    h.input("a.svs");
    h.input("b.svs");

    let spec = format!("{}/inputs/*.svs", h.dir.path().display());
    let pipeline = h.pipeline(h.config(spec));
    let task = tokio::spawn(async move { pipeline.run().await });

    let deadline = Instant::now() + Duration::from_secs(10);
    while !h.post.started.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "post-processing never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let cancelled_at = Instant::now();
    h.shutdown.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    // The stage stopped on its own instead of running out the grace period
    assert!(cancelled_at.elapsed() < Duration::from_secs(4));

    assert_eq!(h.metrics.open_stores(), 0);
    assert_eq!(h.inference.calls.load(Ordering::SeqCst), 1, "second item must not start");
    assert!(!h.item_dir("a").join("pinst_pp.zarr").exists());
}

#[tokio::test]
async fn test_continue_mode_isolates_failing_item() {
    let h = Harness::with_inference(PostBehavior::Succeed, Some("b"), false);
    for name in ["a.svs", "b.svs", "c.svs"] {
        h.input(name);
    }
    let spec = format!("{}/inputs/*.svs", h.dir.path().display());

    let mut config = h.config(spec);
    config.execution.on_item_error = FaultMode::Continue;
    let outcome = h.run(config).await.unwrap();

    assert_eq!(outcome.stats().failed, 1);
    assert_eq!(outcome.stats().completed, 2);
    assert_eq!(outcome.exit_code(), EXIT_FAILURE);
    assert!(h.item_dir("a").join("pinst_pp.zarr").exists());
    assert!(h.item_dir("c").join("pinst_pp.zarr").exists());
    assert_eq!(h.metrics.items_failed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_abort_mode_stops_at_failing_item() {
    let h = Harness::with_inference(PostBehavior::Succeed, Some("b"), false);
    for name in ["a.svs", "b.svs", "c.svs"] {
        h.input(name);
    }
    let spec = format!("{}/inputs/*.svs", h.dir.path().display());

    let err = h.run(h.config(spec)).await.unwrap_err();

    assert!(matches!(err, PipelineError::Stage { .. }));
    assert_eq!(h.inference.calls.load(Ordering::SeqCst), 2);
    assert!(h.item_dir("a").join("pinst_pp.zarr").exists());
    assert!(!h.item_dir("c").exists());
}

#[tokio::test]
async fn test_cached_inputs_are_processed_and_evicted() {
    let h = Harness::new(PostBehavior::Succeed);
    let slide = h.input("a.svs");
    let cache = h.dir.path().join("cache");

    let mut config = h.config(slide.display().to_string());
    config.input.cache_dir = Some(cache.clone());
    config.input.evict_cache = true;
    h.run(config).await.unwrap();

    let seen = h.inference.seen_paths.lock().unwrap().clone();
    assert_eq!(seen, vec![std::path::absolute(&cache).unwrap().join("a.svs")]);
    assert!(!cache.join("a.svs").exists());
    assert!(slide.exists());
    assert!(h.item_dir("a").join("pinst_pp.zarr").exists());
}
