//! Run configuration for the HoVer-NeXt pipeline.
//!
//! The configuration is immutable once the run starts. It can be loaded from a YAML or JSON
//! file and overridden from the command line.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Input configuration
    pub input: InputConfig,

    /// Output configuration
    pub output: OutputConfig,

    /// Model ensemble configuration
    pub model: ModelConfig,

    /// Inference stage options
    pub inference: InferenceConfig,

    /// Post-processing stage options
    pub post_process: PostProcessConfig,

    /// Run-level behaviour
    pub execution: ExecutionConfig,

    /// Worker commands implementing the stages
    pub backend: BackendConfig,
}

/// Input configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Path, glob pattern, or `.txt` list file with one path per line
    pub spec: String,

    /// Directory where inputs are copied before processing
    pub cache_dir: Option<PathBuf>,

    /// Delete the cached copy once the item is finished
    pub evict_cache: bool,

    /// Region for `s3://` inputs (falls back to the environment)
    pub s3_region: Option<String>,

    /// Read `s3://` inputs without credentials
    pub s3_anonymous: bool,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving one sub-directory per item
    pub dir: PathBuf,

    /// Keep the raw instance/class probability stores after post-processing
    pub keep_raw: bool,

    /// Export polygons (GeoJSON) next to the final store
    pub save_polygon: bool,

    /// Zstd compression level for stores written by the pipeline (0-22)
    pub compression_level: i32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            keep_raw: false,
            save_polygon: false,
            compression_level: default_compression_level(),
        }
    }
}

/// Model ensemble configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Checkpoint ids; more than one forms an ensemble
    pub checkpoints: Vec<String>,

    /// Directory containing one sub-directory per checkpoint id
    pub checkpoint_root: PathBuf,

    /// Number of test-time augmentation views (1-8)
    pub tta: usize,

    /// Inference batch size
    pub batch_size: usize,

    /// Apply color augmentation to the test-time views
    pub color_augmentation: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            checkpoints: Vec::new(),
            checkpoint_root: default_checkpoint_root(),
            tta: default_tta(),
            batch_size: default_batch_size(),
            color_augmentation: false,
        }
    }
}

/// Inference stage options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Tile size in pixels (models are trained on 256x256)
    pub tile_size: usize,

    /// Overlap between tiles as a fraction
    pub overlap: f64,

    /// Data loader workers
    pub workers: usize,

    /// Store writer workers
    pub writers: usize,

    /// Stop after the first item's inference stage
    pub only_inference: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            tile_size: default_tile_size(),
            overlap: default_overlap(),
            workers: default_inference_workers(),
            writers: default_inference_writers(),
            only_inference: false,
        }
    }
}

/// Metric the post-processing parameters are tuned for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Mpq,
    #[default]
    F1,
    Pannuke,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Mpq => write!(f, "mpq"),
            Metric::F1 => write!(f, "f1"),
            Metric::Pannuke => write!(f, "pannuke"),
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mpq" => Ok(Metric::Mpq),
            "f1" => Ok(Metric::F1),
            "pannuke" => Ok(Metric::Pannuke),
            other => Err(PipelineError::Configuration(format!(
                "Invalid metric '{}': expected one of 'f1', 'mpq', 'pannuke'",
                other
            ))),
        }
    }
}

/// Post-processing stage options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    /// Metric to optimize post-processing for
    pub metric: Metric,

    /// Tiling factor (increase when running out of memory)
    pub tiling: usize,

    /// Overlap between post-processing tiles in pixels
    pub overlap: usize,

    /// Post-processing workers
    pub workers: usize,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            tiling: default_pp_tiling(),
            overlap: default_pp_overlap(),
            workers: default_pp_workers(),
        }
    }
}

/// What to do when a single item fails inside a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultMode {
    /// The first failing item ends the run
    #[default]
    Abort,
    /// Stage failures are logged and the run moves on to the next item
    Continue,
}

/// Run-level behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-item fault isolation
    pub on_item_error: FaultMode,

    /// Tokio worker threads (null = num CPUs)
    pub worker_threads: Option<usize>,

    /// Optional path to save metrics JSON after the run
    pub metrics_output_path: Option<String>,
}

/// Worker commands implementing the external stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Program and arguments of the inference worker
    pub inference_command: Vec<String>,

    /// Program and arguments of the post-processing worker
    pub post_process_command: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            inference_command: vec!["hover-next-worker".to_string(), "infer".to_string()],
            post_process_command: vec!["hover-next-worker".to_string(), "post-process".to_string()],
        }
    }
}

/// Command-line values that take precedence over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub input: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub checkpoints: Option<String>,
    pub checkpoint_root: Option<PathBuf>,
    pub only_inference: bool,
    pub metric: Option<Metric>,
    pub batch_size: Option<usize>,
    pub tta: Option<usize>,
    pub save_polygon: bool,
    pub tile_size: Option<usize>,
    pub overlap: Option<f64>,
    pub inf_workers: Option<usize>,
    pub inf_writers: Option<usize>,
    pub pp_tiling: Option<usize>,
    pub pp_overlap: Option<usize>,
    pub pp_workers: Option<usize>,
    pub keep_raw: bool,
    pub cache: Option<PathBuf>,
    pub continue_on_error: bool,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::NotFound(path.to_path_buf()),
            _ => PipelineError::io(format!("reading {}", path.display()), e),
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "json" => Self::from_json(&contents),
            // YAML is a superset of JSON
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(PipelineError::config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(PipelineError::config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| PipelineError::Other(e.into()))
    }

    /// Apply command-line overrides. Flags only ever switch options on.
    pub fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(input) = &o.input {
            self.input.spec = input.trim_end().to_string();
        }
        if let Some(dir) = &o.output_dir {
            self.output.dir = dir.clone();
        }
        if let Some(cp) = &o.checkpoints {
            self.model.checkpoints = split_checkpoints(cp);
        }
        if let Some(root) = &o.checkpoint_root {
            self.model.checkpoint_root = root.clone();
        }
        if let Some(metric) = o.metric {
            self.post_process.metric = metric;
        }
        if let Some(v) = o.batch_size {
            self.model.batch_size = v;
        }
        if let Some(v) = o.tta {
            self.model.tta = v;
        }
        if let Some(v) = o.tile_size {
            self.inference.tile_size = v;
        }
        if let Some(v) = o.overlap {
            self.inference.overlap = v;
        }
        if let Some(v) = o.inf_workers {
            self.inference.workers = v;
        }
        if let Some(v) = o.inf_writers {
            self.inference.writers = v;
        }
        if let Some(v) = o.pp_tiling {
            self.post_process.tiling = v;
        }
        if let Some(v) = o.pp_overlap {
            self.post_process.overlap = v;
        }
        if let Some(v) = o.pp_workers {
            self.post_process.workers = v;
        }
        if let Some(cache) = &o.cache {
            self.input.cache_dir = Some(cache.clone());
        }
        self.inference.only_inference |= o.only_inference;
        self.output.save_polygon |= o.save_polygon;
        self.output.keep_raw |= o.keep_raw;
        if o.continue_on_error {
            self.execution.on_item_error = FaultMode::Continue;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| -> Result<()> { Err(PipelineError::Configuration(msg.to_string())) };

        if self.input.spec.trim().is_empty() {
            return fail("Input (--input) is required: a path, glob pattern, or .txt list file");
        }
        if self.output.dir.as_os_str().is_empty() {
            return fail("Output directory (--output_dir) is required");
        }
        if self.model.checkpoints.is_empty() {
            return fail("Checkpoint parameter (--cp) is required. Please specify a model checkpoint.");
        }
        if self.model.checkpoints.iter().any(|c| c.trim().is_empty()) {
            return fail("Checkpoint ids must not be empty");
        }
        if !(1..=8).contains(&self.model.tta) {
            return fail("TTA views must be between 1 and 8");
        }
        if self.model.batch_size == 0 {
            return fail("Batch size must be > 0");
        }
        if self.inference.tile_size == 0 {
            return fail("Tile size must be > 0");
        }
        if !(0.0..1.0).contains(&self.inference.overlap) {
            return fail("Tile overlap must be a fraction in [0, 1)");
        }
        if self.inference.workers == 0 || self.inference.writers == 0 {
            return fail("Inference workers and writers must be > 0");
        }
        if self.post_process.tiling == 0 {
            return fail("Post-processing tiling must be > 0");
        }
        if self.post_process.workers == 0 {
            return fail("Post-processing workers must be > 0");
        }
        if self.output.compression_level < 0 || self.output.compression_level > 22 {
            return fail("Compression level must be 0-22 for zstd");
        }
        if self.backend.inference_command.is_empty() || self.backend.post_process_command.is_empty() {
            return fail("Worker commands for inference and post-processing must not be empty");
        }
        Ok(())
    }
}

/// Split a comma-separated checkpoint list, dropping empty entries.
pub fn split_checkpoints(cp: &str) -> Vec<String> {
    cp.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// Default value functions for serde
fn default_compression_level() -> i32 { 3 }
fn default_checkpoint_root() -> PathBuf { PathBuf::from("checkpoints") }
fn default_tta() -> usize { 4 }
fn default_batch_size() -> usize { 64 }
fn default_tile_size() -> usize { 256 }
fn default_overlap() -> f64 { 0.96875 }
fn default_inference_workers() -> usize { 4 }
fn default_inference_writers() -> usize { 2 }
fn default_pp_tiling() -> usize { 8 }
fn default_pp_overlap() -> usize { 256 }
fn default_pp_workers() -> usize { 16 }
