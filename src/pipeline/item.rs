//! Per-item context and its state machine.

use crate::error::{PipelineError, Result};
use crate::input::{extension_of, ItemMode, ItemSource};
use crate::io::{CLASS_STORE_SUFFIX, FINAL_STORE_NAME, INSTANCE_STORE_SUFFIX};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of the model output stores inside an item's output directory.
const MODEL_OUTPUT_STEM: &str = "pred";

/// Where an item is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Resolved,
    Classified,
    Cached,
    Inferred,
    SkippedPostProcess,
    PostProcessed,
    Cleaned,
}

impl ItemState {
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        match (self, next) {
            (Cleaned, _) => false,
            (_, Cleaned) => true,
            (Resolved, Classified)
            | (Classified, Cached)
            | (Cached, Inferred)
            | (Inferred, SkippedPostProcess)
            | (Inferred, PostProcessed) => true,
            _ => false,
        }
    }
}

/// Image geometry reported by the inference stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemGeometry {
    pub width: u64,
    pub height: u64,
    /// Microns per pixel of the level that was processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpp: Option<f64>,
}

/// One input moving through the pipeline.
///
/// Created for a single iteration of the driver loop; the run configuration is never modified
/// per item, everything item-specific lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Position in the resolved input order
    pub index: usize,
    /// Path or URI as resolved
    pub source: String,
    /// Path the stages read from (the cached copy when caching is enabled)
    pub input_path: PathBuf,
    pub extension: String,
    pub mode: ItemMode,
    /// `<output_dir>/<file stem>`
    pub output_dir: PathBuf,
    /// Path prefix of the raw model output stores
    pub model_out_prefix: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<ItemGeometry>,
    pub state: ItemState,
}

/// Name of the per-item output directory for a source: its file stem.
pub fn output_name(source: &ItemSource) -> Option<String> {
    source
        .file_name()
        .map(Path::new)
        .and_then(|n| n.file_stem())
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl WorkItem {
    pub fn new(index: usize, source: &ItemSource, output_root: &Path) -> Result<Self> {
        let name = output_name(source).ok_or_else(|| {
            PipelineError::Configuration(format!("Cannot derive an output name from {}", source))
        })?;
        let output_dir = output_root.join(&name);
        let model_out_prefix = output_dir.join(MODEL_OUTPUT_STEM);

        Ok(Self {
            index,
            source: source.to_string(),
            input_path: source.as_path().to_path_buf(),
            extension: String::new(),
            mode: ItemMode::WholeSlide,
            output_dir,
            model_out_prefix,
            geometry: None,
            state: ItemState::Resolved,
        })
    }

    /// Short name for logs.
    pub fn name(&self) -> String {
        self.output_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.clone())
    }

    /// Move to `next`, rejecting transitions the pipeline never makes.
    pub fn advance(&mut self, next: ItemState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "Illegal state transition for {}: {:?} -> {:?}",
                self.name(),
                self.state,
                next
            )));
        }
        tracing::trace!("{}: {:?} -> {:?}", self.name(), self.state, next);
        self.state = next;
        Ok(())
    }

    /// Assign extension and mode from the source path.
    pub fn classify(&mut self) -> Result<()> {
        self.extension = extension_of(Path::new(&self.source));
        self.mode = ItemMode::classify(Path::new(&self.source));
        self.advance(ItemState::Classified)
    }

    /// Record the path the stages should read from.
    pub fn set_effective_path(&mut self, path: PathBuf) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "Empty effective path for {}",
                self.source
            )));
        }
        self.input_path = path;
        self.advance(ItemState::Cached)
    }

    pub fn instance_store_path(&self) -> PathBuf {
        with_suffix(&self.model_out_prefix, INSTANCE_STORE_SUFFIX)
    }

    pub fn class_store_path(&self) -> PathBuf {
        with_suffix(&self.model_out_prefix, CLASS_STORE_SUFFIX)
    }

    /// Final instance segmentation store; its presence marks the item as done.
    pub fn final_store_path(&self) -> PathBuf {
        self.output_dir.join(FINAL_STORE_NAME)
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}
