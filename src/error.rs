//! Error taxonomy and process exit codes.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a run that processed every item.
pub const EXIT_SUCCESS: u8 = 0;

/// Exit code for configuration and unexpected errors.
pub const EXIT_FAILURE: u8 = 1;

/// Exit code after an intentional inference-only early exit.
pub const EXIT_INFERENCE_ONLY: u8 = 2;

/// Exit code after a user interrupt.
pub const EXIT_INTERRUPTED: u8 = 130;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline stage that raised a [`PipelineError::Stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Inference,
    PostProcess,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::Inference => write!(f, "inference"),
            StageKind::PostProcess => write!(f, "post-processing"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} failed for {item}: {error:#}")]
    Stage {
        stage: StageKind,
        item: String,
        error: anyhow::Error,
    },

    #[error("Interrupted by user")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Configuration(e.to_string())
    }

    pub fn model_load<E: std::fmt::Display>(e: E) -> Self {
        Self::ModelLoad(e.to_string())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap a stage failure, keeping any `PipelineError` the stage raised itself.
    pub fn stage(stage: StageKind, item: impl Into<String>, error: anyhow::Error) -> Self {
        match error.downcast::<PipelineError>() {
            Ok(inner) => inner,
            Err(error) => Self::Stage {
                stage,
                item: item.into(),
                error,
            },
        }
    }

    /// Whether the error must end the run even when per-item fault isolation is enabled.
    pub fn is_process_fatal(&self) -> bool {
        !matches!(self, PipelineError::Stage { .. })
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Interrupted => EXIT_INTERRUPTED,
            _ => EXIT_FAILURE,
        }
    }

    /// Guidance printed after the error message.
    pub fn hint(&self) -> &'static str {
        match self {
            PipelineError::NotFound(_) => {
                "Please check that your input files exist and paths are correct."
            }
            PipelineError::Configuration(_) => "Please check your input parameters and try again.",
            PipelineError::ModelLoad(_) => {
                "Please check the checkpoint ids (--cp) and the checkpoint directory."
            }
            PipelineError::Interrupted => "Pipeline interrupted by user.",
            PipelineError::Io { .. } => {
                "Please check free disk space and permissions of the cache and output directories."
            }
            PipelineError::Stage { .. } | PipelineError::Other(_) => {
                "If this error persists, please report it as an issue."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(PipelineError::config("bad").exit_code(), EXIT_FAILURE);
        assert_eq!(PipelineError::NotFound("x.txt".into()).exit_code(), EXIT_FAILURE);
        assert_eq!(PipelineError::model_load("bad").exit_code(), EXIT_FAILURE);
        assert_eq!(PipelineError::Interrupted.exit_code(), EXIT_INTERRUPTED);
        assert_eq!(
            PipelineError::Other(anyhow::anyhow!("boom")).exit_code(),
            EXIT_FAILURE
        );
    }

    #[test]
    fn test_stage_keeps_inner_pipeline_error() {
        let inner = anyhow::Error::from(PipelineError::Interrupted);
        let err = PipelineError::stage(StageKind::Inference, "a.svs", inner);
        assert!(matches!(err, PipelineError::Interrupted));

        let err = PipelineError::stage(StageKind::PostProcess, "a.svs", anyhow::anyhow!("worker died"));
        assert!(matches!(err, PipelineError::Stage { stage: StageKind::PostProcess, .. }));
        assert!(!err.is_process_fatal());
        let display = err.to_string();
        assert!(display.contains("post-processing"));
        assert!(display.contains("a.svs"));
        assert!(display.contains("worker died"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::config("x").is_process_fatal());
        assert!(PipelineError::Interrupted.is_process_fatal());
        assert!(PipelineError::io("copying", std::io::Error::other("disk full")).is_process_fatal());
    }
}
