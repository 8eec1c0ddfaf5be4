//! Error types for the llama-session crate.

use std::fmt;

use llama_engine::EngineError;
use thiserror::Error;

/// Load sub-step that returned a null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    Model,
    Context,
    Sampler,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitStage::Model => "model",
            InitStage::Context => "context",
            InitStage::Sampler => "sampler",
        })
    }
}

/// Failures of the execution lane itself.
#[derive(Error, Debug)]
pub enum LaneError {
    #[error("execution lane is closed")]
    Closed,

    #[error("unit of work panicked on the execution lane")]
    Panicked,

    #[error("failed to spawn execution lane: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Top-level error type for session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("engine initialization failed at stage: {0}")]
    EngineInit(InitStage),

    #[error("model already loaded")]
    AlreadyLoaded,

    #[error("no model loaded")]
    NotLoaded,

    #[error("generation failed: {0}")]
    Generation(#[from] EngineError),

    #[error("a generation is already active")]
    Busy,

    #[error(transparent)]
    Lane(#[from] LaneError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_stage_names_the_failing_step() {
        let err = SessionError::EngineInit(InitStage::Sampler);
        assert_eq!(
            err.to_string(),
            "engine initialization failed at stage: sampler"
        );
    }

    #[test]
    fn engine_errors_convert_to_generation() {
        let err: SessionError = EngineError::Decode("llama_decode() failed".into()).into();
        assert!(matches!(err, SessionError::Generation(_)));
        assert!(err.to_string().contains("llama_decode() failed"));
    }

    #[test]
    fn lane_errors_are_transparent() {
        let err: SessionError = LaneError::Closed.into();
        assert_eq!(err.to_string(), "execution lane is closed");
    }
}
