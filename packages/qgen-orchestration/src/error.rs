use crate::job::StageId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("stage {stage} could not be launched: {source}")]
    StageLaunch {
        stage: StageId,
        #[source]
        source: std::io::Error,
    },

    #[error("stage {stage} failed (exit_code={exit_code})")]
    StageFailed { stage: StageId, exit_code: i32 },

    #[error("stage {stage} failed after no-arg fallback retry")]
    FallbackExhausted {
        stage: StageId,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("stage {stage} timed out after {timeout_secs}s")]
    StageTimeout { stage: StageId, timeout_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn not_found<S: std::fmt::Display>(what: S) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn validation<S: std::fmt::Display>(msg: S) -> Self {
        Self::Validation(msg.to_string())
    }
}
