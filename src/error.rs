//! Pipeline error taxonomy.
//!
//! Every variant is handled at the boundary of the component that raises
//! it. The orchestrator only ever counts them.

use thiserror::Error;

use crate::types::SourceKind;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Adapter poll failed or timed out. Logged, empty result.
    #[error("{kind} source unavailable: {reason}")]
    SourceUnavailable { kind: SourceKind, reason: String },

    /// Unparseable external response. Logged, event dropped.
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// Text generation failed or produced disallowed output. Event dropped.
    #[error("generation rejected: {0}")]
    GenerationRejected(String),

    /// The store already holds this key. Counts as success.
    #[error("store already holds {dedup_key}")]
    PublishConflict { dedup_key: String },

    /// Store unreachable or refusing after bounded retries. Data loss.
    #[error("publish of {dedup_key} failed after {attempts} attempt(s): {reason}")]
    PublishFailure {
        dedup_key: String,
        attempts: u32,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn unavailable(kind: SourceKind, reason: impl Into<String>) -> Self {
        PipelineError::SourceUnavailable {
            kind,
            reason: reason.into(),
        }
    }

    /// Short label used as a structured logging field.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable { .. } => "source_unavailable",
            PipelineError::MalformedData(_) => "malformed_data",
            PipelineError::GenerationRejected(_) => "generation_rejected",
            PipelineError::PublishConflict { .. } => "publish_conflict",
            PipelineError::PublishFailure { .. } => "publish_failure",
            PipelineError::Config(_) => "config",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
