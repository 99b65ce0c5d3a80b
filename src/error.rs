//! Error taxonomy for the pipeline
//!
//! One enum, one variant per failure kind the propagation policy
//! distinguishes. Policy denials and rate limits are *decisions*, not errors,
//! and never appear here — they travel inside `PolicyDecision`.
//!
//! Worker loops catch everything at the top of the loop so a poison message
//! or a flaky dependency never kills a fiber; the kinds below decide whether
//! a failure is retried, dropped, or degraded around.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network / HTTP transport failure talking to an external service
    #[error("transport error: {0}")]
    Transport(String),

    /// Outbound call exceeded its per-call deadline
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Malformed JSON payload
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Payload parsed but a required field is missing or of the wrong shape
    #[error("schema error: missing or invalid field `{0}`")]
    Schema(String),

    /// A dependency (registry, metrics store, enhancement endpoint) is down;
    /// callers degrade to fallbacks rather than propagate
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Message bus failure (connect, publish, subscribe)
    #[error("bus error: {0}")]
    Bus(String),

    /// Columnar store failure
    #[error("incident store error: {0}")]
    Store(#[from] clickhouse::error::Error),

    /// Anything else; logged and counted, the component continues
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Short stable tag for counters and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Transport(_) => "transport",
            PipelineError::DeadlineExceeded(_) => "deadline_exceeded",
            PipelineError::Parse(_) => "parse",
            PipelineError::Schema(_) => "schema",
            PipelineError::DependencyUnavailable(_) => "dependency_unavailable",
            PipelineError::Bus(_) => "bus",
            PipelineError::Store(_) => "store",
            PipelineError::Internal(_) => "internal",
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::DeadlineExceeded(err.to_string())
        } else {
            PipelineError::Transport(err.to_string())
        }
    }
}

impl From<async_nats::PublishError> for PipelineError {
    fn from(err: async_nats::PublishError) -> Self {
        PipelineError::Bus(err.to_string())
    }
}

impl From<async_nats::SubscribeError> for PipelineError {
    fn from(err: async_nats::SubscribeError) -> Self {
        PipelineError::Bus(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
