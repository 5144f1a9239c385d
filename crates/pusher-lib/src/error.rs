//! Error taxonomy for the collection pipeline
//!
//! Every variant is scoped to a single container or a single push: none of
//! them aborts a cycle. The only fatal condition (host memory unknown at
//! startup) is decided by the binary, not here.

use thiserror::Error;

/// Errors raised while collecting, deriving or pushing container metrics
#[derive(Debug, Error)]
pub enum CollectorError {
    /// A snapshot or metadata backend could not be reached or answered garbage
    #[error("{service} unavailable: {reason}")]
    SourceUnavailable {
        service: &'static str,
        reason: String,
    },

    /// Fewer than two samples, so no delta can be taken
    #[error("insufficient history: {samples} sample(s), need at least 2")]
    InsufficientHistory { samples: usize },

    /// The container carries no orchestrator application label
    #[error("missing orchestrator label {label}")]
    MissingOrchestratorLabel { label: String },

    /// Push to the metrics sink failed
    #[error("emit failed: {0}")]
    EmitFailure(String),

    /// A URL or client could not be built from configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CollectorError {
    pub fn cadvisor(reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            service: "cadvisor",
            reason: reason.to_string(),
        }
    }

    pub fn docker(reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            service: "docker",
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;
