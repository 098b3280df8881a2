//! Error taxonomy for the analysis pipeline.
//!
//! Stages decide how to react to a failure by its kind: provider failures in
//! per-unit stages (labeling, consolidation) become fallback values, every
//! other failure aborts the running stage and therefore the job attempt.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Embedding or generation call failed (network, rate limit, malformed output).
    #[error("provider error: {0}")]
    Provider(String),

    /// Reading from or writing to the database failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Malformed job input or request body.
    #[error("validation error: {0}")]
    Validation(String),

    /// A lookup by id found nothing. Reported with the validation kind.
    #[error("validation error: {0}")]
    NotFound(String),

    /// The job claim was lost or went stale while a worker held it.
    #[error("concurrency error: {0}")]
    Concurrency(String),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

impl AnalysisError {
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn concurrency(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provider(_) => "provider",
            Self::Persistence(_) => "persistence",
            Self::Validation(_) | Self::NotFound(_) => "validation",
            Self::Concurrency(_) => "concurrency",
        }
    }

    /// Whether a per-unit stage must abort instead of substituting a fallback.
    pub fn is_fatal_to_stage(&self) -> bool {
        !matches!(self, Self::Provider(_))
    }
}

impl From<rusqlite::Error> for AnalysisError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<r2d2::Error> for AnalysisError {
    fn from(e: r2d2::Error) -> Self {
        Self::Persistence(format!("Failed to get connection from pool: {}", e))
    }
}

impl From<bincode::Error> for AnalysisError {
    fn from(e: bincode::Error) -> Self {
        Self::Persistence(format!("Embedding codec error: {}", e))
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(e: reqwest::Error) -> Self {
        Self::Provider(e.to_string())
    }
}
