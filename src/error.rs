//! Engine error taxonomy.
//!
//! Every fallible engine operation returns [`EngineError`]. The variants map
//! directly onto how callers should react:
//!
//! - [`EngineError::Validation`] — caller-fixable input problem, never retried.
//! - [`EngineError::NotFound`] — unknown document id.
//! - [`EngineError::Embedding`] — embedding provider unreachable or rejected
//!   the input; retryable by the caller with backoff.
//! - [`EngineError::Storage`] — persistent collection unavailable; fatal for
//!   the current call.
//! - [`EngineError::Reranker`] — never surfaced by the query path (the engine
//!   degrades to vector ordering); exists for direct re-ranker callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{operation}: validation failed: {message}")]
    Validation {
        operation: &'static str,
        message: String,
    },

    #[error("document not found: {id}")]
    NotFound { id: String },

    #[error("{operation}: embedding provider error: {source}")]
    Embedding {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation}: storage error: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("reranker error: {0}")]
    Reranker(String),
}

impl EngineError {
    pub fn validation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            operation,
            message: message.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn embedding(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Embedding { operation, source }
    }

    pub fn storage(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Storage { operation, source }
    }

    /// True when the caller may retry the same call after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Embedding { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
