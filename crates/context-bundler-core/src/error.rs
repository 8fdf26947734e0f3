//! Error taxonomy for bundle building and cache operations.
//!
//! Collaborator traits ([`DocumentSource`](crate::source::DocumentSource),
//! [`BuildCache`](crate::cache::BuildCache)) return `anyhow::Result`; the
//! service layer wraps those failures as [`BundleError::Upstream`] so callers
//! can match on a closed set of variants.

use thiserror::Error;

/// Errors surfaced by the context bundling pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BundleError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("build already in progress for {project}/{document_type}")]
    BuildInProgress {
        project: String,
        document_type: String,
    },

    #[error("document {document_id} needs {tokens} tokens but the budget is {budget}")]
    Overflow {
        document_id: String,
        tokens: usize,
        budget: usize,
    },

    #[error("build timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("upstream error: {message}")]
    Upstream { message: String },
}

impl BundleError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Wraps a collaborator failure, keeping the full context chain.
    pub fn upstream(err: anyhow::Error) -> Self {
        Self::Upstream {
            message: format!("{:#}", err),
        }
    }
}

/// Convenience alias for results using [`BundleError`].
pub type Result<T> = std::result::Result<T, BundleError>;
