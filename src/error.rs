//! Error types for the request-lifecycle core.
//!
//! Collaborators (ingestor, query engine, summarizer) speak `anyhow`; the
//! orchestration layer wraps their failures in [`Error::Collaborator`] so the
//! HTTP boundary and the response stream can tell validation problems,
//! missing threads and backend failures apart.

use thiserror::Error;

/// Result alias using the crate [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid thread key")]
    InvalidThreadKey,

    #[error("Thread '{0}' not found. Please delete and recreate with URL.")]
    ThreadNotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    Collaborator(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the error describes a missing thread rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ThreadNotFound(_))
    }
}
