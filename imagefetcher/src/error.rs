//! Error types.
//!
//! Fetch errors are `Clone` because one failure fans out to every observer
//! attached to the operation.

use thiserror::Error;

/// Errors delivered to fetch callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// The operation was aborted before producing a result.
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

/// Failures downloading bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// The bytes could not be turned into a bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DecodeError {
    message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors constructing a controller.
#[derive(Debug, Error)]
pub enum FetcherError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no Tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
