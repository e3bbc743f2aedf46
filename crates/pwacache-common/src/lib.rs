//! # pwacache Common
//!
//! Shared error types, logging configuration, and retry helpers for the
//! pwacache crates.
//!
//! ## Features
//!
//! - Unified storage error type
//! - Logging configuration and setup
//! - Retry and timeout utilities used by the lifecycle host
//! - Result extension traits

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for cache storage and host plumbing.
#[derive(Error, Debug)]
pub enum PwaError {
    /// Cache storage backend errors.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Persisted data could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl PwaError {
    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PwaError::Storage { .. } | PwaError::Timeout(_))
    }
}

/// Result type alias for pwacache operations.
pub type Result<T> = std::result::Result<T, PwaError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Wrap any error as a storage error carrying `message` as context.
    fn storage_context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn storage_context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| PwaError::storage_with_source(message, e))
    }
}
