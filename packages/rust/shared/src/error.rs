//! Error types for curator.
//!
//! Library crates use [`CuratorError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all curator operations.
#[derive(Debug, thiserror::Error)]
pub enum CuratorError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Rule catalogue loading, merging, or pattern compilation error.
    #[error("catalogue error: {0}")]
    Catalogue(String),

    /// Pattern discovery or validation error.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Pattern-normalization bridge error (subprocess, protocol, or parsing).
    #[error("normalizer error: {0}")]
    Normalizer(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Pipeline driver error (stage execution, resume, gating).
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CuratorError>;

impl CuratorError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
