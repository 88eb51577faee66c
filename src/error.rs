//! Error types for adapter loading and metadata access

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading an adapter or reading its metadata
#[derive(Debug, Error)]
pub enum LoraError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid safetensors container {}: {reason}", .path.display())]
    InvalidContainer { path: PathBuf, reason: String },

    #[error("failed to write {}: {reason}", .path.display())]
    Write { path: PathBuf, reason: String },

    #[error("tensor {name} has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("metadata {key} must be a {expected}, got {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("malformed metadata {key}: {reason}")]
    MalformedMetadata { key: String, reason: String },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Coarse classification of a [`LoraError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// File missing, unreadable, or not a usable container
    Io,
    /// A metadata field holds a value of the wrong type
    TypeMismatch,
    /// A metadata field is structurally broken
    MalformedMetadata,
    /// Tensor conversion failed
    Tensor,
}

impl LoraError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. }
            | Self::InvalidContainer { .. }
            | Self::Write { .. }
            | Self::UnsupportedDtype { .. } => ErrorKind::Io,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::MalformedMetadata { .. } => ErrorKind::MalformedMetadata,
            Self::Tensor(_) => ErrorKind::Tensor,
        }
    }

    pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidContainer {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(key: &str, reason: impl Into<String>) -> Self {
        Self::MalformedMetadata {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = LoraError> = std::result::Result<T, E>;
