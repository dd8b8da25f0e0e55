//! Error taxonomy for the thumbnail subsystem.
//!
//! Decode failures are plain values: the pipeline turns every one of them into
//! a placeholder, so nothing here ever reaches the consumer as a panic.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why a decode attempt produced no bitmap.
///
/// `Clone` because a single generation result is fanned out to every waiter
/// attached to the same cache key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("decode of {path:?} did not finish within {after:?}")]
    Timeout { path: PathBuf, after: Duration },

    #[error("{path:?} could not be decoded: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("{path:?} has an unsupported format: {detail}")]
    Unsupported { path: PathBuf, detail: String },

    #[error("source image {path:?} does not exist")]
    NotFound { path: PathBuf },

    #[error("invalid decode request: {0}")]
    InvalidRequest(String),
}

/// Copyable discriminant of [`DecodeError`], used in events and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    Timeout,
    Corrupt,
    Unsupported,
    NotFound,
    InvalidRequest,
}

impl DecodeError {
    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            DecodeError::Timeout { .. } => DecodeErrorKind::Timeout,
            DecodeError::Corrupt { .. } => DecodeErrorKind::Corrupt,
            DecodeError::Unsupported { .. } => DecodeErrorKind::Unsupported,
            DecodeError::NotFound { .. } => DecodeErrorKind::NotFound,
            DecodeError::InvalidRequest(_) => DecodeErrorKind::InvalidRequest,
        }
    }

    /// Stable reason code, suitable for logs and persisted diagnostics.
    pub fn reason(&self) -> &'static str {
        self.kind().reason()
    }

    /// Build the error for an `image` crate failure on `path`.
    pub fn from_image(path: &std::path::Path, err: &image::ImageError) -> Self {
        use image::ImageError;

        match err {
            ImageError::Unsupported(e) => DecodeError::Unsupported {
                path: path.to_path_buf(),
                detail: e.to_string(),
            },
            ImageError::IoError(e) if e.kind() == std::io::ErrorKind::NotFound => {
                DecodeError::NotFound {
                    path: path.to_path_buf(),
                }
            }
            other => DecodeError::Corrupt {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }
    }

    pub fn from_io(path: &std::path::Path, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            DecodeError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            DecodeError::Corrupt {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }
        }
    }
}

impl DecodeErrorKind {
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeErrorKind::Timeout => "timeout",
            DecodeErrorKind::Corrupt => "corrupt",
            DecodeErrorKind::Unsupported => "unsupported",
            DecodeErrorKind::NotFound => "not_found",
            DecodeErrorKind::InvalidRequest => "invalid",
        }
    }
}

/// Failure talking to the persistent thumbnail store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("thumbnail encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Error returned by the blocking service entry points.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ThumbnailError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("thumbnail store error: {0}")]
    Store(String),

    #[error("thumbnail service is shutting down")]
    Stopped,
}

impl From<StoreError> for ThumbnailError {
    fn from(err: StoreError) -> Self {
        ThumbnailError::Store(err.to_string())
    }
}
