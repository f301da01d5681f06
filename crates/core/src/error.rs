//! Error taxonomy shared by the tracker, the archive codec and the wire protocol

use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::status;

/// Result alias for confsync-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the change-detection and archive engine.
///
/// Nothing in this crate retries: each error is reported once and the caller
/// decides what to do with it.
#[derive(Debug, Error)]
pub enum Error {
    /// Filesystem access failed
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory traversal failed
    #[error("failed to walk {}: {source}", root.display())]
    Walk {
        root: PathBuf,
        #[source]
        source: ignore::Error,
    },

    /// Archive stream could not be parsed or ended mid-entry
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    /// Product id has no configured subtree
    #[error("unknown product: {0}")]
    UnknownProduct(String),

    /// Path cannot be expressed as a portable relative path
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// Scan interval outside the supported range
    #[error("invalid scan interval {0}s, must be between 1 and 120")]
    InvalidInterval(u64),

    /// Malformed wire frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reading or writing a frame on a connection failed
    #[error("stream error: {0}")]
    Stream(#[source] std::io::Error),

    /// Configuration file could not be loaded
    #[error("config error in {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },
}

impl Error {
    /// Build an [`Error::Io`] for `path`
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// Build an [`Error::InvalidPath`]
    pub fn invalid_path(path: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason,
        }
    }

    /// Whether this error belongs to the filesystem (`IOError`) family
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Walk { .. })
    }

    /// Wire status code reported to a remote caller
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Io { .. } | Self::Walk { .. } | Self::Config { .. } | Self::Stream(_) => {
                status::IO_ERROR
            }
            Self::UnknownProduct(_) => status::UNKNOWN_PRODUCT,
            Self::CorruptArchive(_) => status::CORRUPT_ARCHIVE,
            Self::InvalidPath { .. } => status::INVALID_PATH,
            Self::InvalidInterval(_) | Self::Protocol(_) => status::BAD_REQUEST,
        }
    }
}
