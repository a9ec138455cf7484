use crate::core::handle::OpenMode;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("File not found: {name} (group: {}, mode: {mode})", .group.as_deref().unwrap_or("*"))]
    NotFound {
        name: String,
        group: Option<String>,
        mode: OpenMode,
    },

    #[error(
        "File excluded by trust policy: {name} (group: {}, mode: {mode}, rejected sources: {})",
        .group.as_deref().unwrap_or("*"),
        .sources.join(", ")
    )]
    PolicyExcluded {
        name: String,
        group: Option<String>,
        mode: OpenMode,
        sources: Vec<String>,
    },

    #[error("Permission denied: {}", .path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed archive {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("Content hash mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid trusted key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        FsError::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for `NotFound` and `PolicyExcluded`, i.e. "no usable candidate".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FsError::NotFound { .. } | FsError::PolicyExcluded { .. }
        )
    }

    /// Underlying OS error code, when the failure came from the OS layer.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            FsError::Io(e) | FsError::PermissionDenied { source: e, .. } => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Io(e) => e,
            FsError::NotFound { .. } => std::io::Error::new(std::io::ErrorKind::NotFound, err),
            FsError::PermissionDenied { .. } | FsError::PolicyExcluded { .. } => {
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, err)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
