use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for jail operations.
pub type JailResult<T> = Result<T, JailError>;

#[derive(Error, Debug)]
pub enum JailError {
    /// The path resolves outside the jail root. Never folded into `Io`.
    #[error("path {} resolves outside of the jail root", .path.display())]
    PathEscape { path: PathBuf },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("{op}: {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("chown: {}: {source}", .path.display())]
    Ownership {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl JailError {
    pub(crate) fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        JailError::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn escape(path: impl AsRef<Path>) -> Self {
        JailError::PathEscape {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Whether this error means the path left the jail.
    pub fn is_path_escape(&self) -> bool {
        matches!(self, JailError::PathEscape { .. })
    }
}
