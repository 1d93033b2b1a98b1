//! Error types for cgroup operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cgroup operations.
pub type Result<T> = std::result::Result<T, CgroupError>;

/// Errors that can occur while manipulating control groups.
#[derive(Debug, Error)]
pub enum CgroupError {
    /// Filesystem failure against a cgroup path.
    #[error("cgroup i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A knob value did not parse as the expected type.
    #[error("can't parse {knob}: {value:?}")]
    Parse { knob: String, value: String },

    /// The freezer did not reach the requested state within the wait bound.
    #[error("can't wait for freezer state {state}")]
    FreezerTimeout { state: String },

    /// The operation is not defined for this subsystem.
    #[error("operation not supported by subsystem {0}")]
    Unsupported(String),
}

impl CgroupError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
