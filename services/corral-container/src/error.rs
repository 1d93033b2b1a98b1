//! Error types for the container engine.
//!
//! Every error maps onto the closed wire enumeration via [`Error::code`];
//! the message travels with it so clients always see both.

use corral_protocol::ErrorCode;
use thiserror::Error;

/// Result type alias for container operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the container model and lifecycle engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Unanticipated fault.
    #[error("{0}")]
    Unknown(String),

    /// Request named no valid method.
    #[error("invalid RPC method: {0}")]
    InvalidMethod(String),

    /// A value failed parsing or validation.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The operation is not legal in the container's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No container with the given name.
    #[error("container does not exist: {0}")]
    ContainerDoesNotExist(String),

    /// A container with the given name already exists.
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// Caller credential does not own the target.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Unknown property or data name.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target is held by dependent state (live children).
    #[error("busy: {0}")]
    Busy(String),

    /// Persistent storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Persisted state failed to decode.
    #[error("corrupted state: {0}")]
    Corrupted(String),

    /// The freezer did not confirm a transition within its bound.
    #[error("freezer timeout: {0}")]
    FreezerTimeout(String),

    /// No volume with the given name.
    #[error("volume does not exist: {0}")]
    VolumeDoesNotExist(String),
}

impl Error {
    /// The wire code this error maps to.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unknown(_) => ErrorCode::Unknown,
            Self::InvalidMethod(_) => ErrorCode::InvalidMethod,
            Self::InvalidValue(_) => ErrorCode::InvalidValue,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::ContainerDoesNotExist(_) => ErrorCode::ContainerDoesNotExist,
            Self::ContainerAlreadyExists(_) => ErrorCode::ContainerAlreadyExists,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Busy(_) => ErrorCode::Busy,
            Self::Storage(_) => ErrorCode::Storage,
            Self::Corrupted(_) => ErrorCode::Corrupted,
            Self::FreezerTimeout(_) => ErrorCode::FreezerTimeout,
            Self::VolumeDoesNotExist(_) => ErrorCode::VolumeDoesNotExist,
        }
    }
}

impl From<corral_kv::KvError> for Error {
    fn from(err: corral_kv::KvError) -> Self {
        match err {
            corral_kv::KvError::Corrupted(msg) => Self::Corrupted(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<corral_cgroup::CgroupError> for Error {
    fn from(err: corral_cgroup::CgroupError) -> Self {
        match err {
            corral_cgroup::CgroupError::FreezerTimeout { state } => {
                Self::FreezerTimeout(format!("can't wait for freezer state {state}"))
            }
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<corral_net::NetError> for Error {
    fn from(err: corral_net::NetError) -> Self {
        Self::Unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_maps_to_its_wire_code() {
        assert_eq!(Error::Busy("x".into()).code(), ErrorCode::Busy);
        assert_eq!(
            Error::FreezerTimeout("x".into()).code(),
            ErrorCode::FreezerTimeout
        );
        assert_eq!(
            Error::VolumeDoesNotExist("x".into()).code(),
            ErrorCode::VolumeDoesNotExist
        );
    }

    #[test]
    fn kv_errors_split_into_storage_and_corrupted() {
        let io = corral_kv::KvError::Storage(std::io::Error::other("disk gone"));
        assert_eq!(Error::from(io).code(), ErrorCode::Storage);

        let bad = corral_kv::KvError::Corrupted("node a".into());
        assert_eq!(Error::from(bad).code(), ErrorCode::Corrupted);
    }

    #[test]
    fn freezer_timeout_survives_the_cgroup_boundary() {
        let err = corral_cgroup::CgroupError::FreezerTimeout {
            state: "FROZEN".into(),
        };
        assert_eq!(Error::from(err).code(), ErrorCode::FreezerTimeout);
    }
}
