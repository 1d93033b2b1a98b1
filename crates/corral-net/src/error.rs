//! Error types for the traffic-control adapter.

use thiserror::Error;

/// Result type alias for traffic-control operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors that can occur during traffic-control operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// Netlink protocol failure.
    #[error("netlink error: {0}")]
    Netlink(String),

    /// A configured link does not exist.
    #[error("link not found: {0}")]
    LinkNotFound(String),

    /// Network support is globally disabled; only raised by operations with
    /// no meaningful no-op (counter reads).
    #[error("network support is disabled")]
    Disabled,
}
