//! Container lifecycle states and owner credentials.

use std::fmt;

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerState {
    /// No payload, no kernel projection.
    Stopped,
    /// Payload alive under its cgroup projection.
    Running,
    /// Frozen via the freezer subsystem; was Running immediately before.
    Paused,
    /// Payload exited but the container has not been reaped.
    Dead,
    /// Projection without a payload (empty command).
    Meta,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Dead => write!(f, "dead"),
            Self::Meta => write!(f, "meta"),
        }
    }
}

impl ContainerState {
    /// Whether a kernel projection (cgroups, tc class) exists in this state.
    #[must_use]
    pub fn has_projection(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// A kernel-reported peer credential, also used as container ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
}

impl Default for Cred {
    fn default() -> Self {
        Self::root()
    }
}

impl Cred {
    /// Builds a credential.
    #[must_use]
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// The superuser credential.
    #[must_use]
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }

    /// Whether this credential bypasses ownership checks.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        self.uid == 0
    }
}
