//! Configuration management.
//!
//! Corral configuration is loaded from multiple sources with the following
//! priority:
//!
//! 1. Environment variables (CORRAL_*)
//! 2. User configuration file (~/.config/corral/config.toml)
//! 3. System configuration file (/etc/corral/config.toml)
//! 4. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! [daemon]
//! socket_path = "/run/corrald.sock"
//! data_dir = "/var/lib/corral"
//!
//! [container]
//! subsystems = ["memory", "freezer", "cpu", "cpuacct"]
//! grace_period_ms = 5000
//!
//! [network]
//! enabled = true
//! links = ["eth0"]
//!
//! [volumes]
//! pool_dir = "/var/lib/corral/volumes"
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Corral daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Daemon process settings.
    pub daemon: DaemonConfig,
    /// Container lifecycle settings.
    pub container: ContainerConfig,
    /// Traffic shaping settings.
    pub network: NetworkConfig,
    /// Volume pool settings.
    pub volumes: VolumeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            container: ContainerConfig::default(),
            network: NetworkConfig::default(),
            volumes: VolumeConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from files and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if any source fails to parse.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("/etc/corral/config.toml"))
            .merge(Toml::file(user_config_path()))
            .merge(Env::prefixed("CORRAL_").split("_"))
            .extract()
    }

    /// Loads configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("CORRAL_").split("_"))
            .extract()
    }

    /// Directory holding the persisted container nodes.
    pub fn state_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("state")
    }
}

/// Daemon process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path of the client socket.
    pub socket_path: PathBuf,
    /// Data directory.
    pub data_dir: PathBuf,
    /// PID file path.
    pub pid_file: PathBuf,
    /// Reconciliation tick interval in milliseconds.
    pub reconcile_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/corrald.sock"),
            data_dir: PathBuf::from("/var/lib/corral"),
            pid_file: PathBuf::from("/run/corrald.pid"),
            reconcile_interval_ms: 1000,
        }
    }
}

/// Container lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Cgroup subsystems projected for every container.
    pub subsystems: Vec<String>,
    /// Mount root of the cgroup-v1 hierarchies.
    pub cgroup_root: PathBuf,
    /// Name of the daemon-owned cgroup subtree.
    pub cgroup_prefix: String,
    /// Graceful stop window before the kill escalation, in milliseconds.
    pub grace_period_ms: u64,
    /// Freezer state poll interval in milliseconds.
    pub freezer_wait_interval_ms: u64,
    /// Freezer state wait bound in milliseconds.
    pub freezer_wait_timeout_ms: u64,
    /// Attempts made to empty a cgroup before its directory is removed.
    pub remove_kill_attempts: u32,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            subsystems: vec![
                "memory".to_owned(),
                "freezer".to_owned(),
                "cpu".to_owned(),
                "cpuacct".to_owned(),
            ],
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_prefix: "corral".to_owned(),
            grace_period_ms: 5000,
            freezer_wait_interval_ms: 100,
            freezer_wait_timeout_ms: 60_000,
            remove_kill_attempts: 50,
        }
    }
}

/// Traffic shaping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Master switch; when false every traffic-control operation is a no-op.
    pub enabled: bool,
    /// Links carrying the HTB hierarchy. Empty means every physical link
    /// resolution is left to the adapter.
    pub links: Vec<String>,
    /// Major number of the root qdisc handle.
    pub root_handle_major: u16,
    /// Minor number of the default class.
    pub default_class_minor: u16,
    /// Default class priority.
    pub default_prio: u32,
    /// Default guaranteed rate in bytes per second.
    pub default_rate: u32,
    /// Default ceiling rate in bytes per second.
    pub default_ceil: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            links: Vec::new(),
            root_handle_major: 1,
            default_class_minor: 2,
            default_prio: 3,
            default_rate: 125_000,
            default_ceil: 0,
        }
    }
}

/// Volume pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Directory under which volume backing storage is provisioned.
    pub pool_dir: PathBuf,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            pool_dir: PathBuf::from("/var/lib/corral/volumes"),
        }
    }
}

fn user_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .map_or_else(
            || PathBuf::from("/etc/corral/config.toml"),
            |home| home.join(".config/corral/config.toml"),
        )
}
