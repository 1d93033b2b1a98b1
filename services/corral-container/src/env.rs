//! Shared collaborators of the container engine.
//!
//! The property and data registries, the subsystem adapters, the store,
//! the launcher and the shaping context are bundled here and passed into
//! the holder at construction, so there is no hidden initialisation
//! order and no process-wide registration.

use std::sync::{Arc, Mutex, MutexGuard};

use corral_cgroup::{FreezerWait, SubsystemRegistry};
use corral_config::Config;
use corral_kv::KvStore;
use corral_net::{tc_handle, CgroupFilter, NetContext, Qdisc, TcClass};
use tracing::warn;

use crate::data::{register_data, DataSet};
use crate::error::{Error, Result};
use crate::launcher::PayloadLauncher;
use crate::property::{register_properties, PropertySet};

/// Shared, mostly-immutable state of the engine. The only interior
/// mutability is the netlink context, which carries a socket sequence
/// counter.
pub struct Env {
    pub config: Config,
    pub properties: PropertySet,
    pub data: DataSet,
    pub subsystems: SubsystemRegistry,
    pub kv: Arc<KvStore>,
    pub launcher: Box<dyn PayloadLauncher>,
    net: Mutex<NetContext>,
    qdisc: Arc<Qdisc>,
}

impl Env {
    /// Builds the engine environment from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store cannot be opened or a configured
    /// link does not resolve.
    pub fn new(config: Config, launcher: Box<dyn PayloadLauncher>) -> Result<Arc<Self>> {
        let kv = Arc::new(KvStore::open(config.state_dir())?);

        let mut subsystem_names = config.container.subsystems.clone();
        if config.network.enabled && !subsystem_names.iter().any(|s| s == "net_cls") {
            // The cgroup filter keys on net_cls.classid, so the subsystem
            // rides along whenever shaping is on.
            subsystem_names.push("net_cls".to_owned());
        }
        let subsystems = SubsystemRegistry::new(&config.container.cgroup_root, &subsystem_names);

        let net = if config.network.enabled {
            if config.network.links.is_empty() {
                warn!("network support enabled with no links; disabling shaping");
                NetContext::disabled()
            } else {
                NetContext::new(&config.network.links)?
            }
        } else {
            NetContext::disabled()
        };

        let qdisc = Arc::new(Qdisc::new(
            config.network.root_handle_major,
            config.network.default_class_minor,
        ));

        Ok(Arc::new(Self {
            config,
            properties: register_properties(),
            data: register_data(),
            subsystems,
            kv,
            launcher,
            net: Mutex::new(net),
            qdisc,
        }))
    }

    /// Whether traffic shaping is active.
    #[must_use]
    pub fn net_enabled(&self) -> bool {
        self.net.lock().map(|net| net.enabled()).unwrap_or(false)
    }

    /// Locks the netlink context.
    pub fn lock_net(&self) -> Result<MutexGuard<'_, NetContext>> {
        self.net
            .lock()
            .map_err(|_| Error::Unknown("net lock poisoned".to_owned()))
    }

    /// The root qdisc descriptor.
    #[must_use]
    pub fn qdisc(&self) -> Arc<Qdisc> {
        Arc::clone(&self.qdisc)
    }

    /// Freezer wait parameters from configuration.
    #[must_use]
    pub fn freezer_wait(&self) -> FreezerWait {
        FreezerWait {
            interval: std::time::Duration::from_millis(self.config.container.freezer_wait_interval_ms),
            timeout: std::time::Duration::from_millis(self.config.container.freezer_wait_timeout_ms),
        }
    }

    /// Kill-retry parameters for cgroup removal.
    #[must_use]
    pub fn remove_retry(&self) -> (u32, std::time::Duration) {
        (
            self.config.container.remove_kill_attempts,
            std::time::Duration::from_millis(self.config.container.freezer_wait_interval_ms),
        )
    }

    /// Cgroup path of a container, relative to each subsystem mount.
    #[must_use]
    pub fn cgroup_rel(&self, name: &str) -> String {
        format!("{}/{}", self.config.container.cgroup_prefix, name)
    }

    /// Handle (and `net_cls` classid) of a container's HTB class.
    #[must_use]
    pub fn class_handle(&self, minor: u16) -> u32 {
        tc_handle(self.config.network.root_handle_major, minor)
    }

    /// Installs the root traffic-control projection: the HTB qdisc, its
    /// default class and the cgroup filter, on every link. Any previous
    /// qdisc generation is torn down first.
    pub fn setup_network(&self) -> Result<()> {
        let mut net = self.lock_net()?;
        if !net.enabled() {
            return Ok(());
        }

        if let Err(e) = self.qdisc.remove(&mut net) {
            warn!(error = %e, "removing stale qdisc generation");
        }
        self.qdisc.create(&mut net)?;

        let default_class = TcClass::under_qdisc(
            Arc::clone(&self.qdisc),
            tc_handle(
                self.config.network.root_handle_major,
                self.config.network.default_class_minor,
            ),
        );
        default_class.create(
            &mut net,
            self.config.network.default_prio,
            self.config.network.default_rate,
            self.config.network.default_ceil,
        )?;

        CgroupFilter::new(Arc::clone(&self.qdisc)).create(&mut net)?;
        Ok(())
    }

    /// Removes the root traffic-control projection.
    pub fn teardown_network(&self) -> Result<()> {
        let mut net = self.lock_net()?;
        self.qdisc.remove(&mut net)?;
        Ok(())
    }
}
