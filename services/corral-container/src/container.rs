//! The container: a named supervisory entity with a lifecycle state
//! machine and a projection onto kernel cgroups and traffic control.
//!
//! State machine:
//!
//! ```text
//! (create) -> Stopped -> Running -> Stopped
//!                 |         | \
//!                 |         |  +-> Paused -> Running
//!                 |         +----> Dead ---> Stopped
//!                 +-> Meta (empty command) -> Stopped
//! ```
//!
//! Every resource acquired during start is released on every stop path,
//! including the error unwinds inside start itself.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use corral_cgroup::{Cgroup, SubsystemKind};
use corral_net::TcClass;
use tracing::{info, warn};

use crate::env::Env;
use crate::error::{Error, Result};
use crate::launcher::PayloadSpec;
use crate::property::PropertyHolder;
use crate::state::{ContainerState, Cred};
use crate::value::{
    parse_bool, parse_size, BindMapping, NetSetup, PropertyHook, RlimitSpec,
};

/// Fully-resolved start parameters, computed by the holder so that
/// parent-default inheritance is already applied.
#[derive(Debug, Clone, Default)]
pub struct StartSpec {
    pub command: String,
    pub cred: Cred,
    pub cwd: PathBuf,
    pub root: PathBuf,
    pub hostname: String,
    pub env_vars: Vec<(String, String)>,
    pub rlimits: Vec<RlimitSpec>,
    pub binds: Vec<BindMapping>,
    pub net: NetSetup,
    pub stdin_path: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub memory_limit: u64,
    pub memory_guarantee: u64,
    pub cpu_limit: u64,
    pub cpu_guarantee: u64,
    pub cpu_policy: String,
    pub net_prio: u32,
    pub net_rate: u32,
    pub net_ceil: u32,
}

/// One supervised container.
pub struct Container {
    env: Arc<Env>,
    name: String,
    parent: Option<String>,
    state: ContainerState,
    owner: Cred,
    class_minor: u16,
    prop: PropertyHolder,
    cgroups: HashMap<String, Cgroup>,
    tclass: Option<TcClass>,
    root_pid: Option<i32>,
    exit_status: Option<i32>,
    oom_killed: bool,
    start_errno: i32,
}

impl Container {
    /// Builds a container in `Stopped` with no kernel projection.
    pub(crate) fn new(
        env: Arc<Env>,
        name: impl Into<String>,
        parent: Option<String>,
        owner: Cred,
        class_minor: u16,
    ) -> Self {
        let name = name.into();
        let prop = PropertyHolder::new(Arc::clone(&env.kv), name.clone());
        Self {
            env,
            name,
            parent,
            state: ContainerState::Stopped,
            owner,
            class_minor,
            prop,
            cgroups: HashMap::new(),
            tclass: None,
            root_pid: None,
            exit_status: None,
            oom_killed: false,
            start_errno: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the parent container; `None` means the implicit root.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn owner(&self) -> Cred {
        self.owner
    }

    pub(crate) fn prop(&self) -> &PropertyHolder {
        &self.prop
    }

    pub(crate) fn prop_mut(&mut self) -> &mut PropertyHolder {
        &mut self.prop
    }

    /// The subsystem names of the live cgroup handle set.
    pub fn cgroup_subsystems(&self) -> Vec<String> {
        self.cgroups.keys().cloned().collect()
    }

    /// Compares `cred` against the owning credential; root bypasses.
    pub fn check_permission(&self, cred: Cred) -> Result<()> {
        if cred.is_privileged() || cred.uid == self.owner.uid {
            return Ok(());
        }
        Err(Error::PermissionDenied(format!(
            "container {} is owned by uid {}",
            self.name, self.owner.uid
        )))
    }

    /// Whether this container shares its parent's namespaces
    /// (`isolate=false`).
    pub fn shares_parent_namespace(&self) -> bool {
        match self
            .prop
            .get_raw(&self.env.properties, "isolate")
            .and_then(|raw| parse_bool(&raw))
        {
            Ok(isolate) => !isolate,
            Err(e) => {
                warn!(container = %self.name, error = %e, "can't read isolate property");
                false
            }
        }
    }

    /// Stamps ownership and writes the initial persistence node.
    pub(crate) fn create(&mut self) -> Result<()> {
        self.prop.set_raw(crate::property::OWNER_USER, self.owner.uid.to_string());
        self.prop.set_raw(crate::property::OWNER_GROUP, self.owner.gid.to_string());
        self.prop.create(&self.env.properties)
    }

    /// Validates and stores a property write, then applies its side-effect
    /// hook.
    pub fn set_property(&mut self, name: &str, value: &str, privileged: bool) -> Result<()> {
        let shared = self.parent.is_some() && self.shares_parent_namespace();
        let hook = self.prop.set(
            &self.env.properties,
            self.state,
            privileged,
            shared,
            name,
            value,
        )?;

        if hook == Some(PropertyHook::NetShaping) && self.state.has_projection() {
            if let Err(e) = self.refresh_shaping() {
                warn!(container = %self.name, error = %e, "can't refresh traffic class");
            }
        }
        Ok(())
    }

    /// An unsigned property of this container only (no inheritance); parse
    /// failures are logged and read as zero.
    pub(crate) fn own_uint(&self, name: &str) -> u64 {
        match self
            .prop
            .get_raw(&self.env.properties, name)
            .and_then(|raw| parse_size(&raw))
        {
            Ok(value) => value,
            Err(e) => {
                warn!(container = %self.name, property = name, error = %e, "can't get property");
                0
            }
        }
    }

    /// The (prio, rate, ceil) shaping contract from the net properties.
    fn shaping_contract(&self) -> (u32, u32, u32) {
        let prio = self.own_uint("net_priority").min(7) as u32;
        let mut rate = self.own_uint("net_guarantee") as u32;
        if rate == 0 {
            rate = self.env.config.network.default_rate;
        }
        let ceil = self.own_uint("net_limit") as u32;
        (prio, rate, ceil)
    }

    fn refresh_shaping(&mut self) -> Result<()> {
        let Some(tclass) = &self.tclass else {
            return Ok(());
        };
        let (prio, rate, ceil) = self.shaping_contract();
        let mut net = self.env.lock_net()?;
        // RTM_NEWTCLASS without EXCL replaces the class parameters in place.
        tclass.create(&mut net, prio, rate, ceil)?;
        Ok(())
    }

    /// Starts the container.
    ///
    /// Acquires the cgroup handles, writes the resource knobs, materialises
    /// the traffic class and launches the payload. A failure at any step
    /// unwinds everything acquired so far and leaves the container
    /// `Stopped`. An empty command yields `Meta` instead of `Running`.
    pub async fn start(&mut self, spec: StartSpec) -> Result<()> {
        if self.state != ContainerState::Stopped {
            return Err(Error::InvalidState(format!(
                "can't start from state {}",
                self.state
            )));
        }

        let rel = self.env.cgroup_rel(&self.name);
        let subsystems: Vec<_> = self.env.subsystems.all().collect();
        for subsystem in &subsystems {
            let cg = subsystem.cgroup(rel.clone());
            if let Err(e) = subsystem.create(&cg) {
                self.teardown_projection().await;
                return Err(e.into());
            }
            self.cgroups.insert(subsystem.name().to_owned(), cg);
        }

        if let Err(e) = self.apply_resource_knobs(&spec) {
            self.teardown_projection().await;
            return Err(e);
        }

        if self.env.net_enabled() {
            let tclass = TcClass::under_qdisc(
                self.env.qdisc(),
                self.env.class_handle(self.class_minor),
            );
            let created: Result<()> = match self.env.lock_net() {
                Ok(mut net) => tclass
                    .create(&mut net, spec.net_prio, spec.net_rate, spec.net_ceil)
                    .map_err(Into::into),
                Err(e) => Err(e),
            };
            if let Err(e) = created {
                self.teardown_projection().await;
                return Err(e);
            }
            self.tclass = Some(tclass);
        }

        if spec.command.trim().is_empty() {
            self.state = ContainerState::Meta;
            info!(container = %self.name, "container entered meta state");
            return Ok(());
        }

        let payload = PayloadSpec {
            command: spec.command.clone(),
            cred: spec.cred,
            cwd: spec.cwd,
            root: spec.root,
            hostname: spec.hostname,
            env_vars: spec.env_vars,
            rlimits: spec.rlimits,
            binds: spec.binds,
            net: spec.net,
            cgroup_procs: self.cgroups.values().map(Cgroup::procs_path).collect(),
            stdin_path: spec.stdin_path,
            stdout_path: spec.stdout_path,
            stderr_path: spec.stderr_path,
        };

        match self.env.launcher.launch(&payload).await {
            Ok(pid) => {
                self.root_pid = Some(pid);
                self.start_errno = 0;
                self.state = ContainerState::Running;
                info!(container = %self.name, pid, "container started");
                Ok(())
            }
            Err(e) => {
                self.start_errno = e.raw_os_error().unwrap_or(0);
                self.teardown_projection().await;
                Err(Error::Unknown(format!("can't start container: {e}")))
            }
        }
    }

    /// Stops the container.
    ///
    /// Signals the payload, escalates through the freezer if the grace
    /// period runs out, then tears down the projection. Teardown errors are
    /// logged; the container reaches `Stopped` on every path.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == ContainerState::Stopped {
            return Err(Error::InvalidState("container is not running".into()));
        }

        if self.state == ContainerState::Paused {
            if let Err(e) = self.thaw_cgroup().await {
                warn!(container = %self.name, error = %e, "can't thaw before stop");
            }
        }

        if self.state == ContainerState::Running || self.state == ContainerState::Paused {
            if let Some(pid) = self.root_pid {
                self.shutdown_payload(pid).await;
            }
        }

        self.teardown_projection().await;
        self.root_pid = None;
        self.exit_status = None;
        self.oom_killed = false;
        self.state = ContainerState::Stopped;
        info!(container = %self.name, "container stopped");
        Ok(())
    }

    /// Freezes the container.
    pub async fn pause(&mut self) -> Result<()> {
        if self.state != ContainerState::Running {
            return Err(Error::InvalidState(format!(
                "can't pause from state {}",
                self.state
            )));
        }

        let (freezer, cg) = self.freezer_cgroup()?;
        freezer.freeze(&cg, self.env.freezer_wait()).await?;
        self.state = ContainerState::Paused;
        info!(container = %self.name, "container paused");
        Ok(())
    }

    /// Thaws the container.
    pub async fn resume(&mut self) -> Result<()> {
        if self.state != ContainerState::Paused {
            return Err(Error::InvalidState(format!(
                "can't resume from state {}",
                self.state
            )));
        }

        self.thaw_cgroup().await?;
        self.state = ContainerState::Running;
        info!(container = %self.name, "container resumed");
        Ok(())
    }

    /// Sends `sig` to the payload. State is not changed here; the payload
    /// exit is observed by [`Container::reap`].
    pub fn kill(&mut self, sig: i32) -> Result<()> {
        if self.state != ContainerState::Running {
            return Err(Error::InvalidState(format!(
                "can't kill in state {}",
                self.state
            )));
        }
        let pid = self
            .root_pid
            .ok_or_else(|| Error::InvalidState("no payload pid".into()))?;
        self.env
            .launcher
            .kill(pid, sig)
            .map_err(|e| Error::Unknown(format!("can't kill pid {pid}: {e}")))
    }

    /// Observes a payload exit, driving `Running -> Dead`.
    pub fn reap(&mut self) {
        if self.state != ContainerState::Running {
            return;
        }
        let Some(pid) = self.root_pid else {
            return;
        };

        match self.env.launcher.try_reap(pid) {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                self.oom_killed = self.exited_from_oom(status);
                self.state = ContainerState::Dead;
                info!(container = %self.name, status, "payload exited");
            }
            Ok(None) => {}
            Err(e) => warn!(container = %self.name, pid, error = %e, "can't reap payload"),
        }
    }

    /// Evaluates a read-only data field.
    pub fn data(&self, source: crate::data::DataSource) -> Result<String> {
        use crate::data::DataSource;

        match source {
            DataSource::State => Ok(self.state.to_string()),
            DataSource::StartErrno => Ok(self.start_errno.to_string()),
            DataSource::RootPid => match self.state {
                ContainerState::Running | ContainerState::Paused | ContainerState::Dead => Ok(self
                    .root_pid
                    .map_or_else(|| "0".to_owned(), |pid| pid.to_string())),
                state => Err(Error::InvalidState(format!(
                    "no root pid in state {state}"
                ))),
            },
            DataSource::ExitStatus => {
                if self.state == ContainerState::Dead {
                    Ok(self.exit_status.unwrap_or_default().to_string())
                } else {
                    Err(Error::InvalidState(format!(
                        "no exit status in state {}",
                        self.state
                    )))
                }
            }
            DataSource::OomKilled => {
                if self.state == ContainerState::Dead {
                    Ok(self.oom_killed.to_string())
                } else {
                    Err(Error::InvalidState(format!(
                        "no oom state in state {}",
                        self.state
                    )))
                }
            }
            DataSource::MemoryUsage => self.subsystem_usage("memory"),
            DataSource::CpuUsage => self.subsystem_usage("cpuacct"),
            DataSource::Net(kind) => {
                let Some(tclass) = &self.tclass else {
                    return Err(Error::InvalidState(format!(
                        "no network projection in state {}",
                        self.state
                    )));
                };
                let mut net = self.env.lock_net()?;
                let stats = tclass.stat(&mut net, kind)?;
                let mut entries: Vec<_> = stats.into_iter().collect();
                entries.sort();
                Ok(entries
                    .into_iter()
                    .map(|(link, value)| format!("{link}: {value}"))
                    .collect::<Vec<_>>()
                    .join("; "))
            }
        }
    }

    /// A SIGKILL death with memory-controller failures on record is the
    /// oom killer's signature.
    fn exited_from_oom(&self, status: i32) -> bool {
        if !libc::WIFSIGNALED(status) || libc::WTERMSIG(status) != libc::SIGKILL {
            return false;
        }
        let Some(cg) = self.cgroups.get("memory") else {
            return false;
        };
        cg.knob_u64("memory.failcnt").map_or(false, |count| count > 0)
    }

    fn subsystem_usage(&self, subsystem_name: &str) -> Result<String> {
        let cg = self.cgroups.get(subsystem_name).ok_or_else(|| {
            Error::InvalidState(format!("no {subsystem_name} cgroup in state {}", self.state))
        })?;
        let subsystem = self
            .env
            .subsystems
            .get(subsystem_name)
            .ok_or_else(|| Error::NotFound(format!("subsystem {subsystem_name}")))?;
        Ok(subsystem.usage(cg)?.to_string())
    }

    /// Detaches the persistence node; part of destroy.
    pub(crate) fn remove_storage(&self) -> Result<()> {
        self.prop.remove_node()
    }

    fn apply_resource_knobs(&self, spec: &StartSpec) -> Result<()> {
        for (name, cg) in &self.cgroups {
            let Some(subsystem) = self.env.subsystems.get(name) else {
                continue;
            };
            match subsystem.kind() {
                SubsystemKind::Memory => {
                    if spec.memory_limit > 0 {
                        cg.set_knob("memory.limit_in_bytes", &spec.memory_limit.to_string())?;
                    }
                    if spec.memory_guarantee > 0 {
                        cg.set_knob(
                            "memory.soft_limit_in_bytes",
                            &spec.memory_guarantee.to_string(),
                        )?;
                    }
                }
                SubsystemKind::Cpu => {
                    if spec.cpu_policy == "idle" {
                        cg.set_knob("cpu.shares", "2")?;
                    } else if spec.cpu_guarantee > 0 {
                        cg.set_knob("cpu.shares", &spec.cpu_guarantee.to_string())?;
                    }
                    if spec.cpu_limit > 0 {
                        // cpu_limit is a percentage of one core.
                        cg.set_knob("cpu.cfs_period_us", "100000")?;
                        cg.set_knob("cpu.cfs_quota_us", &(spec.cpu_limit * 1000).to_string())?;
                    }
                }
                SubsystemKind::Generic if name == "net_cls" => {
                    let classid = self.env.class_handle(self.class_minor);
                    cg.set_knob("net_cls.classid", &classid.to_string())?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn freezer_cgroup(&self) -> Result<(Arc<corral_cgroup::Subsystem>, Cgroup)> {
        let freezer = self
            .env
            .subsystems
            .get("freezer")
            .ok_or_else(|| Error::NotFound("subsystem freezer".into()))?;
        let cg = self
            .cgroups
            .get("freezer")
            .cloned()
            .ok_or_else(|| Error::InvalidState("no freezer cgroup".into()))?;
        Ok((freezer, cg))
    }

    async fn thaw_cgroup(&self) -> Result<()> {
        let (freezer, cg) = self.freezer_cgroup()?;
        freezer.thaw(&cg, self.env.freezer_wait()).await?;
        Ok(())
    }

    /// Graceful signal, bounded wait, then the freezer-assisted SIGKILL
    /// escalation.
    async fn shutdown_payload(&mut self, pid: i32) {
        if let Err(e) = self.env.launcher.kill(pid, libc::SIGTERM) {
            warn!(container = %self.name, pid, error = %e, "can't signal payload");
        }

        let grace = std::time::Duration::from_millis(self.env.config.container.grace_period_ms);
        let tick = std::time::Duration::from_millis(
            self.env.config.container.freezer_wait_interval_ms.max(1),
        );
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            match self.env.launcher.try_reap(pid) {
                Ok(Some(status)) => {
                    self.exit_status = Some(status);
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(container = %self.name, pid, error = %e, "can't reap payload");
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(tick).await;
        }

        // The payload ignored the grace period. Freeze the whole group so
        // nothing can fork away, SIGKILL everything, then thaw to let the
        // kills be delivered.
        if let Ok((freezer, cg)) = self.freezer_cgroup() {
            let wait = self.env.freezer_wait();
            if let Err(e) = freezer.freeze(&cg, wait).await {
                warn!(container = %self.name, error = %e, "can't freeze for kill");
            }
            if let Err(e) = cg.kill_all(libc::SIGKILL) {
                warn!(container = %self.name, error = %e, "can't kill cgroup tasks");
            }
            if let Err(e) = freezer.thaw(&cg, wait).await {
                warn!(container = %self.name, error = %e, "can't thaw after kill");
            }
        }

        for _ in 0..50 {
            match self.env.launcher.try_reap(pid) {
                Ok(Some(status)) => {
                    self.exit_status = Some(status);
                    return;
                }
                Ok(None) => tokio::time::sleep(tick).await,
                Err(_) => return,
            }
        }
        warn!(container = %self.name, pid, "payload survived the kill escalation");
    }

    /// Removes the tc class and every cgroup handle. Errors are logged,
    /// never propagated; the projection is gone from the model either way.
    async fn teardown_projection(&mut self) {
        if let Some(tclass) = self.tclass.take() {
            match self.env.lock_net() {
                Ok(mut net) => {
                    if let Err(e) = tclass.remove(&mut net) {
                        warn!(container = %self.name, error = %e, "can't remove traffic class");
                    }
                }
                Err(e) => warn!(container = %self.name, error = %e, "can't lock net context"),
            }
        }

        let (attempts, interval) = self.env.remove_retry();
        for (name, cg) in self.cgroups.drain() {
            if let Err(e) = cg.remove(attempts, interval).await {
                warn!(container = %self.name, subsystem = %name, error = %e, "can't remove cgroup");
            }
        }
    }
}
