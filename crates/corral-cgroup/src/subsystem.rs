//! Per-subsystem adapters.
//!
//! Every adapter shares the generic knob surface of [`Cgroup`]; the memory,
//! freezer and cpuacct subsystems carry extra behaviour on top. The
//! dispatcher picks the specialisation at construction time from the
//! subsystem name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::cgroup::Cgroup;
use crate::error::{CgroupError, Result};

/// Freezer transition target written to `freezer.state`.
pub const FREEZER_FROZEN: &str = "FROZEN";
/// Freezer transition target written to `freezer.state`.
pub const FREEZER_THAWED: &str = "THAWED";

/// Specialisation of a subsystem adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemKind {
    Memory,
    Freezer,
    Cpu,
    Cpuacct,
    Generic,
}

/// Bounded-poll parameters for freezer state waits.
#[derive(Debug, Clone, Copy)]
pub struct FreezerWait {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for FreezerWait {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(60),
        }
    }
}

/// One cgroup subsystem adapter.
#[derive(Debug)]
pub struct Subsystem {
    name: String,
    kind: SubsystemKind,
    mount: PathBuf,
}

impl Subsystem {
    /// Builds the specialised adapter for `name`, mounted under
    /// `root/<name>`.
    pub fn new(name: impl Into<String>, root: &Path) -> Self {
        let name = name.into();
        let kind = match name.as_str() {
            "memory" => SubsystemKind::Memory,
            "freezer" => SubsystemKind::Freezer,
            "cpu" => SubsystemKind::Cpu,
            "cpuacct" => SubsystemKind::Cpuacct,
            _ => SubsystemKind::Generic,
        };
        let mount = root.join(&name);
        Self { name, kind, mount }
    }

    /// Subsystem name, e.g. `"memory"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The chosen specialisation.
    pub fn kind(&self) -> SubsystemKind {
        self.kind
    }

    /// Mount point of this subsystem's hierarchy.
    pub fn mount(&self) -> &Path {
        &self.mount
    }

    /// Builds a handle for `relpath` in this subsystem's hierarchy.
    pub fn cgroup(&self, relpath: impl Into<String>) -> Cgroup {
        Cgroup::new(self.name.clone(), &self.mount, relpath)
    }

    /// Creates the cgroup directory, applying subsystem-specific setup.
    ///
    /// The memory subsystem turns on hierarchical accounting so child
    /// cgroups charge their parents.
    pub fn create(&self, cg: &Cgroup) -> Result<()> {
        cg.create()?;
        if self.kind == SubsystemKind::Memory {
            cg.set_knob("memory.use_hierarchy", "1")?;
        }
        Ok(())
    }

    /// Current usage counter.
    ///
    /// # Errors
    ///
    /// Returns [`CgroupError::Unsupported`] for subsystems without a usage
    /// counter.
    pub fn usage(&self, cg: &Cgroup) -> Result<u64> {
        match self.kind {
            SubsystemKind::Memory => cg.knob_u64("memory.usage_in_bytes"),
            SubsystemKind::Cpuacct => cg.knob_u64("cpuacct.usage"),
            _ => Err(CgroupError::Unsupported(self.name.clone())),
        }
    }

    /// Freezes every task in `cg` and waits for the kernel to confirm.
    pub async fn freeze(&self, cg: &Cgroup, wait: FreezerWait) -> Result<()> {
        self.freezer_transition(cg, FREEZER_FROZEN, wait).await
    }

    /// Thaws `cg` and waits for the kernel to confirm.
    pub async fn thaw(&self, cg: &Cgroup, wait: FreezerWait) -> Result<()> {
        self.freezer_transition(cg, FREEZER_THAWED, wait).await
    }

    async fn freezer_transition(&self, cg: &Cgroup, state: &str, wait: FreezerWait) -> Result<()> {
        if self.kind != SubsystemKind::Freezer {
            return Err(CgroupError::Unsupported(self.name.clone()));
        }
        cg.set_knob("freezer.state", state)?;
        self.wait_state(cg, state, wait).await
    }

    /// Polls `freezer.state` until it reads `state` or the bound elapses.
    ///
    /// This is the sole blocking primitive of the lifecycle engine; a pause
    /// or resume holds the dispatch path for at most `wait.timeout`.
    pub async fn wait_state(&self, cg: &Cgroup, state: &str, wait: FreezerWait) -> Result<()> {
        let deadline = tokio::time::Instant::now() + wait.timeout;

        loop {
            match cg.get_knob("freezer.state") {
                Ok(current) if current.trim() == state => return Ok(()),
                Ok(_) => {}
                Err(e) => warn!(cgroup = %cg.path().display(), error = %e, "can't read freezer state"),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(CgroupError::FreezerTimeout {
                    state: state.to_owned(),
                });
            }
            tokio::time::sleep(wait.interval).await;
        }
    }
}

/// Registry mapping subsystem names to singleton adapters.
#[derive(Debug, Default)]
pub struct SubsystemRegistry {
    order: Vec<String>,
    map: HashMap<String, Arc<Subsystem>>,
}

impl SubsystemRegistry {
    /// Builds adapters for `names`, all mounted under `root`.
    pub fn new(root: &Path, names: &[String]) -> Self {
        let mut registry = Self::default();
        for name in names {
            registry.register(Subsystem::new(name.clone(), root));
        }
        registry
    }

    /// Adds an adapter; a second registration under the same name is ignored.
    pub fn register(&mut self, subsystem: Subsystem) {
        if self.map.contains_key(subsystem.name()) {
            return;
        }
        self.order.push(subsystem.name().to_owned());
        self.map
            .insert(subsystem.name().to_owned(), Arc::new(subsystem));
    }

    /// Looks up an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<Subsystem>> {
        self.map.get(name).cloned()
    }

    /// Adapters in registration order.
    pub fn all(&self) -> impl Iterator<Item = Arc<Subsystem>> + '_ {
        self.order.iter().filter_map(|name| self.get(name))
    }
}
