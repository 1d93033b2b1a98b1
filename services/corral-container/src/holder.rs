//! The container registry: a tree of containers keyed by hierarchical
//! name.
//!
//! The holder exclusively owns every container and serialises creation,
//! destruction, lookup, enumeration and post-restart restoration. Parent
//! links are plain names resolved through the registry, so destruction
//! order can never observe a dangling reference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corral_cgroup::Cgroup;
use tracing::{info, warn};

use crate::container::{Container, StartSpec};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::property::{OWNER_GROUP, OWNER_USER};
use crate::state::Cred;
use crate::value::{flags, parse_bind, parse_net, parse_rlimit, parse_size};

/// Registry of all live containers.
pub struct ContainerHolder {
    env: Arc<Env>,
    order: Vec<String>,
    containers: HashMap<String, Container>,
    next_minor: u16,
}

impl ContainerHolder {
    /// Builds an empty holder over `env`.
    #[must_use]
    pub fn new(env: Arc<Env>) -> Self {
        let next_minor = env.config.network.default_class_minor + 1;
        Self {
            env,
            order: Vec::new(),
            containers: HashMap::new(),
            next_minor,
        }
    }

    /// The engine environment.
    #[must_use]
    pub fn env(&self) -> &Arc<Env> {
        &self.env
    }

    /// Whether `name` denotes the implicit root container.
    #[must_use]
    pub fn is_root(name: &str) -> bool {
        name.is_empty() || name == "/"
    }

    /// Creates a container owned by `cred`.
    pub fn create(&mut self, name: &str, cred: Cred) -> Result<()> {
        if Self::is_root(name) {
            return Err(Error::ContainerAlreadyExists("invalid name".into()));
        }
        validate_name(name)?;
        if self.containers.contains_key(name) {
            return Err(Error::ContainerAlreadyExists("invalid name".into()));
        }

        let parent = parent_name(name);
        if let Some(parent) = &parent {
            if !self.containers.contains_key(parent) {
                return Err(Error::ContainerDoesNotExist(format!(
                    "parent container {parent} does not exist"
                )));
            }
        }

        let minor = self.alloc_minor()?;
        let mut container =
            Container::new(Arc::clone(&self.env), name, parent, cred, minor);
        container.create()?;

        self.order.push(name.to_owned());
        self.containers.insert(name.to_owned(), container);
        info!(container = name, uid = cred.uid, "container created");
        Ok(())
    }

    /// Looks a container up; `None` for the root or an unknown name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Container> {
        if Self::is_root(name) {
            return None;
        }
        self.containers.get(name)
    }

    fn require(&self, name: &str) -> Result<&Container> {
        self.get(name)
            .ok_or_else(|| Error::ContainerDoesNotExist("invalid name".into()))
    }

    fn require_mut(&mut self, name: &str) -> Result<&mut Container> {
        if Self::is_root(name) {
            return Err(Error::ContainerDoesNotExist("invalid name".into()));
        }
        self.containers
            .get_mut(name)
            .ok_or_else(|| Error::ContainerDoesNotExist("invalid name".into()))
    }

    /// Container names in creation order.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Compares `cred` against the owner of `name`.
    pub fn check_permission(&self, name: &str, cred: Cred) -> Result<()> {
        self.require(name)?.check_permission(cred)
    }

    /// Destroys a container: refuses while children exist, stops a
    /// non-stopped container first, then drops its persistence node and
    /// registry entry.
    pub async fn destroy(&mut self, name: &str) -> Result<()> {
        if Self::is_root(name) {
            return Err(Error::InvalidValue("can't destroy root container".into()));
        }
        let container = self.require(name)?;

        if self.children_of(name).next().is_some() {
            return Err(Error::Busy(format!("container {name} has children")));
        }

        if container.state() != crate::state::ContainerState::Stopped {
            self.require_mut(name)?.stop().await?;
        }

        let container = self.require(name)?;
        container.remove_storage()?;

        self.containers.remove(name);
        self.order.retain(|n| n != name);
        info!(container = name, "container destroyed");
        Ok(())
    }

    fn children_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Container> + 'a {
        self.containers
            .values()
            .filter(move |c| c.parent() == Some(name))
    }

    /// The effective value of a property: the explicit slot, else (for
    /// parent-default descriptors) the nearest ancestor's explicit value,
    /// else the static default.
    pub fn get_property(&self, name: &str, property: &str) -> Result<String> {
        let container = self.require(name)?;
        let descriptor = self.env.properties.get(property)?;

        if container.prop().is_default(property) && descriptor.has_flags(flags::PARENT_DEFAULT) {
            let mut current = container.parent();
            while let Some(ancestor_name) = current {
                let Some(ancestor) = self.containers.get(ancestor_name) else {
                    break;
                };
                if !ancestor.prop().is_default(property) {
                    return ancestor.prop().get_raw(&self.env.properties, property);
                }
                current = ancestor.parent();
            }
        }

        container.prop().get_raw(&self.env.properties, property)
    }

    /// Whether the slot of `property` is default (unset) on `name`.
    pub fn is_default(&self, name: &str, property: &str) -> Result<bool> {
        Ok(self.require(name)?.prop().is_default(property))
    }

    /// Writes a property on `name`.
    pub fn set_property(
        &mut self,
        name: &str,
        property: &str,
        value: &str,
        privileged: bool,
    ) -> Result<()> {
        self.require_mut(name)?
            .set_property(property, value, privileged)
    }

    /// Evaluates a data field on `name`.
    pub fn get_data(&self, name: &str, data: &str) -> Result<String> {
        let source = self.env.data.get(data)?.source;
        self.require(name)?.data(source)
    }

    /// Starts `name` with its effective configuration.
    pub async fn start(&mut self, name: &str) -> Result<()> {
        let spec = self.start_spec(name)?;
        self.require_mut(name)?.start(spec).await
    }

    /// Stops `name`.
    pub async fn stop(&mut self, name: &str) -> Result<()> {
        self.require_mut(name)?.stop().await
    }

    /// Pauses `name`.
    pub async fn pause(&mut self, name: &str) -> Result<()> {
        self.require_mut(name)?.pause().await
    }

    /// Resumes `name`.
    pub async fn resume(&mut self, name: &str) -> Result<()> {
        self.require_mut(name)?.resume().await
    }

    /// Sends a signal to the payload of `name`.
    pub fn kill(&mut self, name: &str, sig: i32) -> Result<()> {
        self.require_mut(name)?.kill(sig)
    }

    /// Observes payload exits across the fleet (`Running -> Dead`).
    pub fn reconcile_exits(&mut self) {
        for container in self.containers.values_mut() {
            container.reap();
        }
    }

    /// Compacts every container's persistence node.
    pub fn sync_all(&self) {
        for container in self.containers.values() {
            if let Err(e) = container.prop().sync(&self.env.properties) {
                warn!(container = %container.name(), error = %e, "can't sync storage node");
            }
        }
    }

    /// Rehydrates the fleet from the key/value store, then removes any
    /// kernel state left behind by a previous daemon generation.
    ///
    /// Nodes are replayed shallowest-first so parents exist before their
    /// children; a node that fails to replay is logged and skipped rather
    /// than taking the whole fleet down.
    pub async fn restore_all(&mut self) -> Result<()> {
        let mut nodes = self.env.kv.list_nodes()?;
        nodes.sort_by_key(|name| (name.matches('/').count(), name.clone()));

        for node in nodes {
            if let Err(e) = self.restore_one(&node) {
                warn!(node = %node, error = %e, "can't restore container");
            }
        }

        self.cleanup_residual_cgroups().await;
        Ok(())
    }

    fn restore_one(&mut self, node: &str) -> Result<()> {
        validate_name(node)?;
        if let Some(parent) = parent_name(node) {
            if !self.containers.contains_key(&parent) {
                return Err(Error::ContainerDoesNotExist(format!(
                    "parent container {parent} was not restored"
                )));
            }
        }

        let pairs = self.env.kv.load(node)?;

        let mut owner = Cred::root();
        for (key, value) in &pairs {
            if key == OWNER_USER {
                owner.uid = value.parse().unwrap_or(0);
            } else if key == OWNER_GROUP {
                owner.gid = value.parse().unwrap_or(0);
            }
        }

        let minor = self.alloc_minor()?;
        let mut container = Container::new(
            Arc::clone(&self.env),
            node,
            parent_name(node),
            owner,
            minor,
        );
        container.prop_mut().restore(&self.env.properties, &pairs)?;

        self.order.push(node.to_owned());
        self.containers.insert(node.to_owned(), container);
        info!(container = node, "container restored");
        Ok(())
    }

    /// Every restored container is `Stopped`, so any cgroup directory under
    /// the daemon prefix is residue of the previous generation: kill what
    /// lives there and remove it, children before parents.
    async fn cleanup_residual_cgroups(&self) {
        let (attempts, interval) = self.env.remove_retry();

        for subsystem in self.env.subsystems.all() {
            let base = subsystem
                .cgroup(self.env.config.container.cgroup_prefix.clone())
                .path()
                .to_path_buf();
            let mut dirs = Vec::new();
            collect_dirs_post_order(&base, &mut dirs);

            for dir in dirs {
                let Ok(rel) = dir.strip_prefix(subsystem.mount()) else {
                    continue;
                };
                let rel = rel.to_string_lossy().into_owned();
                let cg = Cgroup::new(subsystem.name(), subsystem.mount(), rel.clone());
                warn!(subsystem = %subsystem.name(), cgroup = %rel, "removing residual cgroup");
                if let Err(e) = cg.remove(attempts, interval).await {
                    warn!(cgroup = %rel, error = %e, "can't remove residual cgroup");
                }
            }
        }
    }

    /// Builds the fully-resolved start parameters for `name`.
    fn start_spec(&self, name: &str) -> Result<StartSpec> {
        let get = |prop: &str| self.get_property(name, prop);

        let user = get("user")?;
        let group = get("group")?;
        let cred = Cred {
            uid: resolve_user(&user)?,
            gid: resolve_group(&group)?,
        };

        let optional_path = |raw: String| (!raw.is_empty()).then(|| PathBuf::from(raw));

        Ok(StartSpec {
            command: get("command")?,
            cred,
            cwd: PathBuf::from(get("cwd")?),
            root: PathBuf::from(get("root")?),
            hostname: get("hostname")?,
            env_vars: parse_env_list(&get("env")?),
            rlimits: parse_rlimit(&get("ulimit")?)?,
            binds: parse_bind(&get("bind")?)?,
            net: parse_net(&get("net")?)?,
            stdin_path: optional_path(get("stdin_path")?),
            stdout_path: optional_path(get("stdout_path")?),
            stderr_path: optional_path(get("stderr_path")?),
            memory_limit: self.effective_uint(name, "memory_limit"),
            memory_guarantee: self.effective_uint(name, "memory_guarantee"),
            cpu_limit: self.effective_uint(name, "cpu_limit"),
            cpu_guarantee: self.effective_uint(name, "cpu_guarantee"),
            cpu_policy: get("cpu_policy")?,
            net_prio: self.effective_uint(name, "net_priority").min(7) as u32,
            net_rate: shaping_rate(
                self.effective_uint(name, "net_guarantee"),
                self.env.config.network.default_rate,
            ),
            net_ceil: self.effective_uint(name, "net_limit") as u32,
        })
    }

    /// Typed accessor over the effective value; parse failures are logged
    /// and read as zero.
    fn effective_uint(&self, name: &str, property: &str) -> u64 {
        match self
            .get_property(name, property)
            .and_then(|raw| parse_size(&raw))
        {
            Ok(value) => value,
            Err(e) => {
                warn!(container = name, property, error = %e, "can't get property");
                0
            }
        }
    }

    fn alloc_minor(&mut self) -> Result<u16> {
        if self.next_minor == u16::MAX {
            return Err(Error::Busy("out of traffic class handles".into()));
        }
        let minor = self.next_minor;
        self.next_minor += 1;
        Ok(minor)
    }
}

fn shaping_rate(guarantee: u64, default_rate: u32) -> u32 {
    if guarantee == 0 {
        default_rate
    } else {
        u32::try_from(guarantee).unwrap_or(u32::MAX)
    }
}

/// The parent of a hierarchical name; `None` means the implicit root.
#[must_use]
pub fn parent_name(name: &str) -> Option<String> {
    name.rsplit_once('/').map(|(parent, _)| parent.to_owned())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "/" {
        return Err(Error::InvalidValue("invalid name".into()));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidValue(format!("invalid name {name:?}")));
    }
    for segment in name.split('/') {
        if segment.is_empty() {
            return Err(Error::InvalidValue(format!("invalid name {name:?}")));
        }
        let valid = segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(Error::InvalidValue(format!("invalid name {name:?}")));
        }
    }
    Ok(())
}

fn parse_env_list(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            match entry.split_once('=') {
                Some((key, value)) => Some((key.to_owned(), value.to_owned())),
                None => Some((entry.to_owned(), String::new())),
            }
        })
        .collect()
}

fn resolve_user(name: &str) -> Result<u32> {
    if let Ok(uid) = name.parse() {
        return Ok(uid);
    }
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| Error::InvalidValue(format!("invalid user {name:?}")))?;
    let pw = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if pw.is_null() {
        return Err(Error::InvalidValue(format!("invalid user {name}")));
    }
    Ok(unsafe { (*pw).pw_uid })
}

fn resolve_group(name: &str) -> Result<u32> {
    if let Ok(gid) = name.parse() {
        return Ok(gid);
    }
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| Error::InvalidValue(format!("invalid group {name:?}")))?;
    let gr = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if gr.is_null() {
        return Err(Error::InvalidValue(format!("invalid group {name}")));
    }
    Ok(unsafe { (*gr).gr_gid })
}

fn collect_dirs_post_order(base: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(base) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_dirs_post_order(&path, out);
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_resolution_strips_the_last_segment() {
        assert_eq!(parent_name("a"), None);
        assert_eq!(parent_name("a/b"), Some("a".to_owned()));
        assert_eq!(parent_name("a/b/c"), Some("a/b".to_owned()));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("web").is_ok());
        assert!(validate_name("web/backend-1").is_ok());
        assert!(validate_name("a.b_c/d").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("/").is_err());
        assert!(validate_name("/a").is_err());
        assert!(validate_name("a/").is_err());
        assert!(validate_name("a//b").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("a%b").is_err());
    }

    #[test]
    fn env_list_parsing() {
        let vars = parse_env_list("A=1;B=two words; C ;");
        assert_eq!(
            vars,
            vec![
                ("A".to_owned(), "1".to_owned()),
                ("B".to_owned(), "two words".to_owned()),
                ("C".to_owned(), String::new()),
            ]
        );
        assert!(parse_env_list("").is_empty());
    }

    #[test]
    fn numeric_credentials_resolve_without_nss() {
        assert_eq!(resolve_user("0").unwrap(), 0);
        assert_eq!(resolve_user("1234").unwrap(), 1234);
        assert_eq!(resolve_group("42").unwrap(), 42);
        assert!(resolve_user("no-such-user-corral").is_err());
    }
}
