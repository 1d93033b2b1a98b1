//! Client-writable container properties.
//!
//! [`register_properties`] builds the process-wide property registry as an
//! explicit collection (no ambient globals); [`PropertyHolder`] wraps one
//! container's variant set together with its persistence node.

use std::sync::Arc;

use corral_kv::KvStore;
use tracing::warn;

use crate::error::{Error, Result};
use crate::state::ContainerState;
use crate::value::{flags, PropertyHook, ValueDescriptor, ValueKind, ValueSet, VariantSet};

/// Registry of client-writable properties.
pub type PropertySet = ValueSet;

/// Hidden bookkeeping property: owner uid, stamped at create.
pub const OWNER_USER: &str = "owner_user";
/// Hidden bookkeeping property: owner gid, stamped at create.
pub const OWNER_GROUP: &str = "owner_group";

const STOPPED: &[ContainerState] = &[ContainerState::Stopped];
const STOPPED_OR_RUNNING: &[ContainerState] = &[ContainerState::Stopped, ContainerState::Running];
const ANY: &[ContainerState] = &[
    ContainerState::Stopped,
    ContainerState::Running,
    ContainerState::Paused,
    ContainerState::Dead,
    ContainerState::Meta,
];

/// Builds the property registry.
#[must_use]
pub fn register_properties() -> PropertySet {
    let mut set = PropertySet::default();

    let mut prop = |name, desc, kind, flag_bits, default, writable_in, hook| {
        set.register(ValueDescriptor {
            name,
            desc,
            kind,
            flags: flag_bits,
            default,
            writable_in,
            hook,
        });
    };

    prop("command", "command executed upon start", ValueKind::Str, 0, "", STOPPED, None);
    prop("user", "user of container processes", ValueKind::Str, flags::SUPERUSER, "root", STOPPED, None);
    prop("group", "group of container processes", ValueKind::Str, flags::SUPERUSER, "root", STOPPED, None);
    prop("env", "container environment variables, separated by ;", ValueKind::Str, 0, "", STOPPED, None);
    prop("cwd", "container working directory", ValueKind::Str, 0, "/", STOPPED, None);
    prop("root", "container root directory", ValueKind::Str, 0, "/", STOPPED, None);
    prop("hostname", "container hostname", ValueKind::Str, 0, "", STOPPED, None);
    prop(
        "isolate",
        "whether the container shares its parent namespaces",
        ValueKind::Bool,
        flags::PARENT_RO,
        "true",
        STOPPED,
        None,
    );
    prop("stdin_path", "standard input path", ValueKind::Str, 0, "", STOPPED, None);
    prop("stdout_path", "standard output path", ValueKind::Str, 0, "", STOPPED, None);
    prop("stderr_path", "standard error path", ValueKind::Str, 0, "", STOPPED, None);
    prop(
        "memory_limit",
        "memory hard limit in bytes",
        ValueKind::Uint,
        flags::PARENT_DEFAULT,
        "0",
        STOPPED_OR_RUNNING,
        None,
    );
    prop(
        "memory_guarantee",
        "guaranteed amount of memory in bytes",
        ValueKind::Uint,
        flags::PARENT_DEFAULT,
        "0",
        STOPPED_OR_RUNNING,
        None,
    );
    prop("cpu_limit", "cpu limit in percent", ValueKind::Uint, 0, "0", STOPPED_OR_RUNNING, None);
    prop("cpu_guarantee", "cpu weight", ValueKind::Uint, 0, "0", STOPPED_OR_RUNNING, None);
    prop("cpu_policy", "cpu policy: normal or idle", ValueKind::Str, 0, "normal", STOPPED, None);
    prop(
        "net_guarantee",
        "guaranteed network bandwidth in bytes per second",
        ValueKind::Uint,
        0,
        "0",
        STOPPED_OR_RUNNING,
        Some(PropertyHook::NetShaping),
    );
    prop(
        "net_limit",
        "network bandwidth ceiling in bytes per second",
        ValueKind::Uint,
        0,
        "0",
        STOPPED_OR_RUNNING,
        Some(PropertyHook::NetShaping),
    );
    prop(
        "net_priority",
        "network traffic priority, 0 to 7",
        ValueKind::Uint,
        0,
        "3",
        STOPPED_OR_RUNNING,
        Some(PropertyHook::NetShaping),
    );
    prop(
        "net",
        "network attachment: host or none",
        ValueKind::NetConfig,
        flags::PARENT_RO,
        "host",
        STOPPED,
        None,
    );
    prop("ulimit", "resource limits, e.g. nofile: 1024 2048", ValueKind::RlimitMap, 0, "", STOPPED, None);
    prop("bind", "bind mounts: source target [ro|rw]", ValueKind::BindList, 0, "", STOPPED, None);
    prop("private", "user-defined opaque label", ValueKind::Str, 0, "", ANY, None);
    prop(
        OWNER_USER,
        "owner uid",
        ValueKind::Uint,
        flags::HIDDEN | flags::SUPERUSER,
        "0",
        STOPPED,
        None,
    );
    prop(
        OWNER_GROUP,
        "owner gid",
        ValueKind::Uint,
        flags::HIDDEN | flags::SUPERUSER,
        "0",
        STOPPED,
        None,
    );

    set
}

/// One container's writable configuration plus its persistence node.
#[derive(Debug)]
pub struct PropertyHolder {
    kv: Arc<KvStore>,
    node: String,
    variants: VariantSet,
}

impl PropertyHolder {
    /// Builds an empty holder persisting under `node`.
    pub fn new(kv: Arc<KvStore>, node: impl Into<String>) -> Self {
        Self {
            kv,
            node: node.into(),
            variants: VariantSet::default(),
        }
    }

    /// Whether the slot for `name` has no local override.
    #[must_use]
    pub fn is_default(&self, name: &str) -> bool {
        self.variants.is_default(name)
    }

    /// The stored string form, or the descriptor's static default.
    pub fn get_raw(&self, registry: &PropertySet, name: &str) -> Result<String> {
        Ok(self.variants.get_raw(registry.get(name)?))
    }

    /// Overwrites a slot in memory only; the restore path.
    pub fn set_raw(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variants.set_raw(name, value);
    }

    /// Validates and stores a property write.
    ///
    /// The pair is appended to the persistence node before the in-memory
    /// slot changes, so memory never runs ahead of disk. Returns the
    /// descriptor's side-effect hook for the caller to apply.
    pub fn set(
        &mut self,
        registry: &PropertySet,
        state: ContainerState,
        privileged: bool,
        shared_namespace: bool,
        name: &str,
        value: &str,
    ) -> Result<Option<PropertyHook>> {
        let descriptor = registry.get(name)?;

        if !descriptor.writable_in(state) {
            return Err(Error::InvalidState(format!(
                "property {name} is not writable while {state}"
            )));
        }
        if descriptor.has_flags(flags::SUPERUSER) && !privileged {
            return Err(Error::PermissionDenied(format!(
                "only root can change {name}"
            )));
        }
        if descriptor.has_flags(flags::PARENT_RO) && shared_namespace {
            return Err(Error::PermissionDenied(format!(
                "can't change {name} of a container sharing its parent namespace"
            )));
        }

        descriptor.kind.validate(value)?;

        self.kv.append(&self.node, name, value)?;
        self.variants.set_raw(name, value);
        Ok(descriptor.hook)
    }

    /// Writes the node from scratch with every explicit slot.
    pub fn create(&self, registry: &PropertySet) -> Result<()> {
        self.kv
            .rewrite(&self.node, &self.variants.explicit_pairs(registry))?;
        Ok(())
    }

    /// Rewrites the node from the live slot set (compaction).
    pub fn sync(&self, registry: &PropertySet) -> Result<()> {
        self.create(registry)
    }

    /// Replays persisted pairs in order; later pairs for a key win.
    ///
    /// Unknown keys are discarded with a warning so a registry that shrank
    /// between releases does not strand the container. A known key whose
    /// value no longer validates surfaces as [`Error::Corrupted`].
    pub fn restore(&mut self, registry: &PropertySet, pairs: &[(String, String)]) -> Result<()> {
        for (key, value) in pairs {
            let descriptor = match registry.get(key) {
                Ok(descriptor) => descriptor,
                Err(_) => {
                    warn!(node = %self.node, key, "discarding unknown property");
                    continue;
                }
            };

            descriptor.kind.validate(value).map_err(|_| {
                Error::Corrupted(format!(
                    "node {}: property {key} holds unparsable {value:?}",
                    self.node
                ))
            })?;
            self.variants.set_raw(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Removes the persistence node.
    pub fn remove_node(&self) -> Result<()> {
        self.kv.remove(&self.node)?;
        Ok(())
    }

    /// The raw variant set, for read-only inspection.
    #[must_use]
    pub fn variants(&self) -> &VariantSet {
        &self.variants
    }
}
