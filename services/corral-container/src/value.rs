//! The value system: typed, named fields shared by properties and data.
//!
//! A [`ValueDescriptor`] is registered once per field name and shared by
//! every container; a per-container [`VariantSet`] holds the explicit
//! overrides. Retrieval layers the two: explicit slot, then parent
//! inheritance (for descriptors flagged with [`flags::PARENT_DEFAULT`]),
//! then the descriptor's static default.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::state::ContainerState;

/// Descriptor flag bits.
pub mod flags {
    /// Suppressed in `propertylist`/`datalist` enumeration.
    pub const HIDDEN: u32 = 1 << 0;
    /// Writable only by a privileged credential.
    pub const SUPERUSER: u32 = 1 << 1;
    /// An unset slot inherits from the nearest ancestor with an explicit
    /// value.
    pub const PARENT_DEFAULT: u32 = 1 << 2;
    /// Cannot be changed while the container shares its parent's namespace.
    pub const PARENT_RO: u32 = 1 << 3;
}

/// Kind of a value, with parse/validate rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Bool,
    Int,
    Uint,
    RlimitMap,
    BindList,
    NetConfig,
}

impl ValueKind {
    /// Validates a raw string form against this kind.
    pub fn validate(self, raw: &str) -> Result<()> {
        match self {
            Self::Str => Ok(()),
            Self::Bool => parse_bool(raw).map(drop),
            Self::Int => raw
                .trim()
                .parse::<i64>()
                .map(drop)
                .map_err(|_| Error::InvalidValue(format!("invalid integer: {raw:?}"))),
            Self::Uint => parse_size(raw).map(drop),
            Self::RlimitMap => parse_rlimit(raw).map(drop),
            Self::BindList => parse_bind(raw).map(drop),
            Self::NetConfig => parse_net(raw).map(drop),
        }
    }
}

/// Side effect applied by the container after a successful property write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyHook {
    /// Reinstall the container's HTB class with the new contract.
    NetShaping,
}

/// Registry entry shared across all containers.
#[derive(Debug, Clone)]
pub struct ValueDescriptor {
    pub name: &'static str,
    pub desc: &'static str,
    pub kind: ValueKind,
    pub flags: u32,
    pub default: &'static str,
    /// States in which the value may be written.
    pub writable_in: &'static [ContainerState],
    pub hook: Option<PropertyHook>,
}

impl ValueDescriptor {
    /// Whether any of `mask` bits is set.
    #[must_use]
    pub fn has_flags(&self, mask: u32) -> bool {
        self.flags & mask != 0
    }

    /// Whether the value may be written while the container is in `state`.
    #[must_use]
    pub fn writable_in(&self, state: ContainerState) -> bool {
        self.writable_in.contains(&state)
    }
}

/// Insertion-ordered registry of descriptors.
#[derive(Debug, Default)]
pub struct ValueSet {
    order: Vec<&'static str>,
    map: HashMap<&'static str, ValueDescriptor>,
}

impl ValueSet {
    /// Registers a descriptor. Double registration of a name is a
    /// programming error and panics.
    pub fn register(&mut self, descriptor: ValueDescriptor) {
        assert!(
            !self.map.contains_key(descriptor.name),
            "duplicate value descriptor {}",
            descriptor.name
        );
        self.order.push(descriptor.name);
        self.map.insert(descriptor.name, descriptor);
    }

    /// Looks up a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unregistered name.
    pub fn get(&self, name: &str) -> Result<&ValueDescriptor> {
        self.map
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("invalid property {name}")))
    }

    /// Descriptor names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.order.iter().copied()
    }
}

/// Per-container slot map: only explicit overrides are stored.
#[derive(Debug, Default, Clone)]
pub struct VariantSet {
    slots: HashMap<String, String>,
}

impl VariantSet {
    /// Whether the slot for `name` is still *default* (no local override).
    #[must_use]
    pub fn is_default(&self, name: &str) -> bool {
        !self.slots.contains_key(name)
    }

    /// The stored string form, or the descriptor's static default. Parent
    /// inheritance is layered above this by the holder.
    #[must_use]
    pub fn get_raw(&self, descriptor: &ValueDescriptor) -> String {
        self.slots
            .get(descriptor.name)
            .cloned()
            .unwrap_or_else(|| descriptor.default.to_owned())
    }

    /// Overwrites the slot without parsing or side effects. Used by restore.
    pub fn set_raw(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.slots.insert(name.into(), value.into());
    }

    /// Explicit `(name, value)` pairs in the registry's enumeration order.
    #[must_use]
    pub fn explicit_pairs(&self, registry: &ValueSet) -> Vec<(String, String)> {
        registry
            .names()
            .filter_map(|name| {
                self.slots
                    .get(name)
                    .map(|value| (name.to_owned(), value.clone()))
            })
            .collect()
    }
}

/// Parses a boolean in its canonical string form.
pub fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::InvalidValue(format!("invalid boolean: {other:?}"))),
    }
}

/// Parses an unsigned integer with an optional binary size suffix
/// (`K`, `M`, `G`, `T`).
pub fn parse_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidValue("empty number".into()));
    }

    let (digits, multiplier) = match raw.as_bytes()[raw.len() - 1].to_ascii_uppercase() {
        b'K' => (&raw[..raw.len() - 1], 1u64 << 10),
        b'M' => (&raw[..raw.len() - 1], 1 << 20),
        b'G' => (&raw[..raw.len() - 1], 1 << 30),
        b'T' => (&raw[..raw.len() - 1], 1 << 40),
        _ => (raw, 1),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::InvalidValue(format!("invalid number: {raw:?}")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidValue(format!("number overflow: {raw:?}")))
}

/// One resource limit for the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitSpec {
    pub resource: i32,
    pub soft: u64,
    pub hard: u64,
}

/// Parses an rlimit map: `nofile: 1024 2048; nproc: 64 unlim`.
pub fn parse_rlimit(raw: &str) -> Result<Vec<RlimitSpec>> {
    let mut limits = Vec::new();
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (name, values) = entry
            .split_once(':')
            .ok_or_else(|| Error::InvalidValue(format!("invalid rlimit entry: {entry:?}")))?;

        let resource = rlimit_resource(name.trim())?;
        let mut parts = values.split_whitespace();
        let (Some(soft), Some(hard), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::InvalidValue(format!(
                "rlimit {name} needs a soft and a hard value"
            )));
        };

        limits.push(RlimitSpec {
            resource,
            soft: rlimit_value(soft)?,
            hard: rlimit_value(hard)?,
        });
    }
    Ok(limits)
}

fn rlimit_resource(name: &str) -> Result<i32> {
    let resource = match name {
        "as" => libc::RLIMIT_AS,
        "core" => libc::RLIMIT_CORE,
        "cpu" => libc::RLIMIT_CPU,
        "data" => libc::RLIMIT_DATA,
        "fsize" => libc::RLIMIT_FSIZE,
        "locks" => libc::RLIMIT_LOCKS,
        "memlock" => libc::RLIMIT_MEMLOCK,
        "msgqueue" => libc::RLIMIT_MSGQUEUE,
        "nice" => libc::RLIMIT_NICE,
        "nofile" => libc::RLIMIT_NOFILE,
        "nproc" => libc::RLIMIT_NPROC,
        "rss" => libc::RLIMIT_RSS,
        "rtprio" => libc::RLIMIT_RTPRIO,
        "sigpending" => libc::RLIMIT_SIGPENDING,
        "stack" => libc::RLIMIT_STACK,
        _ => return Err(Error::InvalidValue(format!("invalid rlimit: {name}"))),
    };
    #[allow(clippy::cast_possible_truncation, clippy::unnecessary_cast)]
    Ok(resource as i32)
}

fn rlimit_value(raw: &str) -> Result<u64> {
    if raw == "unlim" || raw == "unlimited" {
        return Ok(libc::RLIM_INFINITY);
    }
    parse_size(raw)
}

/// One bind mount for the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMapping {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

/// Parses a bind list: `/host/path /container/path ro; /data /data`.
pub fn parse_bind(raw: &str) -> Result<Vec<BindMapping>> {
    let mut binds = Vec::new();
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let mut parts = entry.split_whitespace();
        let (Some(source), Some(target)) = (parts.next(), parts.next()) else {
            return Err(Error::InvalidValue(format!(
                "invalid bind entry: {entry:?}"
            )));
        };
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => {
                return Err(Error::InvalidValue(format!("invalid bind mode: {other}")))
            }
        };
        if parts.next().is_some() {
            return Err(Error::InvalidValue(format!(
                "invalid bind entry: {entry:?}"
            )));
        }

        binds.push(BindMapping {
            source: PathBuf::from(source),
            target: PathBuf::from(target),
            read_only,
        });
    }
    Ok(binds)
}

/// Network attachment of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetSetup {
    /// Share the host network namespace.
    #[default]
    Host,
    /// A fresh, empty network namespace.
    None,
}

/// Parses a net config: `host` or `none`.
pub fn parse_net(raw: &str) -> Result<NetSetup> {
    match raw.trim() {
        "host" => Ok(NetSetup::Host),
        "none" => Ok(NetSetup::None),
        other => Err(Error::InvalidValue(format!("invalid net config: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &'static str, kind: ValueKind, flags: u32) -> ValueDescriptor {
        ValueDescriptor {
            name,
            desc: "test",
            kind,
            flags,
            default: "0",
            writable_in: &[ContainerState::Stopped],
            hook: None,
        }
    }

    #[test]
    fn registry_preserves_insertion_order() {
        let mut set = ValueSet::default();
        set.register(descriptor("b", ValueKind::Str, 0));
        set.register(descriptor("a", ValueKind::Str, 0));
        set.register(descriptor("c", ValueKind::Str, 0));

        let names: Vec<_> = set.names().collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert!(set.get("a").is_ok());
        assert!(matches!(set.get("zz"), Err(Error::NotFound(_))));
    }

    #[test]
    fn variant_set_layers_explicit_over_default() {
        let desc = descriptor("cpu_limit", ValueKind::Uint, 0);
        let mut variants = VariantSet::default();

        assert!(variants.is_default("cpu_limit"));
        assert_eq!(variants.get_raw(&desc), "0");

        variants.set_raw("cpu_limit", "50");
        assert!(!variants.is_default("cpu_limit"));
        assert_eq!(variants.get_raw(&desc), "50");
    }

    #[test]
    fn explicit_pairs_follow_registry_order() {
        let mut set = ValueSet::default();
        set.register(descriptor("first", ValueKind::Str, 0));
        set.register(descriptor("second", ValueKind::Str, 0));

        let mut variants = VariantSet::default();
        variants.set_raw("second", "2");
        variants.set_raw("first", "1");

        assert_eq!(
            variants.explicit_pairs(&set),
            vec![
                ("first".to_owned(), "1".to_owned()),
                ("second".to_owned(), "2".to_owned()),
            ]
        );
    }

    #[test]
    fn size_parsing_handles_suffixes() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_size(" 2M ").unwrap(), 2 << 20);
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("-5").is_err());
    }

    #[test]
    fn rlimit_parsing() {
        let limits = parse_rlimit("nofile: 1024 2048; nproc: 64 unlim").unwrap();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].soft, 1024);
        assert_eq!(limits[0].hard, 2048);
        assert_eq!(limits[1].hard, libc::RLIM_INFINITY);

        assert!(parse_rlimit("bogus: 1 2").is_err());
        assert!(parse_rlimit("nofile: 1").is_err());
        assert!(parse_rlimit("").unwrap().is_empty());
    }

    #[test]
    fn bind_parsing() {
        let binds = parse_bind("/src /dst ro; /data /data").unwrap();
        assert_eq!(binds.len(), 2);
        assert!(binds[0].read_only);
        assert!(!binds[1].read_only);

        assert!(parse_bind("/only-one").is_err());
        assert!(parse_bind("/a /b rx").is_err());
    }

    #[test]
    fn net_parsing() {
        assert_eq!(parse_net("host").unwrap(), NetSetup::Host);
        assert_eq!(parse_net("none").unwrap(), NetSetup::None);
        assert!(parse_net("macvlan eth0").is_err());
    }

    #[test]
    fn kind_validation_dispatches() {
        assert!(ValueKind::Bool.validate("true").is_ok());
        assert!(ValueKind::Bool.validate("yes").is_err());
        assert!(ValueKind::Int.validate("-17").is_ok());
        assert!(ValueKind::Uint.validate("1G").is_ok());
        assert!(ValueKind::Uint.validate("one").is_err());
        assert!(ValueKind::RlimitMap.validate("nofile: 1 2").is_ok());
        assert!(ValueKind::NetConfig.validate("bridge").is_err());
    }
}
