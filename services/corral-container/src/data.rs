//! Read-only observed container data.
//!
//! Data fields are computed on demand from container and kernel state; they
//! are never written by clients and never persisted. Each descriptor tags
//! the source it is evaluated from, so the container can dispatch without a
//! registry of callbacks.

use corral_net::TcStatKind;

use crate::error::{Error, Result};
use crate::value::flags;

/// Where a data field's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// The lifecycle state string.
    State,
    /// Pid of the payload.
    RootPid,
    /// Raw wait status of the exited payload.
    ExitStatus,
    /// Whether the payload died at the hand of the memory controller.
    OomKilled,
    /// Errno of the last failed start.
    StartErrno,
    /// `memory.usage_in_bytes` of the container's memory cgroup.
    MemoryUsage,
    /// `cpuacct.usage` of the container's cpuacct cgroup.
    CpuUsage,
    /// A per-link counter of the container's HTB class.
    Net(TcStatKind),
}

/// Registry entry for one data field.
#[derive(Debug, Clone)]
pub struct DataDescriptor {
    pub name: &'static str,
    pub desc: &'static str,
    pub flags: u32,
    pub source: DataSource,
}

impl DataDescriptor {
    /// Whether any of `mask` bits is set.
    #[must_use]
    pub fn has_flags(&self, mask: u32) -> bool {
        self.flags & mask != 0
    }
}

/// Insertion-ordered registry of data descriptors.
#[derive(Debug, Default)]
pub struct DataSet {
    entries: Vec<DataDescriptor>,
}

impl DataSet {
    /// Registers a descriptor.
    pub fn register(&mut self, descriptor: DataDescriptor) {
        assert!(
            self.entries.iter().all(|d| d.name != descriptor.name),
            "duplicate data descriptor {}",
            descriptor.name
        );
        self.entries.push(descriptor);
    }

    /// Looks up a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unregistered name.
    pub fn get(&self, name: &str) -> Result<&DataDescriptor> {
        self.entries
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::NotFound(format!("invalid data {name}")))
    }

    /// Descriptors in registration order.
    pub fn all(&self) -> impl Iterator<Item = &DataDescriptor> {
        self.entries.iter()
    }
}

/// Builds the data registry.
#[must_use]
pub fn register_data() -> DataSet {
    let mut set = DataSet::default();

    let mut data = |name, desc, flag_bits, source| {
        set.register(DataDescriptor {
            name,
            desc,
            flags: flag_bits,
            source,
        });
    };

    data("state", "container state", 0, DataSource::State);
    data("root_pid", "pid of the payload process", 0, DataSource::RootPid);
    data("exit_status", "payload exit status", 0, DataSource::ExitStatus);
    data("oom_killed", "whether the payload was killed by oom", 0, DataSource::OomKilled);
    data(
        "start_errno",
        "errno of the last failed start",
        flags::HIDDEN,
        DataSource::StartErrno,
    );
    data("memory_usage", "memory usage in bytes", 0, DataSource::MemoryUsage);
    data("cpu_usage", "consumed cpu time in nanoseconds", 0, DataSource::CpuUsage);
    data(
        "net_bytes",
        "bytes sent per link",
        0,
        DataSource::Net(TcStatKind::Bytes),
    );
    data(
        "net_packets",
        "packets sent per link",
        0,
        DataSource::Net(TcStatKind::Packets),
    );
    data(
        "net_drops",
        "packets dropped per link",
        0,
        DataSource::Net(TcStatKind::Drops),
    );
    data(
        "net_overlimits",
        "over-limit events per link",
        0,
        DataSource::Net(TcStatKind::Overlimits),
    );

    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_and_orders() {
        let data = register_data();
        assert!(data.get("state").is_ok());
        assert!(data.get("net_bytes").is_ok());
        assert!(matches!(data.get("bogus"), Err(Error::NotFound(_))));

        let first = data.all().next().unwrap();
        assert_eq!(first.name, "state");
    }

    #[test]
    fn start_errno_is_hidden() {
        let data = register_data();
        assert!(data.get("start_errno").unwrap().has_flags(flags::HIDDEN));
        assert!(!data.get("state").unwrap().has_flags(flags::HIDDEN));
    }
}
