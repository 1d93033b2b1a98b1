//! HTB shaping entities.
//!
//! Three entity types project a container's traffic contract onto every
//! configured link: the root [`Qdisc`], the per-container [`TcClass`] tree
//! under it, and the [`CgroupFilter`] that steers packets into classes by
//! the sender's `net_cls` classid. All operations are idempotent over the
//! link set, and every one of them is a successful no-op while network
//! support is globally disabled.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{NetError, Result};
use crate::netlink::{tc_handle, NetlinkHandle};

/// Priority used for the cgroup filter on every link.
const FILTER_PRIO: u16 = 10;

/// A resolved network link.
#[derive(Debug, Clone)]
pub struct Link {
    name: String,
    ifindex: u32,
}

impl Link {
    /// Link name, e.g. `"eth0"`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-class counter selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcStatKind {
    Bytes,
    Packets,
    Drops,
    Overlimits,
}

/// Shared traffic-control state: the enabled flag, the link set and the
/// netlink socket.
pub struct NetContext {
    links: Vec<Link>,
    nl: Option<NetlinkHandle>,
}

impl NetContext {
    /// A context with network support switched off; every shaping
    /// operation no-ops.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            links: Vec::new(),
            nl: None,
        }
    }

    /// Resolves `link_names` and opens the netlink socket.
    ///
    /// # Errors
    ///
    /// Returns an error if a link does not exist or the socket cannot be
    /// opened.
    pub fn new(link_names: &[String]) -> Result<Self> {
        let mut links = Vec::with_capacity(link_names.len());
        for name in link_names {
            links.push(Link {
                name: name.clone(),
                ifindex: NetlinkHandle::ifindex(name)?,
            });
        }
        Ok(Self {
            links,
            nl: Some(NetlinkHandle::new()?),
        })
    }

    /// Whether shaping is active.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.nl.is_some()
    }

    /// The resolved link set.
    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    fn handle(&mut self) -> Result<&mut NetlinkHandle> {
        self.nl.as_mut().ok_or(NetError::Disabled)
    }
}

/// The root HTB qdisc, one per link.
#[derive(Debug)]
pub struct Qdisc {
    handle: u32,
    default_minor: u32,
}

impl Qdisc {
    /// Builds the root qdisc descriptor with handle `major:0` and default
    /// class `major:default_minor`.
    #[must_use]
    pub fn new(major: u16, default_minor: u16) -> Self {
        Self {
            handle: tc_handle(major, 0),
            default_minor: u32::from(default_minor),
        }
    }

    /// The qdisc handle (`major:0`).
    #[must_use]
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Installs the qdisc on every link.
    pub fn create(&self, net: &mut NetContext) -> Result<()> {
        if !net.enabled() {
            return Ok(());
        }
        for i in 0..net.links.len() {
            let ifindex = net.links[i].ifindex;
            debug!(link = %net.links[i].name, handle = self.handle, "install htb qdisc");
            net.handle()?.qdisc_add(ifindex, self.handle, self.default_minor)?;
        }
        Ok(())
    }

    /// Removes the qdisc (and with it the whole class tree) from every link.
    pub fn remove(&self, net: &mut NetContext) -> Result<()> {
        if !net.enabled() {
            return Ok(());
        }
        for i in 0..net.links.len() {
            let ifindex = net.links[i].ifindex;
            net.handle()?.qdisc_del(ifindex, self.handle)?;
        }
        Ok(())
    }
}

/// An HTB class. Its parent is either the root qdisc or another class; the
/// parent handle resolution prefers the qdisc.
#[derive(Debug)]
pub struct TcClass {
    parent_qdisc: Option<Arc<Qdisc>>,
    parent_class: Option<Arc<TcClass>>,
    handle: u32,
}

impl TcClass {
    /// A class attached directly under the root qdisc.
    #[must_use]
    pub fn under_qdisc(qdisc: Arc<Qdisc>, handle: u32) -> Self {
        Self {
            parent_qdisc: Some(qdisc),
            parent_class: None,
            handle,
        }
    }

    /// A class nested under another class.
    #[must_use]
    pub fn under_class(parent: Arc<TcClass>, handle: u32) -> Self {
        Self {
            parent_qdisc: None,
            parent_class: Some(parent),
            handle,
        }
    }

    /// The class handle.
    #[must_use]
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// The parent handle: the qdisc's if one is set, the parent class's
    /// otherwise.
    #[must_use]
    pub fn parent_handle(&self) -> u32 {
        if let Some(qdisc) = &self.parent_qdisc {
            qdisc.handle()
        } else {
            self.parent_class
                .as_ref()
                .map(|class| class.handle)
                .unwrap_or_default()
        }
    }

    /// Installs the class on every link.
    pub fn create(&self, net: &mut NetContext, prio: u32, rate: u32, ceil: u32) -> Result<()> {
        if !net.enabled() {
            return Ok(());
        }
        let parent = self.parent_handle();
        for i in 0..net.links.len() {
            let ifindex = net.links[i].ifindex;
            debug!(link = %net.links[i].name, handle = self.handle, prio, rate, ceil, "install htb class");
            net.handle()?.class_add(ifindex, parent, self.handle, prio, rate, ceil)?;
        }
        Ok(())
    }

    /// Whether the class exists on `link`.
    pub fn exists(&self, net: &mut NetContext, link_index: usize) -> Result<bool> {
        if !net.enabled() {
            return Ok(false);
        }
        let ifindex = net.links[link_index].ifindex;
        let handle = self.handle;
        net.handle()?.class_exists(ifindex, handle)
    }

    /// Removes the class. The first link found without it ends the whole
    /// removal as a success, so repeated teardown is safe.
    pub fn remove(&self, net: &mut NetContext) -> Result<()> {
        if !net.enabled() {
            return Ok(());
        }
        let parent = self.parent_handle();
        for i in 0..net.links.len() {
            if !self.exists(net, i)? {
                return Ok(());
            }
            let ifindex = net.links[i].ifindex;
            net.handle()?.class_del(ifindex, parent, self.handle)?;
        }
        Ok(())
    }

    /// Reads one counter per link, keyed by link name.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Disabled`] while network support is off; a
    /// counter read has no meaningful no-op.
    pub fn stat(&self, net: &mut NetContext, kind: TcStatKind) -> Result<HashMap<String, u64>> {
        if !net.enabled() {
            return Err(NetError::Disabled);
        }

        let mut map = HashMap::new();
        for i in 0..net.links.len() {
            let ifindex = net.links[i].ifindex;
            let name = net.links[i].name.clone();
            let stats = net.handle()?.class_stats(ifindex, self.handle)?;
            let value = match kind {
                TcStatKind::Bytes => stats.bytes,
                TcStatKind::Packets => u64::from(stats.packets),
                TcStatKind::Drops => u64::from(stats.drops),
                TcStatKind::Overlimits => u64::from(stats.overlimits),
            };
            map.insert(name, value);
        }
        Ok(map)
    }
}

/// The cgroup-classid filter hanging off the root qdisc.
#[derive(Debug)]
pub struct CgroupFilter {
    parent: Arc<Qdisc>,
    handle: u32,
}

impl CgroupFilter {
    /// A filter attached under `parent` with the conventional handle 1.
    #[must_use]
    pub fn new(parent: Arc<Qdisc>) -> Self {
        Self { parent, handle: 1 }
    }

    /// Installs the filter on every link.
    pub fn create(&self, net: &mut NetContext) -> Result<()> {
        if !net.enabled() {
            return Ok(());
        }
        let parent = self.parent.handle();
        for i in 0..net.links.len() {
            let ifindex = net.links[i].ifindex;
            debug!(link = %net.links[i].name, "install cgroup filter");
            net.handle()?.filter_add(ifindex, parent, self.handle, FILTER_PRIO)?;
        }
        Ok(())
    }

    /// Whether the filter exists on `link`.
    pub fn exists(&self, net: &mut NetContext, link_index: usize) -> Result<bool> {
        if !net.enabled() {
            return Ok(false);
        }
        let ifindex = net.links[link_index].ifindex;
        let parent = self.parent.handle();
        net.handle()?.filter_exists(ifindex, parent)
    }

    /// Removes the filter. The first link found without it ends the whole
    /// removal as a success, so repeated teardown is safe.
    pub fn remove(&self, net: &mut NetContext) -> Result<()> {
        if !net.enabled() {
            return Ok(());
        }
        let parent = self.parent.handle();
        for i in 0..net.links.len() {
            if !self.exists(net, i)? {
                return Ok(());
            }
            let ifindex = net.links[i].ifindex;
            net.handle()?.filter_del(ifindex, parent, self.handle, FILTER_PRIO)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_resolution_prefers_the_qdisc() {
        let qdisc = Arc::new(Qdisc::new(1, 2));
        let class = TcClass::under_qdisc(Arc::clone(&qdisc), tc_handle(1, 3));
        assert_eq!(class.parent_handle(), qdisc.handle());

        let nested = TcClass::under_class(Arc::new(class), tc_handle(1, 4));
        assert_eq!(nested.parent_handle(), tc_handle(1, 3));
    }

    #[test]
    fn disabled_context_noops_everything() {
        let mut net = NetContext::disabled();
        assert!(!net.enabled());

        let qdisc = Arc::new(Qdisc::new(1, 2));
        qdisc.create(&mut net).unwrap();
        qdisc.remove(&mut net).unwrap();

        let class = TcClass::under_qdisc(Arc::clone(&qdisc), tc_handle(1, 3));
        class.create(&mut net, 3, 125_000, 0).unwrap();
        class.remove(&mut net).unwrap();
        class.remove(&mut net).unwrap();

        let filter = CgroupFilter::new(Arc::clone(&qdisc));
        filter.create(&mut net).unwrap();
        filter.remove(&mut net).unwrap();
    }

    #[test]
    fn disabled_stat_is_an_error() {
        let mut net = NetContext::disabled();
        let qdisc = Arc::new(Qdisc::new(1, 2));
        let class = TcClass::under_qdisc(qdisc, tc_handle(1, 3));
        assert!(matches!(
            class.stat(&mut net, TcStatKind::Bytes),
            Err(NetError::Disabled)
        ));
    }

    #[test]
    fn context_rejects_unknown_links() {
        let links = vec!["corral-no-such-link".to_owned()];
        assert!(matches!(
            NetContext::new(&links),
            Err(NetError::LinkNotFound(_))
        ));
    }

    // Exercises the real netlink path; requires CAP_NET_ADMIN so it is
    // skipped for ordinary users.
    #[test]
    fn qdisc_roundtrip_on_loopback_as_root() {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("skipping: requires root privileges");
            return;
        }

        let mut net = NetContext::new(&["lo".to_owned()]).unwrap();
        let qdisc = Arc::new(Qdisc::new(0x7fff, 2));
        qdisc.create(&mut net).unwrap();

        let class = TcClass::under_qdisc(Arc::clone(&qdisc), tc_handle(0x7fff, 3));
        class.create(&mut net, 3, 125_000, 250_000).unwrap();
        assert!(class.exists(&mut net, 0).unwrap());

        let stats = class.stat(&mut net, TcStatKind::Bytes).unwrap();
        assert!(stats.contains_key("lo"));

        class.remove(&mut net).unwrap();
        class.remove(&mut net).unwrap();
        assert!(!class.exists(&mut net, 0).unwrap());

        qdisc.remove(&mut net).unwrap();
    }
}
