//! Netlink socket operations for kernel traffic control.
//!
//! This module provides a low-level interface to the rtnetlink tc subsystem
//! for installing and removing HTB qdiscs, HTB classes and cgroup-classid
//! filters, and for reading per-class counters.
//!
//! Messages are built by hand over a raw `AF_NETLINK` socket; the only
//! abstractions are the attribute helpers at the bottom of the file.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use crate::error::{NetError, Result};

// Netlink protocol
const NETLINK_ROUTE: i32 = 0;

// Netlink message types
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const RTM_NEWQDISC: u16 = 36;
const RTM_DELQDISC: u16 = 37;
const RTM_NEWTCLASS: u16 = 40;
const RTM_DELTCLASS: u16 = 41;
const RTM_GETTCLASS: u16 = 42;
const RTM_NEWTFILTER: u16 = 44;
const RTM_DELTFILTER: u16 = 45;
const RTM_GETTFILTER: u16 = 46;

// Netlink flags
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;
const NLM_F_DUMP: u16 = 0x0100 | 0x0200;

// tc attribute types
const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;
const TCA_STATS: u16 = 3;

// HTB option attributes (nested under TCA_OPTIONS)
const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;
const TCA_HTB_CTAB: u16 = 3;
const TCA_HTB_RTAB: u16 = 4;

const TC_H_ROOT: u32 = 0xffff_ffff;
const ETH_P_ALL: u16 = 0x0003;

/// Size of the rate translation tables HTB expects alongside each class.
const RTAB_CELLS: usize = 256;

/// Assumed MTU for burst buffer sizing.
const RATE_MTU: u32 = 1600;

/// Scheduler tick assumption used when `/proc/net/psched` is unreadable.
const FALLBACK_HZ: u32 = 100;

/// Composes a tc handle from its major and minor numbers.
#[must_use]
pub const fn tc_handle(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

/// Netlink message header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

/// Traffic-control message body.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TcMsg {
    tcm_family: u8,
    _pad1: u8,
    _pad2: u16,
    tcm_ifindex: i32,
    tcm_handle: u32,
    tcm_parent: u32,
    tcm_info: u32,
}

/// Netlink attribute header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlAttr {
    nla_len: u16,
    nla_type: u16,
}

/// `struct tc_ratespec` from the kernel uapi.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct TcRatespec {
    cell_log: u8,
    linklayer: u8,
    overhead: u16,
    cell_align: i16,
    mpu: u16,
    rate: u32,
}

/// `struct tc_htb_opt` from the kernel uapi.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct TcHtbOpt {
    rate: TcRatespec,
    ceil: TcRatespec,
    buffer: u32,
    cbuffer: u32,
    quantum: u32,
    level: u32,
    prio: u32,
}

/// `struct tc_htb_glob` from the kernel uapi.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TcHtbGlob {
    version: u32,
    rate2quantum: u32,
    magic: u32,
    defcls: u32,
    debug: u32,
    direct_pkts: u32,
}

/// `struct tc_stats` from the kernel uapi.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TcStats {
    pub bytes: u64,
    pub packets: u32,
    pub drops: u32,
    pub overlimits: u32,
    pub bps: u32,
    pub pps: u32,
    pub qlen: u32,
    pub backlog: u32,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

/// Netlink socket handle for traffic-control configuration.
pub struct NetlinkHandle {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    /// Creates and binds a new rtnetlink socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(NetError::Netlink(format!(
                "failed to create netlink socket: {}",
                io::Error::last_os_error()
            )));
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0;
        addr.nl_groups = 0;
        let ret = unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetError::Netlink(format!(
                "failed to bind netlink socket: {err}"
            )));
        }

        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd, seq: 0 })
    }

    /// Resolves a link name to its interface index.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::LinkNotFound`] if no such interface exists.
    pub fn ifindex(name: &str) -> Result<u32> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|_| NetError::LinkNotFound(name.to_owned()))?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(NetError::LinkNotFound(name.to_owned()));
        }
        Ok(ifindex)
    }

    /// Installs the root HTB qdisc on `ifindex`.
    pub fn qdisc_add(&mut self, ifindex: u32, handle: u32, default_minor: u32) -> Result<()> {
        let mut msg = self.tc_header(
            RTM_NEWQDISC,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            ifindex,
            handle,
            TC_H_ROOT,
            0,
        );

        add_attr_str(&mut msg, TCA_KIND, "htb");

        let glob = TcHtbGlob {
            version: 3,
            rate2quantum: 10,
            magic: 0,
            defcls: default_minor,
            debug: 0,
            direct_pkts: 0,
        };
        let options = nested_start(&mut msg, TCA_OPTIONS);
        add_attr_bytes(&mut msg, TCA_HTB_INIT, as_bytes(&glob));
        nested_end(&mut msg, options);

        finish_header(&mut msg);
        self.send_and_ack(&msg)
    }

    /// Removes the root HTB qdisc from `ifindex`.
    ///
    /// A missing qdisc is not an error; repeated teardown must stay safe.
    pub fn qdisc_del(&mut self, ifindex: u32, handle: u32) -> Result<()> {
        let mut msg = self.tc_header(RTM_DELQDISC, NLM_F_REQUEST | NLM_F_ACK, ifindex, handle, TC_H_ROOT, 0);
        finish_header(&mut msg);
        match self.send_and_ack(&msg) {
            Err(NetError::Netlink(ref m)) if m.contains("ENOENT") || m.contains("EINVAL") => Ok(()),
            other => other,
        }
    }

    /// Installs an HTB class.
    ///
    /// `rate` and `ceil` are in bytes per second; a zero `ceil` borrows the
    /// rate.
    pub fn class_add(
        &mut self,
        ifindex: u32,
        parent: u32,
        handle: u32,
        prio: u32,
        rate: u32,
        ceil: u32,
    ) -> Result<()> {
        let rate = rate.max(1);
        let ceil = if ceil == 0 { rate } else { ceil };

        let tick = tick_in_usec();
        let (rate_spec, rtab) = rate_table(rate, tick);
        let (ceil_spec, ctab) = rate_table(ceil, tick);

        let burst = RATE_MTU + rate / FALLBACK_HZ;
        let cburst = RATE_MTU + ceil / FALLBACK_HZ;

        let opt = TcHtbOpt {
            rate: rate_spec,
            ceil: ceil_spec,
            buffer: xmit_ticks(rate, burst, tick),
            cbuffer: xmit_ticks(ceil, cburst, tick),
            quantum: 0,
            level: 0,
            prio,
        };

        let mut msg = self.tc_header(
            RTM_NEWTCLASS,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE,
            ifindex,
            handle,
            parent,
            0,
        );

        add_attr_str(&mut msg, TCA_KIND, "htb");

        let options = nested_start(&mut msg, TCA_OPTIONS);
        add_attr_bytes(&mut msg, TCA_HTB_PARMS, as_bytes(&opt));
        add_attr_bytes(&mut msg, TCA_HTB_RTAB, table_bytes(&rtab));
        add_attr_bytes(&mut msg, TCA_HTB_CTAB, table_bytes(&ctab));
        nested_end(&mut msg, options);

        finish_header(&mut msg);
        self.send_and_ack(&msg)
    }

    /// Removes an HTB class.
    pub fn class_del(&mut self, ifindex: u32, parent: u32, handle: u32) -> Result<()> {
        let mut msg = self.tc_header(RTM_DELTCLASS, NLM_F_REQUEST | NLM_F_ACK, ifindex, handle, parent, 0);
        finish_header(&mut msg);
        self.send_and_ack(&msg)
    }

    /// Returns whether a class with `handle` exists on `ifindex`.
    pub fn class_exists(&mut self, ifindex: u32, handle: u32) -> Result<bool> {
        Ok(self.class_dump(ifindex)?.iter().any(|(h, _)| *h == handle))
    }

    /// Reads the counters of the class with `handle` on `ifindex`.
    ///
    /// # Errors
    ///
    /// Returns an error if the class does not exist.
    pub fn class_stats(&mut self, ifindex: u32, handle: u32) -> Result<TcStats> {
        self.class_dump(ifindex)?
            .into_iter()
            .find_map(|(h, stats)| (h == handle).then_some(stats))
            .ok_or_else(|| NetError::Netlink(format!("class {handle:#x} not found")))
    }

    /// Attaches a cgroup-classid filter under `parent`.
    pub fn filter_add(&mut self, ifindex: u32, parent: u32, handle: u32, prio: u16) -> Result<()> {
        let info = filter_info(prio);
        let mut msg = self.tc_header(
            RTM_NEWTFILTER,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE,
            ifindex,
            handle,
            parent,
            info,
        );
        add_attr_str(&mut msg, TCA_KIND, "cgroup");
        let options = nested_start(&mut msg, TCA_OPTIONS);
        nested_end(&mut msg, options);
        finish_header(&mut msg);
        self.send_and_ack(&msg)
    }

    /// Removes the cgroup filter under `parent`.
    pub fn filter_del(&mut self, ifindex: u32, parent: u32, handle: u32, prio: u16) -> Result<()> {
        let info = filter_info(prio);
        let mut msg = self.tc_header(RTM_DELTFILTER, NLM_F_REQUEST | NLM_F_ACK, ifindex, handle, parent, info);
        finish_header(&mut msg);
        self.send_and_ack(&msg)
    }

    /// Returns whether a cgroup filter exists under `parent`.
    pub fn filter_exists(&mut self, ifindex: u32, parent: u32) -> Result<bool> {
        let mut msg = self.tc_header(RTM_GETTFILTER, NLM_F_REQUEST | NLM_F_DUMP, ifindex, 0, parent, 0);
        finish_header(&mut msg);

        let replies = self.request_dump(&msg)?;
        for payload in replies {
            if let Some(kind) = parse_kind(&payload) {
                if kind == "cgroup" {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn class_dump(&mut self, ifindex: u32) -> Result<Vec<(u32, TcStats)>> {
        let mut msg = self.tc_header(RTM_GETTCLASS, NLM_F_REQUEST | NLM_F_DUMP, ifindex, 0, 0, 0);
        finish_header(&mut msg);

        let mut classes = Vec::new();
        for payload in self.request_dump(&msg)? {
            if payload.len() < mem::size_of::<TcMsg>() {
                continue;
            }
            let tcm = unsafe { payload.as_ptr().cast::<TcMsg>().read_unaligned() };
            let stats = parse_stats(&payload).unwrap_or_default();
            classes.push((tcm.tcm_handle, stats));
        }
        Ok(classes)
    }

    fn tc_header(
        &mut self,
        msg_type: u16,
        flags: u16,
        ifindex: u32,
        handle: u32,
        parent: u32,
        info: u32,
    ) -> Vec<u8> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(4096);

        let hdr = NlMsgHdr {
            nlmsg_len: 0, // fixed up by finish_header
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        msg.extend_from_slice(as_bytes(&hdr));

        let tcm = TcMsg {
            tcm_family: libc::AF_UNSPEC as u8,
            _pad1: 0,
            _pad2: 0,
            tcm_ifindex: ifindex as i32,
            tcm_handle: handle,
            tcm_parent: parent,
            tcm_info: info,
        };
        msg.extend_from_slice(as_bytes(&tcm));
        msg
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&self, msg: &[u8]) -> Result<()> {
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr().cast::<libc::c_void>(),
                msg.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(NetError::Netlink(format!(
                "failed to send netlink message: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(NetError::Netlink(format!(
                "failed to receive netlink response: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(len as usize)
    }

    /// Sends a message and waits for the kernel acknowledgement.
    fn send_and_ack(&mut self, msg: &[u8]) -> Result<()> {
        self.send(msg)?;

        let mut buf = [0u8; 8192];
        let len = self.recv(&mut buf)?;

        for (msg_type, payload) in iterate_messages(&buf[..len]) {
            if msg_type == NLMSG_ERROR {
                return check_nlmsg_error(payload);
            }
        }
        Ok(())
    }

    /// Sends a dump request and collects every reply payload.
    fn request_dump(&mut self, msg: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.send(msg)?;

        let mut replies = Vec::new();
        let mut buf = vec![0u8; 65536];
        loop {
            let len = self.recv(&mut buf)?;
            let mut done = false;
            for (msg_type, payload) in iterate_messages(&buf[..len]) {
                match msg_type {
                    NLMSG_DONE => done = true,
                    NLMSG_ERROR => check_nlmsg_error(payload)?,
                    _ => replies.push(payload.to_vec()),
                }
            }
            if done {
                return Ok(replies);
            }
        }
    }
}

fn filter_info(prio: u16) -> u32 {
    (u32::from(prio) << 16) | u32::from(ETH_P_ALL.to_be())
}

/// Splits a receive buffer into `(type, payload)` netlink messages.
fn iterate_messages(buf: &[u8]) -> Vec<(u16, &[u8])> {
    let mut messages = Vec::new();
    let mut offset = 0usize;
    let hdr_len = mem::size_of::<NlMsgHdr>();

    while offset + hdr_len <= buf.len() {
        let hdr = unsafe { buf[offset..].as_ptr().cast::<NlMsgHdr>().read_unaligned() };
        let msg_len = hdr.nlmsg_len as usize;
        if msg_len < hdr_len || offset + msg_len > buf.len() {
            break;
        }
        messages.push((hdr.nlmsg_type, &buf[offset + hdr_len..offset + msg_len]));
        offset += (msg_len + 3) & !3;
    }
    messages
}

fn check_nlmsg_error(payload: &[u8]) -> Result<()> {
    if payload.len() < 4 {
        return Err(NetError::Netlink("truncated error message".into()));
    }
    let code = i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if code == 0 {
        return Ok(());
    }
    let err = io::Error::from_raw_os_error(-code);
    let name = match -code {
        libc::ENOENT => "ENOENT",
        libc::EEXIST => "EEXIST",
        libc::EINVAL => "EINVAL",
        libc::EPERM => "EPERM",
        _ => "errno",
    };
    Err(NetError::Netlink(format!("{name}: {err}")))
}

/// Extracts the `TCA_KIND` string from a tc reply payload.
fn parse_kind(payload: &[u8]) -> Option<String> {
    attribute(payload, TCA_KIND).map(|bytes| {
        String::from_utf8_lossy(bytes.split(|b| *b == 0).next().unwrap_or_default()).into_owned()
    })
}

/// Extracts the legacy `tc_stats` block from a tc reply payload.
fn parse_stats(payload: &[u8]) -> Option<TcStats> {
    let bytes = attribute(payload, TCA_STATS)?;
    if bytes.len() < mem::size_of::<TcStats>() {
        return None;
    }
    Some(unsafe { bytes.as_ptr().cast::<TcStats>().read_unaligned() })
}

/// Finds a top-level attribute in a tc reply payload.
fn attribute(payload: &[u8], wanted: u16) -> Option<&[u8]> {
    let attr_hdr = mem::size_of::<NlAttr>();
    let mut offset = mem::size_of::<TcMsg>();

    while offset + attr_hdr <= payload.len() {
        let attr = unsafe { payload[offset..].as_ptr().cast::<NlAttr>().read_unaligned() };
        let attr_len = attr.nla_len as usize;
        if attr_len < attr_hdr || offset + attr_len > payload.len() {
            return None;
        }
        if attr.nla_type & 0x3fff == wanted {
            return Some(&payload[offset + attr_hdr..offset + attr_len]);
        }
        offset += (attr_len + 3) & !3;
    }
    None
}

fn finish_header(msg: &mut [u8]) {
    let len = msg.len() as u32;
    msg[0..4].copy_from_slice(&len.to_ne_bytes());
}

fn add_attr_bytes(msg: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let attr_len = mem::size_of::<NlAttr>() + value.len();
    let attr = NlAttr {
        nla_len: attr_len as u16,
        nla_type: attr_type,
    };
    msg.extend_from_slice(as_bytes(&attr));
    msg.extend_from_slice(value);

    let padding = ((attr_len + 3) & !3) - attr_len;
    msg.extend(std::iter::repeat(0).take(padding));
}

fn add_attr_str(msg: &mut Vec<u8>, attr_type: u16, value: &str) {
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    add_attr_bytes(msg, attr_type, &bytes);
}

/// Opens a nested attribute; returns the offset to fix up in
/// [`nested_end`].
fn nested_start(msg: &mut Vec<u8>, attr_type: u16) -> usize {
    let start = msg.len();
    let attr = NlAttr {
        nla_len: 0,
        nla_type: attr_type | 0x8000, // NLA_F_NESTED
    };
    msg.extend_from_slice(as_bytes(&attr));
    start
}

fn nested_end(msg: &mut [u8], start: usize) {
    let len = (msg.len() - start) as u16;
    msg[start..start + 2].copy_from_slice(&len.to_ne_bytes());
}

/// Reads the scheduler clock ratio from `/proc/net/psched`.
///
/// Falls back to a 1:1 tick when the file is unreadable (tests, non-Linux
/// build hosts).
fn tick_in_usec() -> f64 {
    tick_in_usec_from(Path::new("/proc/net/psched"))
}

fn tick_in_usec_from(path: &Path) -> f64 {
    let Ok(content) = std::fs::read_to_string(path) else {
        return 1.0;
    };
    let mut words = content.split_whitespace();
    let (Some(t2us), Some(us2t), Some(clock_res)) = (
        words.next().and_then(|w| u32::from_str_radix(w, 16).ok()),
        words.next().and_then(|w| u32::from_str_radix(w, 16).ok()),
        words.next().and_then(|w| u32::from_str_radix(w, 16).ok()),
    ) else {
        return 1.0;
    };
    if us2t == 0 {
        return 1.0;
    }
    let clock_factor = f64::from(clock_res) / 1_000_000.0;
    f64::from(t2us) / f64::from(us2t) * clock_factor
}

/// Ticks needed to transmit `size` bytes at `rate` bytes per second.
fn xmit_ticks(rate: u32, size: u32, tick: f64) -> u32 {
    let usec = 1_000_000.0 * f64::from(size) / f64::from(rate.max(1));
    (usec * tick).min(f64::from(u32::MAX)) as u32
}

/// Builds the rate spec and the 256-cell transmission-time table HTB
/// requires for a rate.
fn rate_table(rate: u32, tick: f64) -> (TcRatespec, [u32; RTAB_CELLS]) {
    // Pick the smallest cell size that still covers the MTU in 256 cells.
    let mut cell_log = 0u8;
    while (RATE_MTU >> cell_log) >= RTAB_CELLS as u32 {
        cell_log += 1;
    }

    let mut table = [0u32; RTAB_CELLS];
    for (i, cell) in table.iter_mut().enumerate() {
        let size = ((i + 1) << cell_log) as u32;
        *cell = xmit_ticks(rate, size, tick);
    }

    let spec = TcRatespec {
        cell_log,
        linklayer: 1, // TC_LINKLAYER_ETHERNET
        overhead: 0,
        cell_align: -1,
        mpu: 0,
        rate,
    };
    (spec, table)
}

fn table_bytes(table: &[u32; RTAB_CELLS]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(table.as_ptr().cast::<u8>(), RTAB_CELLS * mem::size_of::<u32>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tc_handle_packs_major_minor() {
        assert_eq!(tc_handle(1, 0), 0x0001_0000);
        assert_eq!(tc_handle(1, 2), 0x0001_0002);
        assert_eq!(tc_handle(0xffff, 0xffff), 0xffff_ffff);
    }

    #[test]
    fn rate_table_is_monotonic_and_covers_mtu() {
        let (spec, table) = rate_table(125_000, 1.0);
        // Cell size must keep the MTU within the table.
        assert!((RATE_MTU >> spec.cell_log) < RTAB_CELLS as u32);
        assert_eq!(spec.rate, 125_000);

        for window in table.windows(2) {
            assert!(window[0] <= window[1]);
        }
        assert!(table[0] > 0);
    }

    #[test]
    fn xmit_ticks_scales_with_size_and_rate() {
        let slow = xmit_ticks(1000, 1000, 1.0);
        let fast = xmit_ticks(1_000_000, 1000, 1.0);
        assert!(slow > fast);
        assert_eq!(xmit_ticks(1000, 1000, 1.0), 1_000_000);
    }

    #[test]
    fn psched_parse_falls_back_on_garbage() {
        let dir = std::env::temp_dir().join("corral-net-psched-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("psched");

        std::fs::write(&path, "not hex at all\n").unwrap();
        assert!((tick_in_usec_from(&path) - 1.0).abs() < f64::EPSILON);

        // Modern kernel shape: 1ns clock, 1:1 tick ratio.
        std::fs::write(&path, "000003e8 00000040 000f4240 3b9aca00\n").unwrap();
        let tick = tick_in_usec_from(&path);
        assert!(tick > 0.0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn iterate_messages_walks_aligned_frames() {
        let mut buf = Vec::new();
        let hdr = NlMsgHdr {
            nlmsg_len: (mem::size_of::<NlMsgHdr>() + 2) as u32,
            nlmsg_type: NLMSG_DONE,
            nlmsg_flags: 0,
            nlmsg_seq: 1,
            nlmsg_pid: 0,
        };
        buf.extend_from_slice(as_bytes(&hdr));
        buf.extend_from_slice(&[0xaa, 0xbb]);
        buf.extend_from_slice(&[0, 0]); // alignment padding

        let hdr2 = NlMsgHdr {
            nlmsg_len: mem::size_of::<NlMsgHdr>() as u32,
            nlmsg_type: NLMSG_ERROR,
            nlmsg_flags: 0,
            nlmsg_seq: 2,
            nlmsg_pid: 0,
        };
        buf.extend_from_slice(as_bytes(&hdr2));

        let messages = iterate_messages(&buf);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, NLMSG_DONE);
        assert_eq!(messages[0].1, &[0xaa, 0xbb]);
        assert_eq!(messages[1].0, NLMSG_ERROR);
    }

    #[test]
    fn nlmsg_error_ack_and_failure() {
        let ok = 0i32.to_ne_bytes();
        assert!(check_nlmsg_error(&ok).is_ok());

        let enoent = (-libc::ENOENT).to_ne_bytes();
        let err = check_nlmsg_error(&enoent).unwrap_err();
        assert!(err.to_string().contains("ENOENT"));
    }

    #[test]
    fn netlink_socket_opens_unprivileged() {
        // Opening and binding an rtnetlink socket needs no capability;
        // only mutations do.
        let handle = NetlinkHandle::new();
        assert!(handle.is_ok());
    }

    #[test]
    fn loopback_resolves() {
        assert!(NetlinkHandle::ifindex("lo").unwrap() > 0);
        assert!(matches!(
            NetlinkHandle::ifindex("corral-no-such-link"),
            Err(NetError::LinkNotFound(_))
        ));
    }
}
