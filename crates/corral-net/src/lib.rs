//! # corral-net
//!
//! Kernel traffic-control projection for the corral supervisor.
//!
//! The daemon installs one HTB qdisc per configured link with a cgroup
//! filter under it; every container gets an HTB class whose handle doubles
//! as the `net_cls` classid of the container's processes. When network
//! support is disabled in the configuration, the whole crate degrades to
//! successful no-ops.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod error;
pub mod netlink;
pub mod shaper;

pub use error::{NetError, Result};
pub use netlink::{tc_handle, NetlinkHandle, TcStats};
pub use shaper::{CgroupFilter, Link, NetContext, Qdisc, TcClass, TcStatKind};
