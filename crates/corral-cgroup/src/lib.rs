//! # corral-cgroup
//!
//! Cgroup-v1 projection for the corral supervisor.
//!
//! A [`Cgroup`] is a plain (subsystem, relative path) handle; a
//! [`Subsystem`] adapter carries the behaviour that differs between
//! hierarchies (memory hierarchy mode, freezer state waits, usage
//! counters). The mount root is explicit everywhere so the whole crate can
//! be exercised against a scratch directory.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_const_for_fn)]

pub mod cgroup;
pub mod error;
pub mod subsystem;

pub use cgroup::Cgroup;
pub use error::{CgroupError, Result};
pub use subsystem::{
    FreezerWait, Subsystem, SubsystemKind, SubsystemRegistry, FREEZER_FROZEN, FREEZER_THAWED,
};
