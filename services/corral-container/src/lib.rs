//! # corral-container
//!
//! The container model and lifecycle engine of the corral supervisor.
//!
//! This crate owns the hierarchical container registry, the property/data
//! value system with parent inheritance, the lifecycle state machine
//! (including freeze/thaw), the cgroup and traffic-control projections, and
//! the persistent-state reconciliation that rehydrates the fleet at boot.
//! The RPC surface lives in the daemon; everything here is plain method
//! calls over the [`ContainerHolder`].

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::option_if_let_else)]

pub mod container;
pub mod data;
pub mod env;
pub mod error;
pub mod holder;
pub mod launcher;
pub mod property;
pub mod state;
pub mod value;
pub mod volume;

pub use container::{Container, StartSpec};
pub use data::{register_data, DataDescriptor, DataSet, DataSource};
pub use env::Env;
pub use error::{Error, Result};
pub use holder::{parent_name, ContainerHolder};
pub use launcher::{PayloadLauncher, PayloadSpec, ProcessLauncher};
pub use property::{register_properties, PropertyHolder, PropertySet};
pub use state::{ContainerState, Cred};
pub use value::{
    flags, BindMapping, NetSetup, PropertyHook, RlimitSpec, ValueDescriptor, ValueKind, ValueSet,
    VariantSet,
};
pub use volume::{Volume, VolumeHolder};
