//! # corral-protocol
//!
//! Wire protocol for the corral supervisor.
//!
//! Defines the request/response message types exchanged between clients and
//! `corrald` over the local stream socket, plus the length-delimited framing
//! used to carry them. A session is strictly request/response: the client
//! writes one `ContainerRequest` and the daemon writes back one
//! `ContainerResponse`. The exception is the volume create/destroy pair,
//! whose successful completion suppresses the synchronous reply.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::derive_partial_eq_without_eq)]

pub mod error;
pub mod framing;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use framing::{
    read_message, read_message_blocking, write_message, write_message_blocking, MAX_FRAME_LEN,
};
pub use wire::{
    ContainerCreateRequest, ContainerDataListRequest, ContainerDataListResponse,
    ContainerDestroyRequest, ContainerGetDataRequest, ContainerGetDataResponse,
    ContainerGetPropertyRequest, ContainerGetPropertyResponse, ContainerKillRequest,
    ContainerListRequest, ContainerListResponse, ContainerPauseRequest,
    ContainerPropertyListRequest, ContainerPropertyListResponse, ContainerRequest,
    ContainerResponse, ContainerResumeRequest, ContainerSetPropertyRequest, ContainerStartRequest,
    ContainerStopRequest, ErrorCode, ValueListEntry, VersionRequest, VersionResponse,
    VolumeCreateRequest, VolumeDescription, VolumeDestroyRequest, VolumeListRequest,
    VolumeListResponse,
};

/// Default filesystem path of the daemon socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/corrald.sock";
