//! Wire message types.
//!
//! These structs are the canonical schema of the client/daemon protocol.
//! They are hand-maintained prost messages rather than build-time codegen so
//! the crate carries no protoc dependency; field tags are frozen and must
//! never be reused for a different meaning.
//!
//! A request is a `ContainerRequest` with exactly one variant field set.
//! Every response is a `ContainerResponse` carrying the error pair plus at
//! most one typed payload.

/// Result of an operation as reported on the wire.
///
/// This is a closed enumeration; new kinds append at the end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    Unknown = 1,
    InvalidMethod = 2,
    InvalidValue = 3,
    InvalidState = 4,
    ContainerDoesNotExist = 5,
    ContainerAlreadyExists = 6,
    PermissionDenied = 7,
    NotFound = 8,
    Busy = 9,
    Storage = 10,
    Corrupted = 11,
    FreezerTimeout = 12,
    VolumeDoesNotExist = 13,
}

impl ErrorCode {
    /// Converts a raw wire value, mapping anything unrecognised to `Unknown`.
    #[must_use]
    pub fn from_wire(value: i32) -> Self {
        Self::try_from(value).unwrap_or(Self::Unknown)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerCreateRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerDestroyRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerListRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerGetPropertyRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub property: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerSetPropertyRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub property: String,
    #[prost(string, tag = "3")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerGetDataRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub data: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerStartRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerStopRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerPauseRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerResumeRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerPropertyListRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerDataListRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerKillRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub sig: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VersionRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeCreateRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub source: String,
    #[prost(string, tag = "3")]
    pub quota: String,
    #[prost(string, tag = "4")]
    pub flags: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeDestroyRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeListRequest {}

/// Request envelope.
///
/// A well-formed request populates exactly one field; the dispatcher rejects
/// anything else with [`ErrorCode::InvalidMethod`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerRequest {
    #[prost(message, optional, tag = "1")]
    pub create: Option<ContainerCreateRequest>,
    #[prost(message, optional, tag = "2")]
    pub destroy: Option<ContainerDestroyRequest>,
    #[prost(message, optional, tag = "3")]
    pub list: Option<ContainerListRequest>,
    #[prost(message, optional, tag = "4")]
    pub get_property: Option<ContainerGetPropertyRequest>,
    #[prost(message, optional, tag = "5")]
    pub set_property: Option<ContainerSetPropertyRequest>,
    #[prost(message, optional, tag = "6")]
    pub get_data: Option<ContainerGetDataRequest>,
    #[prost(message, optional, tag = "7")]
    pub start: Option<ContainerStartRequest>,
    #[prost(message, optional, tag = "8")]
    pub stop: Option<ContainerStopRequest>,
    #[prost(message, optional, tag = "9")]
    pub pause: Option<ContainerPauseRequest>,
    #[prost(message, optional, tag = "10")]
    pub resume: Option<ContainerResumeRequest>,
    #[prost(message, optional, tag = "11")]
    pub property_list: Option<ContainerPropertyListRequest>,
    #[prost(message, optional, tag = "12")]
    pub data_list: Option<ContainerDataListRequest>,
    #[prost(message, optional, tag = "13")]
    pub kill: Option<ContainerKillRequest>,
    #[prost(message, optional, tag = "14")]
    pub version: Option<VersionRequest>,
    #[prost(message, optional, tag = "15")]
    pub create_volume: Option<VolumeCreateRequest>,
    #[prost(message, optional, tag = "16")]
    pub destroy_volume: Option<VolumeDestroyRequest>,
    #[prost(message, optional, tag = "17")]
    pub list_volumes: Option<VolumeListRequest>,
}

impl ContainerRequest {
    /// Counts the populated variant fields.
    #[must_use]
    pub fn variant_count(&self) -> usize {
        [
            self.create.is_some(),
            self.destroy.is_some(),
            self.list.is_some(),
            self.get_property.is_some(),
            self.set_property.is_some(),
            self.get_data.is_some(),
            self.start.is_some(),
            self.stop.is_some(),
            self.pause.is_some(),
            self.resume.is_some(),
            self.property_list.is_some(),
            self.data_list.is_some(),
            self.kill.is_some(),
            self.version.is_some(),
            self.create_volume.is_some(),
            self.destroy_volume.is_some(),
            self.list_volumes.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerListResponse {
    #[prost(string, repeated, tag = "1")]
    pub name: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerGetPropertyResponse {
    #[prost(string, tag = "1")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerGetDataResponse {
    #[prost(string, tag = "1")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValueListEntry {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub desc: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerPropertyListResponse {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<ValueListEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerDataListResponse {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<ValueListEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VersionResponse {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(string, tag = "2")]
    pub revision: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeDescription {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub source: String,
    #[prost(string, tag = "3")]
    pub quota: String,
    #[prost(string, tag = "4")]
    pub flags: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeListResponse {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<VolumeDescription>,
}

/// Response envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerResponse {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub error: i32,
    #[prost(string, tag = "2")]
    pub error_msg: String,
    #[prost(message, optional, tag = "3")]
    pub list: Option<ContainerListResponse>,
    #[prost(message, optional, tag = "4")]
    pub get_property: Option<ContainerGetPropertyResponse>,
    #[prost(message, optional, tag = "5")]
    pub get_data: Option<ContainerGetDataResponse>,
    #[prost(message, optional, tag = "6")]
    pub property_list: Option<ContainerPropertyListResponse>,
    #[prost(message, optional, tag = "7")]
    pub data_list: Option<ContainerDataListResponse>,
    #[prost(message, optional, tag = "8")]
    pub version: Option<VersionResponse>,
    #[prost(message, optional, tag = "9")]
    pub volume_list: Option<VolumeListResponse>,
}

impl ContainerResponse {
    /// An empty response carrying just an error pair.
    #[must_use]
    pub fn with_error(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            error: code as i32,
            error_msg: msg.into(),
            ..Self::default()
        }
    }

    /// The decoded error kind.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from_wire(self.error)
    }
}
