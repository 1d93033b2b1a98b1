//! # corral-client
//!
//! Blocking client library for `corrald`.
//!
//! A [`Connection`] speaks one request / one response over the daemon
//! socket and remembers the last error pair for callers that prefer
//! polling accessors over `Result` plumbing. The volume create/destroy
//! calls are the one asymmetry: on success the daemon suppresses the
//! reply, so those methods wait with a bounded read timeout and treat
//! silence as success.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_const_for_fn)]

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use corral_protocol::{
    read_message_blocking, wire, write_message_blocking, ContainerRequest, ContainerResponse,
    ErrorCode, ProtocolError, ValueListEntry, VolumeDescription, DEFAULT_SOCKET_PATH,
};

/// Result type alias for client calls.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors a client call can produce.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach or talk to the daemon.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The byte stream did not frame or decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The daemon rejected the request.
    #[error("{code:?}: {message}")]
    Daemon { code: ErrorCode, message: String },

    /// The daemon closed the connection mid-call.
    #[error("daemon closed the connection")]
    Disconnected,
}

/// How long a volume call waits for the error reply that a success never
/// sends.
const VOLUME_REPLY_WINDOW: Duration = Duration::from_secs(1);

/// A connection to the daemon socket.
pub struct Connection {
    path: PathBuf,
    stream: Option<UnixStream>,
    last_error: ErrorCode,
    last_error_msg: String,
}

impl Connection {
    /// A connection to the default daemon socket. No I/O happens until the
    /// first call.
    #[must_use]
    pub fn new() -> Self {
        Self::with_path(DEFAULT_SOCKET_PATH)
    }

    /// A connection to a specific socket path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: None,
            last_error: ErrorCode::Success,
            last_error_msg: String::new(),
        }
    }

    /// The error code of the most recent call.
    #[must_use]
    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// The error message of the most recent call.
    #[must_use]
    pub fn last_error_msg(&self) -> &str {
        &self.last_error_msg
    }

    /// The socket path this connection targets.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    fn stream(&mut self) -> Result<&mut UnixStream> {
        if self.stream.is_none() {
            self.stream = Some(UnixStream::connect(&self.path)?);
        }
        self.stream.as_mut().ok_or(ClientError::Disconnected)
    }

    fn drop_connection(&mut self) {
        self.stream = None;
    }

    fn record(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.last_error = code;
        self.last_error_msg = message.into();
    }

    /// One request, one response; reconnects on the next call after any
    /// transport error.
    fn rpc(&mut self, req: &ContainerRequest) -> Result<ContainerResponse> {
        let outcome = (|| {
            let stream = self.stream()?;
            write_message_blocking(stream, req)?;
            match read_message_blocking::<_, ContainerResponse>(stream)? {
                Some(rsp) => Ok(rsp),
                None => Err(ClientError::Disconnected),
            }
        })();

        match outcome {
            Ok(rsp) => {
                self.record(rsp.code(), rsp.error_msg.clone());
                if rsp.code() == ErrorCode::Success {
                    Ok(rsp)
                } else {
                    Err(ClientError::Daemon {
                        code: rsp.code(),
                        message: rsp.error_msg,
                    })
                }
            }
            Err(e) => {
                self.drop_connection();
                self.record(ErrorCode::Unknown, e.to_string());
                Err(e)
            }
        }
    }

    /// Sends a volume request; a reply only ever carries an error, so a
    /// quiet [`VOLUME_REPLY_WINDOW`] reads as success.
    fn rpc_suppressed(&mut self, req: &ContainerRequest) -> Result<()> {
        let outcome = (|| {
            let stream = self.stream()?;
            write_message_blocking(stream, req)?;

            stream.set_read_timeout(Some(VOLUME_REPLY_WINDOW))?;
            let result = read_message_blocking::<_, ContainerResponse>(stream);
            stream.set_read_timeout(None)?;

            match result {
                Ok(Some(rsp)) => Ok(Some(rsp)),
                Ok(None) => Err(ClientError::Disconnected),
                Err(ProtocolError::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            }
        })();

        match outcome {
            Ok(None) => {
                self.record(ErrorCode::Success, "");
                Ok(())
            }
            Ok(Some(rsp)) => {
                self.record(rsp.code(), rsp.error_msg.clone());
                Err(ClientError::Daemon {
                    code: rsp.code(),
                    message: rsp.error_msg,
                })
            }
            Err(e) => {
                self.drop_connection();
                self.record(ErrorCode::Unknown, e.to_string());
                Err(e)
            }
        }
    }

    /// Creates a container.
    pub fn create(&mut self, name: &str) -> Result<()> {
        let req = ContainerRequest {
            create: Some(wire::ContainerCreateRequest { name: name.into() }),
            ..ContainerRequest::default()
        };
        self.rpc(&req).map(drop)
    }

    /// Destroys a container.
    pub fn destroy(&mut self, name: &str) -> Result<()> {
        let req = ContainerRequest {
            destroy: Some(wire::ContainerDestroyRequest { name: name.into() }),
            ..ContainerRequest::default()
        };
        self.rpc(&req).map(drop)
    }

    /// Lists container names in creation order.
    pub fn list(&mut self) -> Result<Vec<String>> {
        let req = ContainerRequest {
            list: Some(wire::ContainerListRequest {}),
            ..ContainerRequest::default()
        };
        Ok(self.rpc(&req)?.list.unwrap_or_default().name)
    }

    /// Starts a container.
    pub fn start(&mut self, name: &str) -> Result<()> {
        let req = ContainerRequest {
            start: Some(wire::ContainerStartRequest { name: name.into() }),
            ..ContainerRequest::default()
        };
        self.rpc(&req).map(drop)
    }

    /// Stops a container.
    pub fn stop(&mut self, name: &str) -> Result<()> {
        let req = ContainerRequest {
            stop: Some(wire::ContainerStopRequest { name: name.into() }),
            ..ContainerRequest::default()
        };
        self.rpc(&req).map(drop)
    }

    /// Pauses a container.
    pub fn pause(&mut self, name: &str) -> Result<()> {
        let req = ContainerRequest {
            pause: Some(wire::ContainerPauseRequest { name: name.into() }),
            ..ContainerRequest::default()
        };
        self.rpc(&req).map(drop)
    }

    /// Resumes a container.
    pub fn resume(&mut self, name: &str) -> Result<()> {
        let req = ContainerRequest {
            resume: Some(wire::ContainerResumeRequest { name: name.into() }),
            ..ContainerRequest::default()
        };
        self.rpc(&req).map(drop)
    }

    /// Sends a signal to a container's payload.
    pub fn kill(&mut self, name: &str, sig: i32) -> Result<()> {
        let req = ContainerRequest {
            kill: Some(wire::ContainerKillRequest {
                name: name.into(),
                sig,
            }),
            ..ContainerRequest::default()
        };
        self.rpc(&req).map(drop)
    }

    /// Reads a property's effective value.
    pub fn get_property(&mut self, name: &str, property: &str) -> Result<String> {
        let req = ContainerRequest {
            get_property: Some(wire::ContainerGetPropertyRequest {
                name: name.into(),
                property: property.into(),
            }),
            ..ContainerRequest::default()
        };
        Ok(self.rpc(&req)?.get_property.unwrap_or_default().value)
    }

    /// Writes a property.
    pub fn set_property(&mut self, name: &str, property: &str, value: &str) -> Result<()> {
        let req = ContainerRequest {
            set_property: Some(wire::ContainerSetPropertyRequest {
                name: name.into(),
                property: property.into(),
                value: value.into(),
            }),
            ..ContainerRequest::default()
        };
        self.rpc(&req).map(drop)
    }

    /// Reads a data field.
    pub fn get_data(&mut self, name: &str, data: &str) -> Result<String> {
        let req = ContainerRequest {
            get_data: Some(wire::ContainerGetDataRequest {
                name: name.into(),
                data: data.into(),
            }),
            ..ContainerRequest::default()
        };
        Ok(self.rpc(&req)?.get_data.unwrap_or_default().value)
    }

    /// Enumerates the visible properties with their descriptions.
    pub fn plist(&mut self) -> Result<Vec<ValueListEntry>> {
        let req = ContainerRequest {
            property_list: Some(wire::ContainerPropertyListRequest {}),
            ..ContainerRequest::default()
        };
        Ok(self.rpc(&req)?.property_list.unwrap_or_default().list)
    }

    /// Enumerates the visible data fields with their descriptions.
    pub fn dlist(&mut self) -> Result<Vec<ValueListEntry>> {
        let req = ContainerRequest {
            data_list: Some(wire::ContainerDataListRequest {}),
            ..ContainerRequest::default()
        };
        Ok(self.rpc(&req)?.data_list.unwrap_or_default().list)
    }

    /// The daemon's version pair.
    pub fn version(&mut self) -> Result<(String, String)> {
        let req = ContainerRequest {
            version: Some(wire::VersionRequest {}),
            ..ContainerRequest::default()
        };
        let version = self.rpc(&req)?.version.unwrap_or_default();
        Ok((version.tag, version.revision))
    }

    /// Creates a volume. Success is signalled by the absence of a reply.
    pub fn create_volume(
        &mut self,
        name: &str,
        source: &str,
        quota: &str,
        flags: &str,
    ) -> Result<()> {
        let req = ContainerRequest {
            create_volume: Some(wire::VolumeCreateRequest {
                name: name.into(),
                source: source.into(),
                quota: quota.into(),
                flags: flags.into(),
            }),
            ..ContainerRequest::default()
        };
        self.rpc_suppressed(&req)
    }

    /// Destroys a volume. Success is signalled by the absence of a reply.
    pub fn destroy_volume(&mut self, name: &str) -> Result<()> {
        let req = ContainerRequest {
            destroy_volume: Some(wire::VolumeDestroyRequest { name: name.into() }),
            ..ContainerRequest::default()
        };
        self.rpc_suppressed(&req)
    }

    /// Lists volumes.
    pub fn list_volumes(&mut self) -> Result<Vec<VolumeDescription>> {
        let req = ContainerRequest {
            list_volumes: Some(wire::VolumeListRequest {}),
            ..ContainerRequest::default()
        };
        Ok(self.rpc(&req)?.volume_list.unwrap_or_default().list)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_protocol::ContainerResponse;
    use std::os::unix::net::UnixListener;
    use std::thread;

    /// A stub daemon answering each request with a canned response (or
    /// staying silent for `None`).
    fn stub_daemon(replies: Vec<Option<ContainerResponse>>) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("corrald.sock");
        let listener = UnixListener::bind(&path).unwrap();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for reply in replies {
                let req: Option<ContainerRequest> = read_message_blocking(&mut stream).unwrap();
                if req.is_none() {
                    return;
                }
                if let Some(rsp) = reply {
                    write_message_blocking(&mut stream, &rsp).unwrap();
                }
            }
            // Hold the connection open until the client goes away, like a
            // daemon that suppressed its reply would.
            let _ = read_message_blocking::<_, ContainerRequest>(&mut stream);
        });

        (dir, path)
    }

    fn ok_response() -> ContainerResponse {
        ContainerResponse::with_error(ErrorCode::Success, "")
    }

    #[test]
    fn successful_call_updates_last_error() {
        let mut rsp = ok_response();
        rsp.list = Some(wire::ContainerListResponse {
            name: vec!["a".into(), "a/b".into()],
        });
        let (_dir, path) = stub_daemon(vec![Some(rsp)]);

        let mut conn = Connection::with_path(&path);
        let names = conn.list().unwrap();
        assert_eq!(names, vec!["a".to_owned(), "a/b".to_owned()]);
        assert_eq!(conn.last_error(), ErrorCode::Success);
    }

    #[test]
    fn daemon_error_surfaces_code_and_message() {
        let rsp = ContainerResponse::with_error(ErrorCode::Busy, "container a has children");
        let (_dir, path) = stub_daemon(vec![Some(rsp)]);

        let mut conn = Connection::with_path(&path);
        let err = conn.destroy("a").unwrap_err();
        match err {
            ClientError::Daemon { code, message } => {
                assert_eq!(code, ErrorCode::Busy);
                assert!(message.contains("children"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(conn.last_error(), ErrorCode::Busy);
        assert!(conn.last_error_msg().contains("children"));
    }

    #[test]
    fn silent_volume_create_reads_as_success() {
        let (_dir, path) = stub_daemon(vec![None]);

        let mut conn = Connection::with_path(&path);
        conn.create_volume("data", "", "10G", "").unwrap();
        assert_eq!(conn.last_error(), ErrorCode::Success);
    }

    #[test]
    fn volume_error_reply_is_reported() {
        let rsp = ContainerResponse::with_error(ErrorCode::VolumeDoesNotExist, "volume x doesn't exist");
        let (_dir, path) = stub_daemon(vec![Some(rsp)]);

        let mut conn = Connection::with_path(&path);
        let err = conn.destroy_volume("x").unwrap_err();
        assert!(matches!(
            err,
            ClientError::Daemon {
                code: ErrorCode::VolumeDoesNotExist,
                ..
            }
        ));
    }

    #[test]
    fn connect_failure_is_a_connection_error() {
        let mut conn = Connection::with_path("/nonexistent/corral-test.sock");
        let err = conn.list().unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
        assert_eq!(conn.last_error(), ErrorCode::Unknown);
    }
}
