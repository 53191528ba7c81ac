//! Diagnostics endpoints and the connections drawn from them.
//!
//! A runtime consumes one connection per control command, so an
//! [`Endpoint`] is not a single socket but a way to obtain the next one:
//! - attach mode dials the runtime's own listening socket
//! - launch mode takes the next connection the runtime opened back to
//!   our [`ReversedServer`](super::server::ReversedServer)

use super::client::request_process_info;
use super::protocol::{self, map_io_error, IpcMessage};
use super::server::ServerShared;
use crate::utils::config::{RESPONSE_TIMEOUT, RUNTIME_SOCKET_PREFIX};
use crate::utils::error::DiagnosticsError;
use log::{debug, info};
use std::fs;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// How new connections to a runtime are obtained
#[derive(Clone)]
pub(crate) enum Connector {
    /// Dial the runtime's diagnostics socket
    Direct(PathBuf),
    /// Wait for the runtime to connect back to our server
    Reversed {
        server: Arc<ServerShared>,
        runtime_id: Uuid,
    },
}

impl Connector {
    pub(crate) fn connect(&self, timeout: Duration) -> Result<IpcConnection, DiagnosticsError> {
        let stream = match self {
            Connector::Direct(path) => UnixStream::connect(path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                    DiagnosticsError::ConnectionClosed
                }
                _ => DiagnosticsError::Transport(e),
            })?,
            Connector::Reversed { server, runtime_id } => {
                server.connect_runtime(*runtime_id, timeout)?
            }
        };
        IpcConnection::new(stream)
    }
}

/// A connected runtime: its identity plus a way to reach it
pub struct Endpoint {
    process_id: u32,
    runtime_id: Uuid,
    connector: Connector,
}

impl Endpoint {
    pub(crate) fn new(process_id: u32, runtime_id: Uuid, connector: Connector) -> Self {
        Self {
            process_id,
            runtime_id,
            connector,
        }
    }

    /// Attach to an already running process by pid
    ///
    /// **Public** - entry point for attach mode
    ///
    /// Locates the runtime's socket in the temp directory and asks the
    /// runtime who it is, so the endpoint's identity comes from the runtime
    /// rather than from the caller.
    ///
    /// # Errors
    /// * `DiagnosticsError::ProcessNotFound` - no diagnostics socket for `pid`
    /// * `DiagnosticsError::Transport` - the socket could not be reached
    pub fn attach(pid: u32) -> Result<Self, DiagnosticsError> {
        let path = find_runtime_socket(&std::env::temp_dir(), pid)?
            .ok_or(DiagnosticsError::ProcessNotFound(pid))?;
        info!("Attaching to process {} via {}", pid, path.display());
        Self::attach_at(path)
    }

    /// Attach through an explicit socket path
    pub fn attach_at(path: impl Into<PathBuf>) -> Result<Self, DiagnosticsError> {
        let connector = Connector::Direct(path.into());
        let mut connection = connector.connect(RESPONSE_TIMEOUT)?;
        let process = request_process_info(&mut connection)?;
        debug!(
            "Runtime {} reports pid {} ({})",
            process.runtime_id, process.process_id, process.command_line
        );

        let process_id = u32::try_from(process.process_id).map_err(|_| {
            DiagnosticsError::Handshake(format!("runtime reported pid {}", process.process_id))
        })?;
        Ok(Self::new(process_id, process.runtime_id, connector))
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn runtime_id(&self) -> Uuid {
        self.runtime_id
    }

    /// Open a fresh connection for one command
    pub fn connect(&self) -> Result<IpcConnection, DiagnosticsError> {
        self.connector.connect(RESPONSE_TIMEOUT)
    }

    pub(crate) fn connector(&self) -> &Connector {
        &self.connector
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transport = match &self.connector {
            Connector::Direct(path) => path.display().to_string(),
            Connector::Reversed { .. } => "reversed".to_string(),
        };
        f.debug_struct("Endpoint")
            .field("process_id", &self.process_id)
            .field("runtime_id", &self.runtime_id)
            .field("transport", &transport)
            .finish()
    }
}

/// One control connection to a runtime
///
/// Responses are read with [`RESPONSE_TIMEOUT`]; once a session starts the
/// connection becomes the raw trace stream via [`IpcConnection::into_stream`].
pub struct IpcConnection {
    stream: UnixStream,
}

impl IpcConnection {
    pub(crate) fn new(stream: UnixStream) -> Result<Self, DiagnosticsError> {
        stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
        Ok(Self { stream })
    }

    pub fn send(&mut self, message: &IpcMessage) -> Result<(), DiagnosticsError> {
        protocol::send(&mut self.stream, message)
    }

    pub fn receive(&mut self) -> Result<IpcMessage, DiagnosticsError> {
        protocol::receive(&mut self.stream)
    }

    /// Send a command and wait for its response
    pub fn exchange(&mut self, message: &IpcMessage) -> Result<IpcMessage, DiagnosticsError> {
        self.send(message)?;
        self.receive()
    }

    /// Hand the socket over for unframed streaming, without a read timeout
    pub fn into_stream(self) -> Result<UnixStream, DiagnosticsError> {
        self.stream.set_read_timeout(None).map_err(map_io_error)?;
        Ok(self.stream)
    }
}

/// Find the newest `dotnet-diagnostic-<pid>-*-socket` in `dir`
pub fn find_runtime_socket(dir: &Path, pid: u32) -> Result<Option<PathBuf>, DiagnosticsError> {
    let prefix = format!("{}{}-", RUNTIME_SOCKET_PREFIX, pid);
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with("-socket") {
            continue;
        }

        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }

    Ok(newest.map(|(_, path)| path))
}
