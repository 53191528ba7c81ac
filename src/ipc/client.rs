//! Session negotiation: the control commands sent to a runtime.
//!
//! Each command uses its own connection. A successful start-session
//! response turns that connection into the raw trace stream, owned by the
//! returned [`TraceSession`].

use super::endpoint::{Connector, Endpoint, IpcConnection};
use super::protocol::{command_set, event_pipe, process, read_string, IpcMessage};
use super::provider::{CollectTracingRequest, ProviderConfig};
use crate::nettrace::TraceStreamDecoder;
use crate::utils::config::{RESPONSE_TIMEOUT, STOP_GRACE_PERIOD};
use crate::utils::error::{DecodeError, DiagnosticsError, DS_IPC_E_NOTSUPPORTED};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info, warn};
use std::cell::Cell;
use std::io::BufReader;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Identity and command line reported by a runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub process_id: u64,
    pub runtime_id: Uuid,
    pub command_line: String,
    pub operating_system: String,
    pub architecture: String,
}

impl ProcessInfo {
    pub fn decode(mut payload: &[u8]) -> Result<Self, DiagnosticsError> {
        let malformed = |e: std::io::Error| {
            DiagnosticsError::Handshake(format!("malformed process info response: {}", e))
        };

        let process_id = payload.read_u64::<LittleEndian>().map_err(malformed)?;
        if payload.len() < 16 {
            return Err(DiagnosticsError::Handshake(
                "process info response is missing the runtime cookie".to_string(),
            ));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&payload[..16]);
        payload = &payload[16..];

        Ok(Self {
            process_id,
            runtime_id: Uuid::from_bytes_le(cookie),
            command_line: read_string(&mut payload).map_err(malformed)?,
            operating_system: read_string(&mut payload).map_err(malformed)?,
            architecture: read_string(&mut payload).map_err(malformed)?,
        })
    }
}

/// Ask a runtime for its [`ProcessInfo`] over an open connection
pub(crate) fn request_process_info(
    connection: &mut IpcConnection,
) -> Result<ProcessInfo, DiagnosticsError> {
    let request = IpcMessage::new(command_set::PROCESS, process::PROCESS_INFO, Vec::new());
    let response = connection.exchange(&request)?;
    ProcessInfo::decode(&expect_ok(response)?.payload)
}

/// Result of a resume-runtime command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    /// The runtime was not waiting at startup; nothing to resume
    NotSuspended,
}

/// Issues control commands against one endpoint
///
/// Owns the endpoint, so only one negotiator can drive a runtime at a time.
pub struct SessionNegotiator {
    endpoint: Endpoint,
}

impl SessionNegotiator {
    /// Take ownership of `endpoint` after checking it is the expected process
    ///
    /// # Errors
    /// * `DiagnosticsError::Handshake` - the endpoint belongs to another pid
    pub fn new(endpoint: Endpoint, expected_pid: u32) -> Result<Self, DiagnosticsError> {
        if endpoint.process_id() != expected_pid {
            return Err(DiagnosticsError::Handshake(format!(
                "endpoint belongs to pid {}, expected pid {}",
                endpoint.process_id(),
                expected_pid
            )));
        }
        Ok(Self { endpoint })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Start a trace session with the default buffer size
    pub fn start_session(&self, providers: &[ProviderConfig]) -> Result<TraceSession, DiagnosticsError> {
        self.start_session_with(CollectTracingRequest::new(providers.to_vec()))
    }

    /// Start a trace session
    ///
    /// **Public** - main entry point for session negotiation
    ///
    /// # Returns
    /// The live session; its connection now carries the trace stream
    ///
    /// # Errors
    /// * `DiagnosticsError::Server` - the runtime refused, with its error code
    /// * `DiagnosticsError::Timeout` - no response within the response timeout
    /// * `DiagnosticsError::Handshake` - an unexpected response frame
    pub fn start_session_with(
        &self,
        request: CollectTracingRequest,
    ) -> Result<TraceSession, DiagnosticsError> {
        let mut connection = self.endpoint.connect()?;
        let message = IpcMessage::new(
            command_set::EVENT_PIPE,
            event_pipe::COLLECT_TRACING_2,
            request.encode()?,
        );

        let response = expect_ok(connection.exchange(&message)?)?;
        let session_id = (&response.payload[..])
            .read_u64::<LittleEndian>()
            .map_err(|_| {
                DiagnosticsError::Handshake("start-session response lacks a session id".to_string())
            })?;

        info!(
            "Trace session 0x{:X} started on pid {} ({} providers)",
            session_id,
            self.endpoint.process_id(),
            request.providers.len()
        );

        TraceSession::new(
            session_id,
            connection.into_stream()?,
            request.providers,
            self.endpoint.connector().clone(),
        )
    }

    /// Let a runtime that is waiting at startup continue
    pub fn resume_runtime(&self) -> Result<ResumeOutcome, DiagnosticsError> {
        let mut connection = self.endpoint.connect()?;
        let message = IpcMessage::new(command_set::PROCESS, process::RESUME_RUNTIME, Vec::new());
        let response = connection.exchange(&message)?;

        match response.error_code() {
            None => {
                expect_ok(response)?;
                debug!("Runtime of pid {} resumed", self.endpoint.process_id());
                Ok(ResumeOutcome::Resumed)
            }
            Some(DS_IPC_E_NOTSUPPORTED) => {
                debug!("Runtime of pid {} was not suspended", self.endpoint.process_id());
                Ok(ResumeOutcome::NotSuspended)
            }
            Some(code) => Err(DiagnosticsError::Server { code }),
        }
    }

    pub fn process_info(&self) -> Result<ProcessInfo, DiagnosticsError> {
        request_process_info(&mut self.endpoint.connect()?)
    }

    /// Stop a session; a connection already closed counts as stopped
    pub fn stop(&self, session: &TraceSession) -> Result<(), DiagnosticsError> {
        session.stop_handle().stop()
    }
}

/// Turn a server error frame into an error and reject non-server frames
fn expect_ok(response: IpcMessage) -> Result<IpcMessage, DiagnosticsError> {
    if let Some(code) = response.error_code() {
        return Err(DiagnosticsError::Server { code });
    }
    if !response.is_ok() {
        return Err(DiagnosticsError::Handshake(format!(
            "unexpected response set=0x{:02X} id=0x{:02X}",
            response.command_set, response.command_id
        )));
    }
    Ok(response)
}

/// A running trace session and the stream it owns
pub struct TraceSession {
    id: u64,
    stream: UnixStream,
    providers: Vec<ProviderConfig>,
    control: Arc<StopControl>,
    consumed: Cell<bool>,
}

/// Shared between a session and its stop handles
struct StopControl {
    session_id: u64,
    connector: Connector,
    /// Clone of the session socket, only ever shut down
    stream: UnixStream,
    state: Mutex<StopState>,
    finished: Condvar,
}

#[derive(Default)]
struct StopState {
    stop_requested: bool,
    finished: bool,
}

impl TraceSession {
    fn new(
        id: u64,
        stream: UnixStream,
        providers: Vec<ProviderConfig>,
        connector: Connector,
    ) -> Result<Self, DiagnosticsError> {
        let control = Arc::new(StopControl {
            session_id: id,
            connector,
            stream: stream.try_clone()?,
            state: Mutex::new(StopState::default()),
            finished: Condvar::new(),
        });
        Ok(Self {
            id,
            stream,
            providers,
            control,
            consumed: Cell::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn providers(&self) -> &[ProviderConfig] {
        &self.providers
    }

    /// Handle that can stop this session from another thread
    pub fn stop_handle(&self) -> SessionStopHandle {
        SessionStopHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.control.lock_state().stop_requested
    }

    /// Decode the session's stream
    ///
    /// The decoder borrows the session and cannot outlive it. The stream
    /// is forward-only: a second call fails.
    pub fn events(&self) -> Result<TraceStreamDecoder<BufReader<&UnixStream>>, DecodeError> {
        if self.consumed.replace(true) {
            return Err(DecodeError::StreamConsumed);
        }
        TraceStreamDecoder::new(BufReader::new(&self.stream))
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        {
            let mut state = self.control.lock_state();
            state.finished = true;
        }
        self.control.finished.notify_all();
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("Trace session 0x{:X} released", self.id);
    }
}

/// Cloneable, thread-safe way to stop a [`TraceSession`]
#[derive(Clone)]
pub struct SessionStopHandle {
    control: Arc<StopControl>,
}

impl SessionStopHandle {
    pub fn session_id(&self) -> u64 {
        self.control.session_id
    }

    /// Stop with the default grace period
    pub fn stop(&self) -> Result<(), DiagnosticsError> {
        self.stop_with_grace(STOP_GRACE_PERIOD)
    }

    /// Ask the runtime to stop, then make sure the reader unblocks
    ///
    /// The stop command goes out on its own thread so `grace` bounds the
    /// whole call: once it elapses the local socket is shut down even if
    /// the runtime never answered. Idempotent.
    ///
    /// # Errors
    /// * `DiagnosticsError::Timeout` - no acknowledgment within `grace`;
    ///   the reader is unblocked regardless
    /// * any error the runtime answered the stop command with
    pub fn stop_with_grace(&self, grace: Duration) -> Result<(), DiagnosticsError> {
        {
            let mut state = self.control.lock_state();
            if state.stop_requested || state.finished {
                state.stop_requested = true;
                return Ok(());
            }
            state.stop_requested = true;
        }

        let deadline = Instant::now() + grace;
        let (tx, rx) = mpsc::channel();
        let control = Arc::clone(&self.control);
        let spawned = thread::Builder::new()
            .name("eventpiper-stop".to_string())
            .spawn(move || {
                let _ = tx.send(send_stop(&control.connector, control.session_id));
            });

        let state = self.control.lock_state();
        let (state, _) = self
            .control
            .finished
            .wait_timeout_while(state, grace, |s| !s.finished)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.finished {
            debug!("Stream still open after {:?}, shutting it down", grace);
            let _ = self.control.stream.shutdown(Shutdown::Both);
        }
        drop(state);

        if let Err(e) = spawned {
            warn!("Could not send the stop command: {}", e);
            return Err(DiagnosticsError::Transport(e));
        }

        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(Ok(())) => {
                info!("Stop requested for trace session 0x{:X}", self.control.session_id);
                Ok(())
            }
            Ok(Err(DiagnosticsError::ConnectionClosed)) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Session 0x{:X} already closed", self.control.session_id);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Stop command failed: {}", e);
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Runtime did not acknowledge the stop of session 0x{:X} within {:?}",
                    self.control.session_id, grace
                );
                Err(DiagnosticsError::Timeout {
                    operation: "stop acknowledgment",
                })
            }
        }
    }
}

impl StopControl {
    fn lock_state(&self) -> MutexGuard<'_, StopState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn send_stop(connector: &Connector, session_id: u64) -> Result<(), DiagnosticsError> {
    let mut connection = connector.connect(RESPONSE_TIMEOUT)?;
    let message = IpcMessage::new(
        command_set::EVENT_PIPE,
        event_pipe::STOP_TRACING,
        session_id.to_le_bytes().to_vec(),
    );
    expect_ok(connection.exchange(&message)?)?;
    Ok(())
}
