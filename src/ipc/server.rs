//! Reversed diagnostics server.
//!
//! In launch mode the tool listens and the runtime connects to it, first
//! with an advertise message and then once more for every command we
//! send. Connections are parked per runtime cookie until an
//! [`Endpoint`] asks for one.
//!
//! Every wait, on the listener or on a half-sent advertise, is a `poll(2)`
//! that also watches a wake-up socket, so `accept` honours its timeout
//! and `stop` from another thread interrupts it promptly.

use super::advertise::{Advertise, ADVERTISE_SIZE};
use super::endpoint::{Connector, Endpoint};
use crate::utils::config::ADVERTISE_TIMEOUT;
use crate::utils::error::DiagnosticsError;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Listener for runtimes connecting back to the tool
pub struct ReversedServer {
    shared: Arc<ServerShared>,
}

/// State shared between the server handle and its endpoints
pub(crate) struct ServerShared {
    path: PathBuf,
    stopped: AtomicBool,
    /// Non-blocking; its socket file is unlinked on stop
    listener: UnixListener,
    wake_tx: UnixStream,
    wake_rx: UnixStream,
    /// Held by whoever is taking connections off the listener
    accepting: Mutex<()>,
    /// Only held for bookkeeping, never across a wait
    state: Mutex<ServerState>,
}

struct ServerState {
    runtimes: HashMap<Uuid, RuntimeSlot>,
    /// Registered runtimes not yet handed out by `accept`
    unannounced: VecDeque<Uuid>,
}

struct RuntimeSlot {
    process_id: u32,
    pending: VecDeque<UnixStream>,
}

impl ReversedServer {
    /// Bind the listener at `path`
    ///
    /// **Public** - entry point for launch mode
    ///
    /// # Errors
    /// * `DiagnosticsError::Transport` - the path is already bound or the
    ///   socket cannot be created
    pub fn start(path: impl Into<PathBuf>) -> Result<Self, DiagnosticsError> {
        let path = path.into();
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        let (wake_tx, wake_rx) = UnixStream::pair()?;

        info!("Diagnostics server listening on {}", path.display());

        Ok(Self {
            shared: Arc::new(ServerShared {
                path,
                stopped: AtomicBool::new(false),
                listener,
                wake_tx,
                wake_rx,
                accepting: Mutex::new(()),
                state: Mutex::new(ServerState {
                    runtimes: HashMap::new(),
                    unannounced: VecDeque::new(),
                }),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Wait for the next runtime to advertise itself
    ///
    /// Reconnections from runtimes we already know are queued for their
    /// endpoints and do not end the wait.
    ///
    /// # Errors
    /// * `DiagnosticsError::Timeout` - nothing new connected within `timeout`
    /// * `DiagnosticsError::Handshake` - a connection sent a bad advertise
    /// * `DiagnosticsError::Cancelled` - the server was stopped
    pub fn accept(&self, timeout: Duration) -> Result<Endpoint, DiagnosticsError> {
        let deadline = Instant::now() + timeout;
        let _accepting = self.shared.lock_accepting();

        loop {
            if let Some(endpoint) = self.next_unannounced() {
                return Ok(endpoint);
            }

            let (advertise, stream) = self.shared.accept_one(deadline)?;
            let process_id = advertised_pid(&advertise)?;
            if self
                .shared
                .register(advertise.runtime_id, process_id, stream, false)
            {
                info!(
                    "Runtime {} (pid {}) connected",
                    advertise.runtime_id, process_id
                );
                return Ok(self.endpoint(advertise.runtime_id, process_id));
            }
        }
    }

    /// Accept until the runtime of `pid` connects, or `timeout` elapses
    ///
    /// Other runtimes stay registered; malformed connections are logged
    /// and skipped. Each wait blocks in `accept`, there is no spinning.
    pub fn accept_process(&self, pid: u32, timeout: Duration) -> Result<Endpoint, DiagnosticsError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.accept(remaining) {
                Ok(endpoint) if endpoint.process_id() == pid => return Ok(endpoint),
                Ok(endpoint) => {
                    debug!(
                        "Ignoring runtime of pid {} while waiting for pid {}",
                        endpoint.process_id(),
                        pid
                    );
                }
                Err(DiagnosticsError::Handshake(reason)) => {
                    warn!("Rejected diagnostics connection: {}", reason);
                }
                Err(DiagnosticsError::Timeout { .. }) => {
                    return Err(DiagnosticsError::Timeout {
                        operation: "target runtime to connect",
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop accepting and close every parked connection
    ///
    /// Idempotent and never waits on an outstanding `accept`, which
    /// returns `Cancelled`. The socket file is removed at once; the
    /// listening descriptor closes with the last endpoint.
    pub fn stop(&self) {
        self.shared.stop();
    }

    fn next_unannounced(&self) -> Option<Endpoint> {
        let mut state = self.shared.lock_state();
        while let Some(runtime_id) = state.unannounced.pop_front() {
            if let Some(slot) = state.runtimes.get(&runtime_id) {
                return Some(self.endpoint(runtime_id, slot.process_id));
            }
        }
        None
    }

    fn endpoint(&self, runtime_id: Uuid, process_id: u32) -> Endpoint {
        Endpoint::new(
            process_id,
            runtime_id,
            Connector::Reversed {
                server: Arc::clone(&self.shared),
                runtime_id,
            },
        )
    }
}

impl Drop for ReversedServer {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl ServerShared {
    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_accepting(&self) -> MutexGuard<'_, ()> {
        self.accepting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_stopped(&self) -> Result<(), DiagnosticsError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DiagnosticsError::Cancelled);
        }
        Ok(())
    }

    /// Take the next parked connection of `runtime_id`, accepting new
    /// connections until one arrives
    pub(crate) fn connect_runtime(
        &self,
        runtime_id: Uuid,
        timeout: Duration,
    ) -> Result<UnixStream, DiagnosticsError> {
        let deadline = Instant::now() + timeout;
        let _accepting = self.lock_accepting();

        loop {
            {
                let mut state = self.lock_state();
                self.check_stopped()?;
                match state.runtimes.get_mut(&runtime_id) {
                    Some(slot) => {
                        if let Some(stream) = slot.pending.pop_front() {
                            return Ok(stream);
                        }
                    }
                    None => return Err(DiagnosticsError::ConnectionClosed),
                }
            }

            match self.accept_one(deadline) {
                Ok((advertise, stream)) => match advertised_pid(&advertise) {
                    Ok(process_id) => {
                        self.register(advertise.runtime_id, process_id, stream, true);
                    }
                    Err(e) => warn!("Rejected diagnostics connection: {}", e),
                },
                Err(DiagnosticsError::Handshake(reason)) => {
                    warn!("Rejected diagnostics connection: {}", reason);
                }
                Err(DiagnosticsError::Timeout { .. }) => {
                    return Err(DiagnosticsError::Timeout {
                        operation: "runtime to reconnect",
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Park a connection; returns true when the runtime is new
    ///
    /// New runtimes are queued for `accept` when `announce` is set.
    /// Connections arriving after a stop are dropped.
    fn register(
        &self,
        runtime_id: Uuid,
        process_id: u32,
        stream: UnixStream,
        announce: bool,
    ) -> bool {
        let mut state = self.lock_state();
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        match state.runtimes.get_mut(&runtime_id) {
            Some(slot) => {
                if slot.process_id != process_id {
                    warn!(
                        "Runtime {} advertised pid {} but was registered with pid {}",
                        runtime_id, process_id, slot.process_id
                    );
                }
                slot.pending.push_back(stream);
                false
            }
            None => {
                state.runtimes.insert(
                    runtime_id,
                    RuntimeSlot {
                        process_id,
                        pending: VecDeque::from([stream]),
                    },
                );
                if announce {
                    state.unannounced.push_back(runtime_id);
                }
                true
            }
        }
    }

    /// Wait for one connection and read its advertise
    fn accept_one(&self, deadline: Instant) -> Result<(Advertise, UnixStream), DiagnosticsError> {
        loop {
            self.check_stopped()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DiagnosticsError::Timeout {
                    operation: "runtime connection",
                });
            }
            if !self.wait_readable(self.listener.as_fd(), remaining)? {
                continue;
            }

            let mut stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            stream.set_nonblocking(false)?;

            let advertise = self.read_advertise(&mut stream)?;
            debug!(
                "Advertise from runtime {} (pid {})",
                advertise.runtime_id, advertise.process_id
            );
            return Ok((advertise, stream));
        }
    }

    /// Read an advertise while still answering to `stop`
    fn read_advertise(&self, stream: &mut UnixStream) -> Result<Advertise, DiagnosticsError> {
        let deadline = Instant::now() + ADVERTISE_TIMEOUT;
        let mut buf = [0u8; ADVERTISE_SIZE];
        let mut filled = 0;

        while filled < ADVERTISE_SIZE {
            self.check_stopped()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DiagnosticsError::Handshake(format!(
                    "no advertise received within {:?}",
                    ADVERTISE_TIMEOUT
                )));
            }
            if !self.wait_readable(stream.as_fd(), remaining)? {
                continue;
            }

            match stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(DiagnosticsError::Handshake(
                        "connection closed before the advertise completed".to_string(),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Advertise::parse(&buf)
    }

    /// Poll `fd` together with the wake socket
    ///
    /// `Ok(false)` when the wait timed out or was interrupted.
    fn wait_readable(&self, fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool, DiagnosticsError> {
        let mut fds = [
            PollFd::new(fd, PollFlags::POLLIN),
            PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::from(poll_millis(timeout))) {
            Ok(0) | Err(Errno::EINTR) => return Ok(false),
            Ok(_) => {}
            Err(errno) => return Err(DiagnosticsError::Transport(errno.into())),
        }

        if fds[1].revents().map_or(false, |r| !r.is_empty()) {
            return Err(DiagnosticsError::Cancelled);
        }
        Ok(fds[0].revents().map_or(false, |r| !r.is_empty()))
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // The byte is never drained, so every later poll sees it too
        let _ = (&self.wake_tx).write_all(&[1]);

        let mut state = self.lock_state();
        let parked: usize = state.runtimes.values().map(|slot| slot.pending.len()).sum();
        state.runtimes.clear();
        state.unannounced.clear();
        drop(state);

        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Could not remove {}: {}", self.path.display(), e);
        }
        info!(
            "Diagnostics server stopped ({} parked connections closed)",
            parked
        );
    }
}

fn advertised_pid(advertise: &Advertise) -> Result<u32, DiagnosticsError> {
    u32::try_from(advertise.process_id).map_err(|_| {
        DiagnosticsError::Handshake(format!(
            "advertised pid {} is out of range",
            advertise.process_id
        ))
    })
}

/// Clamp to what a single poll call accepts; callers loop on the deadline
fn poll_millis(remaining: Duration) -> u16 {
    remaining.as_micros().div_ceil(1000).min(u16::MAX as u128) as u16
}
