//! Error types for the entire application.
//!
//! We use `thiserror` for library-style errors with custom types,
//! and `anyhow` for application-level error propagation in main.rs and commands.

use std::io;
use thiserror::Error;

/// Errors that can occur on the diagnostics control plane
/// (listener, advertise handshake, IPC command exchanges)
#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out waiting for {operation}")]
    Timeout { operation: &'static str },

    #[error("operation cancelled, diagnostics server stopped")]
    Cancelled,

    #[error("connection closed by the runtime")]
    ConnectionClosed,

    #[error("runtime rejected command with error 0x{code:08X} ({})", describe_server_error(.code))]
    Server { code: u32 },

    #[error("no diagnostics endpoint found for process {0}")]
    ProcessNotFound(u32),
}

impl DiagnosticsError {
    /// Whether the caller may reasonably retry (accept again, reconnect)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DiagnosticsError::Timeout { .. } | DiagnosticsError::Handshake(_)
        )
    }
}

/// Runtime error codes carried by an IPC error response
pub const DS_IPC_E_FAIL: u32 = 0x8000_4005;
pub const DS_IPC_E_BAD_ENCODING: u32 = 0x8013_1384;
pub const DS_IPC_E_UNKNOWN_COMMAND: u32 = 0x8013_1385;
pub const DS_IPC_E_UNKNOWN_MAGIC: u32 = 0x8013_1386;
pub const DS_IPC_E_NOTSUPPORTED: u32 = 0x8013_1515;

fn describe_server_error(code: &u32) -> &'static str {
    match *code {
        DS_IPC_E_FAIL => "unspecified failure",
        DS_IPC_E_BAD_ENCODING => "bad payload encoding",
        DS_IPC_E_UNKNOWN_COMMAND => "unknown command",
        DS_IPC_E_UNKNOWN_MAGIC => "unknown magic",
        DS_IPC_E_NOTSUPPORTED => "not supported",
        _ => "unrecognised error code",
    }
}

/// Errors that can occur while decoding a trace stream
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("I/O error reading trace stream: {0}")]
    Io(#[from] io::Error),

    #[error("trace stream truncated while reading {context}")]
    Truncated { context: &'static str },

    #[error("trace stream does not start with the nettrace signature")]
    BadMagic,

    #[error("unsupported trace format version {version} (requires reader version {min_reader_version})")]
    UnsupportedVersion { version: u32, min_reader_version: u32 },

    #[error("unknown block type {0:?}")]
    UnknownBlock(String),

    #[error("event references unregistered schema id {0}")]
    UnknownSchema(u32),

    #[error("schema id {0} re-registered with a different event or field layout")]
    SchemaConflict(u32),

    #[error("corrupt trace data: {0}")]
    Corrupt(String),

    /// The session's stream is forward-only and already has a decoder
    #[error("trace stream was already consumed")]
    StreamConsumed,
}

/// Errors that can occur while dispatching decoded events
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A relay event is missing what its inner event needs; never fatal
    #[error("malformed {event} payload: {reason}")]
    MalformedPayload { event: String, reason: String },

    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl DispatchError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, DispatchError::MalformedPayload { .. })
    }
}
