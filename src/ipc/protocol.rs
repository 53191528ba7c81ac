//! Diagnostics IPC framing.
//!
//! Every control message on the diagnostics transport is one frame:
//!
//! ```text
//! Offset  Size  Field
//! ──────  ────  ─────────────
//! 0x00    14    magic "DOTNET_IPC_V1\0"
//! 0x0E    2     total size (header + payload), little-endian
//! 0x10    1     command set
//! 0x11    1     command id
//! 0x12    2     reserved (0)
//! 0x14    ..    payload
//! ```

use crate::utils::error::DiagnosticsError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::trace;
use std::io::{self, Read, Write};

pub const IPC_MAGIC: &[u8; 14] = b"DOTNET_IPC_V1\0";
pub const HEADER_SIZE: usize = 20;

/// Command set byte of an IPC header
pub mod command_set {
    pub const DUMP: u8 = 0x01;
    pub const EVENT_PIPE: u8 = 0x02;
    pub const PROFILER: u8 = 0x03;
    pub const PROCESS: u8 = 0x04;
    pub const SERVER: u8 = 0xFF;
}

/// Command ids within [`command_set::EVENT_PIPE`]
pub mod event_pipe {
    pub const STOP_TRACING: u8 = 0x01;
    pub const COLLECT_TRACING: u8 = 0x02;
    pub const COLLECT_TRACING_2: u8 = 0x03;
}

/// Command ids within [`command_set::PROCESS`]
pub mod process {
    pub const PROCESS_INFO: u8 = 0x00;
    pub const RESUME_RUNTIME: u8 = 0x01;
}

/// Response ids within [`command_set::SERVER`]
pub mod server {
    pub const OK: u8 = 0x00;
    pub const ERROR: u8 = 0xFF;
}

/// One IPC frame: header fields plus payload bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub command_set: u8,
    pub command_id: u8,
    pub payload: Vec<u8>,
}

impl IpcMessage {
    pub fn new(command_set: u8, command_id: u8, payload: Vec<u8>) -> Self {
        Self {
            command_set,
            command_id,
            payload,
        }
    }

    /// Total encoded length, header included
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn is_ok(&self) -> bool {
        self.command_set == command_set::SERVER && self.command_id == server::OK
    }

    pub fn is_error(&self) -> bool {
        self.command_set == command_set::SERVER && self.command_id == server::ERROR
    }

    /// Error code carried by a server error response
    pub fn error_code(&self) -> Option<u32> {
        if !self.is_error() {
            return None;
        }
        (&self.payload[..]).read_u32::<LittleEndian>().ok()
    }

    /// Encode header and payload into one buffer
    pub fn encode(&self) -> Result<Vec<u8>, DiagnosticsError> {
        let total = u16::try_from(self.frame_len()).map_err(|_| {
            DiagnosticsError::Handshake(format!(
                "frame of {} bytes exceeds the 16-bit size field",
                self.frame_len()
            ))
        })?;

        let mut buf = Vec::with_capacity(self.frame_len());
        buf.extend_from_slice(IPC_MAGIC);
        buf.write_u16::<LittleEndian>(total)?;
        buf.push(self.command_set);
        buf.push(self.command_id);
        buf.write_u16::<LittleEndian>(0)?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Write exactly one complete frame
pub fn send<W: Write>(writer: &mut W, message: &IpcMessage) -> Result<(), DiagnosticsError> {
    let frame = message.encode()?;
    trace!(
        "-> ipc frame set=0x{:02X} id=0x{:02X} len={}",
        message.command_set,
        message.command_id,
        frame.len()
    );
    writer.write_all(&frame).map_err(map_io_error)?;
    writer.flush().map_err(map_io_error)?;
    Ok(())
}

/// Read exactly one complete frame
///
/// Reads the fixed header (which carries the total length) first, then
/// blocks until the rest of the frame has arrived. A close before the
/// frame completes is `ConnectionClosed`; a partial frame is never returned.
pub fn receive<R: Read>(reader: &mut R) -> Result<IpcMessage, DiagnosticsError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).map_err(map_io_error)?;

    if &header[..IPC_MAGIC.len()] != IPC_MAGIC {
        return Err(DiagnosticsError::Handshake(
            "response does not start with the IPC magic".to_string(),
        ));
    }

    let mut fields = &header[IPC_MAGIC.len()..];
    let total = fields.read_u16::<LittleEndian>()? as usize;
    let command_set = fields.read_u8()?;
    let command_id = fields.read_u8()?;

    if total < HEADER_SIZE {
        return Err(DiagnosticsError::Handshake(format!(
            "frame size {} is smaller than the header",
            total
        )));
    }

    let mut payload = vec![0u8; total - HEADER_SIZE];
    reader.read_exact(&mut payload).map_err(map_io_error)?;

    trace!(
        "<- ipc frame set=0x{:02X} id=0x{:02X} len={}",
        command_set,
        command_id,
        total
    );

    Ok(IpcMessage {
        command_set,
        command_id,
        payload,
    })
}

/// Map socket errors onto the control-plane categories
pub(crate) fn map_io_error(err: io::Error) -> DiagnosticsError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => DiagnosticsError::ConnectionClosed,
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => DiagnosticsError::Timeout {
            operation: "ipc response",
        },
        _ => DiagnosticsError::Transport(err),
    }
}

/// Write a length-prefixed UTF-16 string (count includes the NUL)
pub fn write_string(buf: &mut Vec<u8>, value: &str) -> io::Result<()> {
    let units: Vec<u16> = value.encode_utf16().chain(std::iter::once(0)).collect();
    buf.write_u32::<LittleEndian>(units.len() as u32)?;
    for unit in units {
        buf.write_u16::<LittleEndian>(unit)?;
    }
    Ok(())
}

/// Read a length-prefixed UTF-16 string written by [`write_string`]
pub fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let count = reader.read_u32::<LittleEndian>()? as usize;
    let mut units = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        units.push(reader.read_u16::<LittleEndian>()?);
    }
    if units.last() == Some(&0) {
        units.pop();
    }
    String::from_utf16(&units).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
