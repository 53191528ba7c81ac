//! Advertise message sent by a runtime when it connects to a reversed server.
//!
//! ```text
//! Offset  Size  Field
//! ──────  ────  ─────────────
//! 0x00    6     magic "ADVR_V"
//! 0x06    1     protocol version (ASCII digit)
//! 0x07    1     NUL
//! 0x08    16    runtime instance cookie (GUID)
//! 0x18    8     process id, little-endian
//! 0x20    2     reserved
//! ```

use crate::utils::error::DiagnosticsError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;
use uuid::Uuid;

pub const ADVERTISE_MAGIC: &[u8; 6] = b"ADVR_V";
pub const ADVERTISE_VERSION: u8 = b'1';
pub const ADVERTISE_SIZE: usize = 34;

/// Identity announced by a connecting runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertise {
    pub runtime_id: Uuid,
    pub process_id: u64,
}

impl Advertise {
    /// Read and validate one advertise message
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, DiagnosticsError> {
        let mut buf = [0u8; ADVERTISE_SIZE];
        reader
            .read_exact(&mut buf)
            .map_err(super::protocol::map_io_error)?;
        Self::parse(&buf)
    }

    pub fn parse(buf: &[u8; ADVERTISE_SIZE]) -> Result<Self, DiagnosticsError> {
        if &buf[..6] != ADVERTISE_MAGIC || buf[7] != 0 {
            return Err(DiagnosticsError::Handshake(
                "connection did not start with an advertise preamble".to_string(),
            ));
        }
        if buf[6] != ADVERTISE_VERSION {
            return Err(DiagnosticsError::Handshake(format!(
                "unsupported advertise protocol version '{}'",
                buf[6] as char
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&buf[8..24]);
        let process_id = (&buf[24..32]).read_u64::<LittleEndian>()?;

        Ok(Self {
            runtime_id: Uuid::from_bytes_le(cookie),
            process_id,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ADVERTISE_SIZE);
        buf.extend_from_slice(ADVERTISE_MAGIC);
        buf.push(ADVERTISE_VERSION);
        buf.push(0);
        buf.extend_from_slice(&self.runtime_id.to_bytes_le());
        // Writes into a Vec cannot fail
        let _ = buf.write_u64::<LittleEndian>(self.process_id);
        let _ = buf.write_u16::<LittleEndian>(0);
        buf
    }
}
