//! Nettrace wire constants and the trace object.
//!
//! ```text
//! signature   "Nettrace" | u32 20 | "!FastSerialization.1"
//! trace       BeginPrivateObject | type "Trace" | header (48 bytes) | EndObject
//! blocks      BeginPrivateObject | type | u32 size | padding | payload | EndObject
//! end         NullReference
//! ```
//!
//! A type is `BeginPrivateObject | NullReference | u32 version |
//! u32 min reader version | u32 name length | name | EndObject`.

use super::cursor::PayloadCursor;
use super::object::ObjectType;
use crate::utils::error::DecodeError;
use chrono::NaiveDateTime;

pub const NETTRACE_MAGIC: &[u8; 8] = b"Nettrace";
pub const SERIALIZATION_SIGNATURE: &str = "!FastSerialization.1";
pub const TRACE_OBJECT_NAME: &str = "Trace";
pub const TRACE_HEADER_SIZE: usize = 48;

/// Highest format version this reader understands
pub const READER_VERSION: u32 = 5;
/// Oldest format version this reader understands
pub const MIN_FORMAT_VERSION: u32 = 4;

/// Block payloads start on this boundary, counted from the stream start
pub const BLOCK_ALIGNMENT: u64 = 4;
pub(crate) const MAX_TYPE_NAME_LEN: u32 = 256;

/// Block flag: record headers are compressed
pub const COMPRESSED_HEADERS: u16 = 0x1;

/// Object framing tags
pub mod object_tag {
    pub const NULL_REFERENCE: u8 = 1;
    pub const BEGIN_PRIVATE_OBJECT: u8 = 5;
    pub const END_OBJECT: u8 = 6;
}

/// Bits of a compressed record header's flags byte
pub mod header_flags {
    pub const METADATA_ID: u8 = 1 << 0;
    pub const CAPTURE_THREAD_AND_SEQUENCE: u8 = 1 << 1;
    pub const THREAD_ID: u8 = 1 << 2;
    pub const STACK_ID: u8 = 1 << 3;
    pub const ACTIVITY_ID: u8 = 1 << 4;
    pub const RELATED_ACTIVITY_ID: u8 = 1 << 5;
    pub const SORTED: u8 = 1 << 6;
    pub const DATA_LENGTH: u8 = 1 << 7;
}

/// Field type codes used in metadata records
pub mod type_code {
    pub const STRUCT: u32 = 1;
    pub const BOOLEAN: u32 = 3;
    pub const INT32: u32 = 9;
    pub const UINT32: u32 = 10;
    pub const INT64: u32 = 11;
    pub const UINT64: u32 = 12;
    pub const DOUBLE: u32 = 14;
    pub const GUID: u32 = 17;
    pub const UTF16_STRING: u32 = 18;
    pub const ARRAY: u32 = 19;
    pub const UTF8_STRING: u32 = 20;
}

/// Top-level block kinds; `End` is the closing null reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    End,
    Metadata,
    Event,
    Stack,
    SequencePoint,
}

impl BlockKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MetadataBlock" => Some(Self::Metadata),
            "EventBlock" => Some(Self::Event),
            "StackBlock" => Some(Self::Stack),
            "SPBlock" => Some(Self::SequencePoint),
            _ => None,
        }
    }

    /// Serialized type name, `None` for `End`
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::End => None,
            Self::Metadata => Some("MetadataBlock"),
            Self::Event => Some("EventBlock"),
            Self::Stack => Some("StackBlock"),
            Self::SequencePoint => Some("SPBlock"),
        }
    }
}

/// Check the trace object's type and return the format version
pub fn check_trace_type(trace_type: &ObjectType) -> Result<u32, DecodeError> {
    if trace_type.name != TRACE_OBJECT_NAME {
        return Err(DecodeError::Corrupt(format!(
            "first object is {:?}, not {:?}",
            trace_type.name, TRACE_OBJECT_NAME
        )));
    }

    let ObjectType {
        version,
        min_reader_version,
        ..
    } = *trace_type;
    if version < MIN_FORMAT_VERSION || version > READER_VERSION || min_reader_version > READER_VERSION
    {
        return Err(DecodeError::UnsupportedVersion {
            version,
            min_reader_version,
        });
    }
    Ok(version)
}

/// Session-wide clock and process facts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
    /// Wall-clock session start as the runtime reported it
    pub start_time: Option<NaiveDateTime>,
    /// Timestamp of session start; relative times count from here
    pub sync_timestamp: u64,
    /// Timestamp ticks per second
    pub timestamp_frequency: u64,
    pub pointer_size: u32,
    pub process_id: u32,
    pub processor_count: u32,
    pub sampling_rate_ns: u32,
}

impl TraceHeader {
    pub fn parse(bytes: &[u8; TRACE_HEADER_SIZE]) -> Result<Self, DecodeError> {
        let mut cursor = PayloadCursor::new(bytes, "trace header");
        let mut system_time = [0u16; 8];
        for part in &mut system_time {
            *part = cursor.u16()?;
        }

        let header = Self {
            start_time: parse_system_time(&system_time),
            sync_timestamp: cursor.u64()?,
            timestamp_frequency: cursor.u64()?,
            pointer_size: cursor.u32()?,
            process_id: cursor.u32()?,
            processor_count: cursor.u32()?,
            sampling_rate_ns: cursor.u32()?,
        };

        if header.timestamp_frequency == 0 {
            return Err(DecodeError::Corrupt("timestamp frequency is zero".to_string()));
        }
        if header.pointer_size != 4 && header.pointer_size != 8 {
            return Err(DecodeError::Corrupt(format!(
                "pointer size {} is neither 4 nor 8",
                header.pointer_size
            )));
        }
        Ok(header)
    }

    /// Milliseconds between session start and `timestamp`
    pub fn relative_ms(&self, timestamp: u64) -> f64 {
        let ticks = timestamp as i128 - self.sync_timestamp as i128;
        ticks as f64 * 1000.0 / self.timestamp_frequency as f64
    }
}

/// year, month, day of week, day, hour, minute, second, millisecond
fn parse_system_time(parts: &[u16; 8]) -> Option<NaiveDateTime> {
    let [year, month, _, day, hour, minute, second, millis] = *parts;
    chrono::NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))?
        .and_hms_milli_opt(
            u32::from(hour),
            u32::from(minute),
            u32::from(second),
            u32::from(millis),
        )
}
