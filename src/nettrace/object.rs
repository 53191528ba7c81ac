//! Object framing of the serialized trace stream.
//!
//! Every top-level object is `BeginPrivateObject`, a type header naming
//! the object, the object body and `EndObject`. Block bodies start with
//! their size and are padded so the payload sits 4-byte aligned relative
//! to the start of the stream.

use super::format::{object_tag, MAX_TYPE_NAME_LEN};
use crate::utils::error::DecodeError;
use std::io::{ErrorKind, Read};

/// Type header of a serialized object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectType {
    pub name: String,
    pub version: u32,
    pub min_reader_version: u32,
}

/// Reads framing from a stream while tracking the absolute offset
pub(crate) struct ObjectReader<R> {
    reader: R,
    position: u64,
}

impl<R: Read> ObjectReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            position: 0,
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    /// `read_exact` that reports EOF as truncation of `context`
    pub(crate) fn read_exact(
        &mut self,
        buf: &mut [u8],
        context: &'static str,
    ) -> Result<(), DecodeError> {
        self.reader.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => DecodeError::Truncated { context },
            _ => DecodeError::Io(e),
        })?;
        self.position += buf.len() as u64;
        Ok(())
    }

    pub(crate) fn read_u32(&mut self, context: &'static str) -> Result<u32, DecodeError> {
        let mut raw = [0u8; 4];
        self.read_exact(&mut raw, context)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Tag that starts the next object, or `None` when the stream ended
    /// right before it
    pub(crate) fn next_tag(&mut self) -> Result<Option<u8>, DecodeError> {
        let mut tag = [0u8; 1];
        loop {
            match self.reader.read(&mut tag) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.position += 1;
                    return Ok(Some(tag[0]));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) fn expect_tag(
        &mut self,
        expected: u8,
        context: &'static str,
    ) -> Result<(), DecodeError> {
        let mut tag = [0u8; 1];
        self.read_exact(&mut tag, context)?;
        if tag[0] != expected {
            return Err(DecodeError::Corrupt(format!(
                "expected object tag {} in {}, found {}",
                expected, context, tag[0]
            )));
        }
        Ok(())
    }

    /// Type header following an object's `BeginPrivateObject`
    pub(crate) fn read_type(&mut self, context: &'static str) -> Result<ObjectType, DecodeError> {
        self.expect_tag(object_tag::BEGIN_PRIVATE_OBJECT, context)?;
        self.expect_tag(object_tag::NULL_REFERENCE, context)?;
        let version = self.read_u32(context)?;
        let min_reader_version = self.read_u32(context)?;

        let len = self.read_u32(context)?;
        if len > MAX_TYPE_NAME_LEN {
            return Err(DecodeError::Corrupt(format!(
                "type name of {} bytes in {}",
                len, context
            )));
        }
        let mut name = vec![0u8; len as usize];
        self.read_exact(&mut name, context)?;
        let name = String::from_utf8(name)
            .map_err(|_| DecodeError::Corrupt(format!("type name in {} is not UTF-8", context)))?;

        self.expect_tag(object_tag::END_OBJECT, context)?;
        Ok(ObjectType {
            name,
            version,
            min_reader_version,
        })
    }

    /// Skip zero padding up to the next multiple of `alignment`
    pub(crate) fn align(&mut self, alignment: u64, context: &'static str) -> Result<(), DecodeError> {
        let padding = (alignment - self.position % alignment) % alignment;
        let mut skipped = [0u8; 8];
        self.read_exact(&mut skipped[..padding as usize], context)
    }

    /// Exactly `len` bytes, or `Truncated`
    pub(crate) fn read_payload(
        &mut self,
        len: u32,
        context: &'static str,
    ) -> Result<Vec<u8>, DecodeError> {
        let mut payload = Vec::new();
        (&mut self.reader)
            .take(u64::from(len))
            .read_to_end(&mut payload)?;
        self.position += payload.len() as u64;
        if payload.len() < len as usize {
            return Err(DecodeError::Truncated { context });
        }
        Ok(payload)
    }
}
