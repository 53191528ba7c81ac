//! Bounds-checked reader over one buffered block.
//!
//! Running past the end of a block is corruption, not truncation: the
//! block itself arrived complete.

use crate::utils::error::DecodeError;
use byteorder::{LittleEndian, ReadBytesExt};
use uuid::Uuid;

pub(crate) struct PayloadCursor<'a> {
    rest: &'a [u8],
    len: usize,
    what: &'static str,
}

impl<'a> PayloadCursor<'a> {
    pub(crate) fn new(data: &'a [u8], what: &'static str) -> Self {
        Self {
            rest: data,
            len: data.len(),
            what,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.len - self.rest.len()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn overrun(&self, wanted: usize) -> DecodeError {
        DecodeError::Corrupt(format!(
            "{} needs {} more bytes at offset {} but only {} remain",
            self.what,
            wanted,
            self.position(),
            self.rest.len()
        ))
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.rest.len() {
            return Err(self.overrun(n));
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.bytes(n).map(|_| ())
    }

    /// Skip padding up to the next multiple of `alignment`, or to the end
    pub(crate) fn align(&mut self, alignment: usize) {
        let pad = (alignment - self.position() % alignment) % alignment;
        let pad = pad.min(self.rest.len());
        self.rest = &self.rest[pad..];
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        let wanted = 1;
        self.rest.read_u8().map_err(|_| self.overrun(wanted))
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let mut bytes = self.bytes(2)?;
        Ok(bytes.read_u16::<LittleEndian>()?)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let mut bytes = self.bytes(4)?;
        Ok(bytes.read_u32::<LittleEndian>()?)
    }

    pub(crate) fn i32(&mut self) -> Result<i32, DecodeError> {
        let mut bytes = self.bytes(4)?;
        Ok(bytes.read_i32::<LittleEndian>()?)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut bytes = self.bytes(8)?;
        Ok(bytes.read_u64::<LittleEndian>()?)
    }

    pub(crate) fn i64(&mut self) -> Result<i64, DecodeError> {
        let mut bytes = self.bytes(8)?;
        Ok(bytes.read_i64::<LittleEndian>()?)
    }

    pub(crate) fn f64(&mut self) -> Result<f64, DecodeError> {
        let mut bytes = self.bytes(8)?;
        Ok(bytes.read_f64::<LittleEndian>()?)
    }

    pub(crate) fn guid(&mut self) -> Result<Uuid, DecodeError> {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(self.bytes(16)?);
        Ok(Uuid::from_bytes_le(raw))
    }

    /// LEB128 unsigned integer
    pub(crate) fn var_u64(&mut self) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::Corrupt(format!(
            "varint longer than 10 bytes in {}",
            self.what
        )))
    }

    pub(crate) fn var_u32(&mut self) -> Result<u32, DecodeError> {
        let value = self.var_u64()?;
        u32::try_from(value).map_err(|_| {
            DecodeError::Corrupt(format!("varint {} overflows 32 bits in {}", value, self.what))
        })
    }

    /// u32 count of UTF-16 code units, then the units
    pub(crate) fn utf16_string(&mut self) -> Result<String, DecodeError> {
        let count = self.u32()? as usize;
        let raw = self.bytes(count.checked_mul(2).ok_or_else(|| self.overrun(usize::MAX))?)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units)
            .map_err(|_| DecodeError::Corrupt(format!("invalid UTF-16 string in {}", self.what)))
    }

    /// u32 byte count, then UTF-8 bytes
    pub(crate) fn utf8_string(&mut self) -> Result<String, DecodeError> {
        let count = self.u32()? as usize;
        let raw = self.bytes(count)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| DecodeError::Corrupt(format!("invalid UTF-8 string in {}", self.what)))
    }
}
