//! Streaming trace decoder.
//!
//! Reads one block object at a time from any `Read` source, registers
//! schemas as metadata arrives and yields events in stream order. A stream
//! that ends exactly between block objects is a clean end; anything cut
//! short inside the signature, the trace object or a block is `Truncated`.

use super::cursor::PayloadCursor;
use super::format::{
    check_trace_type, header_flags, object_tag, BlockKind, TraceHeader, BLOCK_ALIGNMENT,
    COMPRESSED_HEADERS, NETTRACE_MAGIC, SERIALIZATION_SIGNATURE, TRACE_HEADER_SIZE,
};
use super::object::ObjectReader;
use super::schema::{EventSchema, SchemaRegistry};
use super::value::Value;
use crate::utils::config::MAX_BLOCK_SIZE;
use crate::utils::error::DecodeError;
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use uuid::Uuid;

/// High bit of an uncompressed metadata id marks a sorted record
const SORTED_BIT: u32 = 0x8000_0000;

/// One event with its fields decoded against its schema
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    /// Milliseconds since session start
    pub timestamp_ms: f64,
    pub provider_name: String,
    pub event_name: String,
    pub event_id: u32,
    pub thread_id: u64,
    /// Instruction pointers, when the record's stack was sent
    pub stack: Option<Vec<u64>>,
    pub fields: Vec<(String, Value)>,
}

impl DecodedEvent {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

/// Record header fields; compressed headers only carry what changed
#[derive(Debug, Default, Clone)]
struct RecordHeader {
    metadata_id: u32,
    sequence: u32,
    capture_thread_id: u64,
    processor: u32,
    thread_id: u64,
    stack_id: u32,
    timestamp: u64,
    activity_id: Uuid,
    related_activity_id: Uuid,
    sorted: bool,
    payload_size: u32,
}

impl RecordHeader {
    fn read_compressed(&mut self, cursor: &mut PayloadCursor<'_>) -> Result<(), DecodeError> {
        let flags = cursor.u8()?;

        if flags & header_flags::METADATA_ID != 0 {
            self.metadata_id = cursor.var_u32()?;
        }
        if flags & header_flags::CAPTURE_THREAD_AND_SEQUENCE != 0 {
            let delta = cursor.var_u32()?;
            self.sequence = self.sequence.wrapping_add(delta.wrapping_add(1));
            self.capture_thread_id = cursor.var_u64()?;
            self.processor = cursor.var_u32()?;
        } else if self.metadata_id != 0 {
            self.sequence = self.sequence.wrapping_add(1);
        }
        if flags & header_flags::THREAD_ID != 0 {
            self.thread_id = cursor.var_u64()?;
        }
        if flags & header_flags::STACK_ID != 0 {
            self.stack_id = cursor.var_u32()?;
        }
        self.timestamp = self.timestamp.wrapping_add(cursor.var_u64()?);
        if flags & header_flags::ACTIVITY_ID != 0 {
            self.activity_id = cursor.guid()?;
        }
        if flags & header_flags::RELATED_ACTIVITY_ID != 0 {
            self.related_activity_id = cursor.guid()?;
        }
        self.sorted = flags & header_flags::SORTED != 0;
        if flags & header_flags::DATA_LENGTH != 0 {
            self.payload_size = cursor.var_u32()?;
        }
        Ok(())
    }

    fn read_uncompressed(cursor: &mut PayloadCursor<'_>) -> Result<Self, DecodeError> {
        let raw_id = cursor.u32()?;
        Ok(Self {
            metadata_id: raw_id & !SORTED_BIT,
            sorted: raw_id & SORTED_BIT != 0,
            sequence: cursor.u32()?,
            thread_id: cursor.u64()?,
            capture_thread_id: cursor.u64()?,
            processor: cursor.u32()?,
            stack_id: cursor.u32()?,
            timestamp: cursor.u64()?,
            activity_id: cursor.guid()?,
            related_activity_id: cursor.guid()?,
            payload_size: cursor.u32()?,
        })
    }
}

/// Walks the records of one event or metadata block
struct RecordReader<'a> {
    cursor: PayloadCursor<'a>,
    compressed: bool,
    header: RecordHeader,
}

impl<'a> RecordReader<'a> {
    fn new(payload: &'a [u8], what: &'static str) -> Result<Self, DecodeError> {
        let mut cursor = PayloadCursor::new(payload, what);
        let header_size = cursor.u16()?;
        if header_size < 4 {
            return Err(DecodeError::Corrupt(format!(
                "{} header size {} is below 4",
                what, header_size
            )));
        }
        let flags = cursor.u16()?;
        cursor.skip(usize::from(header_size) - 4)?;

        Ok(Self {
            cursor,
            compressed: flags & COMPRESSED_HEADERS != 0,
            header: RecordHeader::default(),
        })
    }

    /// Next record header and payload, or `None` at the end of the block
    fn next_record(&mut self) -> Result<Option<(RecordHeader, &'a [u8])>, DecodeError> {
        if self.cursor.is_empty() {
            return Ok(None);
        }

        if self.compressed {
            self.header.read_compressed(&mut self.cursor)?;
        } else {
            self.header = RecordHeader::read_uncompressed(&mut self.cursor)?;
        }
        let payload = self.cursor.bytes(self.header.payload_size as usize)?;
        if !self.compressed {
            self.cursor.align(4);
        }
        Ok(Some((self.header.clone(), payload)))
    }
}

/// Decodes a trace stream into [`DecodedEvent`]s
///
/// Iteration yields `Err` once and then stops. Events decoded from a block
/// before a failure inside it are yielded before the error.
pub struct TraceStreamDecoder<R: Read> {
    reader: ObjectReader<R>,
    format_version: u32,
    header: TraceHeader,
    schemas: SchemaRegistry,
    stacks: HashMap<u32, Vec<u64>>,
    pending: VecDeque<DecodedEvent>,
    deferred: Option<DecodeError>,
    finished: bool,
    max_block_size: u32,
    blocks_read: u64,
}

impl<R: Read> TraceStreamDecoder<R> {
    /// Read the signature and the trace object
    pub fn new(reader: R) -> Result<Self, DecodeError> {
        let mut reader = ObjectReader::new(reader);
        read_signature(&mut reader)?;

        reader.expect_tag(object_tag::BEGIN_PRIVATE_OBJECT, "trace header")?;
        let format_version = check_trace_type(&reader.read_type("trace header")?)?;
        let mut raw_header = [0u8; TRACE_HEADER_SIZE];
        reader.read_exact(&mut raw_header, "trace header")?;
        let header = TraceHeader::parse(&raw_header)?;
        reader.expect_tag(object_tag::END_OBJECT, "trace header")?;

        debug!(
            "Trace stream v{} from pid {} ({} ticks/s, {}-byte pointers, started {})",
            format_version,
            header.process_id,
            header.timestamp_frequency,
            header.pointer_size,
            header
                .start_time
                .map_or_else(|| "at an unknown time".to_string(), |t| t.to_string())
        );

        Ok(Self {
            reader,
            format_version,
            header,
            schemas: SchemaRegistry::new(),
            stacks: HashMap::new(),
            pending: VecDeque::new(),
            deferred: None,
            finished: false,
            max_block_size: MAX_BLOCK_SIZE,
            blocks_read: 0,
        })
    }

    pub fn with_max_block_size(mut self, max_block_size: u32) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn blocks_read(&self) -> u64 {
        self.blocks_read
    }

    /// Read the next block, or `None` when the stream ends between blocks
    fn read_block(&mut self) -> Result<Option<(BlockKind, Vec<u8>)>, DecodeError> {
        match self.reader.next_tag()? {
            None => return Ok(None),
            Some(object_tag::NULL_REFERENCE) => return Ok(Some((BlockKind::End, Vec::new()))),
            Some(object_tag::BEGIN_PRIVATE_OBJECT) => {}
            Some(other) => {
                return Err(DecodeError::Corrupt(format!(
                    "unexpected object tag {} at offset {}",
                    other,
                    self.reader.position() - 1
                )))
            }
        }

        let block_type = self.reader.read_type("block header")?;
        let kind = BlockKind::from_name(&block_type.name)
            .ok_or_else(|| DecodeError::UnknownBlock(block_type.name.clone()))?;

        let len = self.reader.read_u32("block size")?;
        if len > self.max_block_size {
            return Err(DecodeError::Corrupt(format!(
                "{:?} block of {} bytes exceeds the {} byte limit",
                kind, len, self.max_block_size
            )));
        }
        self.reader.align(BLOCK_ALIGNMENT, "block padding")?;
        let payload = self.reader.read_payload(len, "block payload")?;
        self.reader.expect_tag(object_tag::END_OBJECT, "block end")?;

        self.blocks_read += 1;
        trace!(
            "{:?} block v{}, {} bytes at offset {}",
            kind,
            block_type.version,
            len,
            self.reader.position()
        );
        Ok(Some((kind, payload)))
    }

    /// Consume one block, queueing whatever events it carries
    fn advance(&mut self) -> Result<(), DecodeError> {
        let Some((kind, payload)) = self.read_block()? else {
            debug!("Trace stream ended after {} blocks", self.blocks_read);
            self.finished = true;
            return Ok(());
        };

        match kind {
            BlockKind::End => {
                debug!("End block after {} blocks", self.blocks_read);
                self.finished = true;
                Ok(())
            }
            BlockKind::Metadata => self.read_metadata_block(&payload),
            BlockKind::Event => self.read_event_block(&payload),
            BlockKind::Stack => self.read_stack_block(&payload),
            BlockKind::SequencePoint => self.read_sequence_point(&payload),
        }
    }

    fn read_metadata_block(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        let mut records = RecordReader::new(payload, "metadata block")?;
        while let Some((_, record)) = records.next_record()? {
            self.schemas.register(EventSchema::parse(record)?)?;
        }
        Ok(())
    }

    fn read_event_block(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        let mut records = RecordReader::new(payload, "event block")?;
        while let Some((header, record)) = records.next_record()? {
            trace!(
                "Record schema={} seq={} thread={}/{} cpu={} activity={}/{} sorted={}",
                header.metadata_id,
                header.sequence,
                header.thread_id,
                header.capture_thread_id,
                header.processor,
                header.activity_id,
                header.related_activity_id,
                header.sorted
            );
            let event = self.decode_event(&header, record)?;
            self.pending.push_back(event);
        }
        Ok(())
    }

    fn decode_event(
        &self,
        header: &RecordHeader,
        payload: &[u8],
    ) -> Result<DecodedEvent, DecodeError> {
        let schema = self
            .schemas
            .get(header.metadata_id)
            .ok_or(DecodeError::UnknownSchema(header.metadata_id))?;

        let mut cursor = PayloadCursor::new(payload, "event payload");
        let mut fields = Vec::with_capacity(schema.fields.len());
        for field in &schema.fields {
            fields.push((field.name.clone(), Value::decode(&mut cursor, &field.field_type)?));
        }
        if !cursor.is_empty() {
            debug!(
                "{} trailing payload bytes on {}/{}",
                cursor.remaining(),
                schema.provider_name,
                schema.event_name
            );
        }

        let stack = match header.stack_id {
            0 => None,
            id => self.stacks.get(&id).cloned(),
        };

        Ok(DecodedEvent {
            timestamp_ms: self.header.relative_ms(header.timestamp),
            provider_name: schema.provider_name.clone(),
            event_name: schema.event_name.clone(),
            event_id: schema.event_id,
            thread_id: header.thread_id,
            stack,
            fields,
        })
    }

    fn read_stack_block(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        let mut cursor = PayloadCursor::new(payload, "stack block");
        let first_id = cursor.u32()?;
        let count = cursor.u32()?;
        let pointer_size = self.header.pointer_size as usize;

        for offset in 0..count {
            let size = cursor.u32()? as usize;
            if size % pointer_size != 0 {
                return Err(DecodeError::Corrupt(format!(
                    "stack of {} bytes is not a multiple of the {}-byte pointer size",
                    size, pointer_size
                )));
            }
            let mut frames = PayloadCursor::new(cursor.bytes(size)?, "stack block");
            let mut stack = Vec::with_capacity(size / pointer_size);
            while !frames.is_empty() {
                stack.push(match pointer_size {
                    4 => u64::from(frames.u32()?),
                    _ => frames.u64()?,
                });
            }
            self.stacks.insert(first_id.wrapping_add(offset), stack);
        }
        Ok(())
    }

    fn read_sequence_point(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        let mut cursor = PayloadCursor::new(payload, "sequence point block");
        let timestamp = cursor.u64()?;
        let threads = cursor.u32()?;
        for _ in 0..threads {
            let thread_id = cursor.u64()?;
            let sequence = cursor.u32()?;
            trace!("Thread {} at sequence {}", thread_id, sequence);
        }

        debug!(
            "Sequence point at {:.3}ms, dropping {} cached stacks",
            self.header.relative_ms(timestamp),
            self.stacks.len()
        );
        self.stacks.clear();
        Ok(())
    }
}

impl<R: Read> Iterator for TraceStreamDecoder<R> {
    type Item = Result<DecodedEvent, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if let Some(err) = self.deferred.take() {
                self.finished = true;
                return Some(Err(err));
            }
            if self.finished {
                return None;
            }
            if let Err(err) = self.advance() {
                self.deferred = Some(err);
            }
        }
    }
}

/// `"Nettrace"` followed by the serialization signature string
fn read_signature<R: Read>(reader: &mut ObjectReader<R>) -> Result<(), DecodeError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic, "trace signature")?;
    if &magic != NETTRACE_MAGIC {
        return Err(DecodeError::BadMagic);
    }

    let len = reader.read_u32("trace signature")?;
    if len as usize != SERIALIZATION_SIGNATURE.len() {
        return Err(DecodeError::BadMagic);
    }
    let mut signature = [0u8; SERIALIZATION_SIGNATURE.len()];
    reader.read_exact(&mut signature, "trace signature")?;
    if &signature[..] != SERIALIZATION_SIGNATURE.as_bytes() {
        return Err(DecodeError::BadMagic);
    }
    Ok(())
}
