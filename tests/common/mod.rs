//! Shared helpers: a reference trace encoder and a fake runtime.
#![allow(dead_code)]

use eventpiper::ipc::advertise::Advertise;
use eventpiper::ipc::protocol::{self, command_set, event_pipe, process, server, IpcMessage};
use eventpiper::ipc::CollectTracingRequest;
use eventpiper::nettrace::format::{
    header_flags, object_tag, NETTRACE_MAGIC, SERIALIZATION_SIGNATURE,
};
use eventpiper::nettrace::{FieldDescriptor, FieldType, Value};
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use uuid::Uuid;

pub const SYNC_TIMESTAMP: u64 = 1_000_000;
/// One tick per microsecond
pub const TICKS_PER_SECOND: u64 = 1_000_000;
pub const TRACE_PID: u32 = 4242;
pub const SESSION_ID: u64 = 0x5E55_1011;

/// Absolute timestamp of `ms` after session start
pub fn ticks(ms: f64) -> u64 {
    SYNC_TIMESTAMP + (ms * 1000.0).round() as u64
}

pub struct SchemaDef {
    pub id: u32,
    pub provider: &'static str,
    pub event_id: u32,
    pub name: &'static str,
    pub fields: Vec<FieldDescriptor>,
}

pub struct EventRecord {
    pub schema_id: u32,
    pub thread_id: u64,
    pub stack_id: u32,
    pub timestamp: u64,
    pub values: Vec<Value>,
}

impl EventRecord {
    pub fn new(schema_id: u32, ms: f64, values: Vec<Value>) -> Self {
        Self {
            schema_id,
            thread_id: 1,
            stack_id: 0,
            timestamp: ticks(ms),
            values,
        }
    }
}

/// Reference encoder for trace streams
pub struct TraceBuilder {
    buf: Vec<u8>,
    compressed: bool,
    schemas: Vec<(u32, Vec<FieldDescriptor>)>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::with_version(5, 5)
    }

    pub fn with_version(version: u32, min_reader_version: u32) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(NETTRACE_MAGIC);
        put_u32(&mut buf, SERIALIZATION_SIGNATURE.len() as u32);
        buf.extend_from_slice(SERIALIZATION_SIGNATURE.as_bytes());

        buf.push(object_tag::BEGIN_PRIVATE_OBJECT);
        put_type(&mut buf, "Trace", version, min_reader_version);
        // 2024-03-09 07:05:01.000, a Saturday
        for part in [2024u16, 3, 6, 9, 7, 5, 1, 0] {
            buf.extend_from_slice(&part.to_le_bytes());
        }
        buf.extend_from_slice(&SYNC_TIMESTAMP.to_le_bytes());
        buf.extend_from_slice(&TICKS_PER_SECOND.to_le_bytes());
        put_u32(&mut buf, 8);
        put_u32(&mut buf, TRACE_PID);
        put_u32(&mut buf, 4);
        put_u32(&mut buf, 1_000_000);
        buf.push(object_tag::END_OBJECT);
        Self {
            buf,
            compressed: true,
            schemas: Vec::new(),
        }
    }

    pub fn uncompressed(mut self) -> Self {
        self.compressed = false;
        self
    }

    pub fn metadata(&mut self, schema: SchemaDef) -> &mut Self {
        let mut payload = Vec::new();
        put_u32(&mut payload, schema.id);
        put_utf16(&mut payload, schema.provider);
        put_u32(&mut payload, schema.event_id);
        put_utf16(&mut payload, schema.name);
        payload.extend_from_slice(&0u64.to_le_bytes());
        put_u32(&mut payload, 0);
        put_u32(&mut payload, 5);
        put_u32(&mut payload, schema.fields.len() as u32);
        for field in &schema.fields {
            put_field(&mut payload, field);
        }

        let record = RawRecord {
            metadata_id: 0,
            thread_id: 0,
            stack_id: 0,
            timestamp: SYNC_TIMESTAMP,
            payload,
        };
        let block = self.record_block(&[record]);
        self.schemas.push((schema.id, schema.fields));
        self.block("MetadataBlock", &block)
    }

    pub fn events(&mut self, records: Vec<EventRecord>) -> &mut Self {
        let raw: Vec<RawRecord> = records
            .into_iter()
            .map(|record| {
                let fields = self
                    .schemas
                    .iter()
                    .rev()
                    .find(|(id, _)| *id == record.schema_id)
                    .map(|(_, fields)| fields.clone())
                    .unwrap_or_default();
                let mut payload = Vec::new();
                for (field, value) in fields.iter().zip(&record.values) {
                    put_value(&mut payload, &field.field_type, value);
                }
                RawRecord {
                    metadata_id: record.schema_id,
                    thread_id: record.thread_id,
                    stack_id: record.stack_id,
                    timestamp: record.timestamp,
                    payload,
                }
            })
            .collect();
        let block = self.record_block(&raw);
        self.block("EventBlock", &block)
    }

    /// Event block with an explicit payload, bypassing schema encoding
    pub fn raw_event(&mut self, schema_id: u32, ms: f64, payload: Vec<u8>) -> &mut Self {
        let record = RawRecord {
            metadata_id: schema_id,
            thread_id: 1,
            stack_id: 0,
            timestamp: ticks(ms),
            payload,
        };
        let block = self.record_block(&[record]);
        self.block("EventBlock", &block)
    }

    pub fn stacks(&mut self, first_id: u32, stacks: &[Vec<u64>]) -> &mut Self {
        let mut payload = Vec::new();
        put_u32(&mut payload, first_id);
        put_u32(&mut payload, stacks.len() as u32);
        for stack in stacks {
            put_u32(&mut payload, (stack.len() * 8) as u32);
            for ip in stack {
                payload.extend_from_slice(&ip.to_le_bytes());
            }
        }
        self.block("StackBlock", &payload)
    }

    pub fn sequence_point(&mut self, ms: f64) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&ticks(ms).to_le_bytes());
        put_u32(&mut payload, 1);
        payload.extend_from_slice(&1u64.to_le_bytes());
        put_u32(&mut payload, 0);
        self.block("SPBlock", &payload)
    }

    pub fn end(&mut self) -> &mut Self {
        self.buf.push(object_tag::NULL_REFERENCE);
        self
    }

    /// One block object; the payload lands 4-byte aligned in the stream
    pub fn block(&mut self, name: &str, payload: &[u8]) -> &mut Self {
        self.buf.push(object_tag::BEGIN_PRIVATE_OBJECT);
        put_type(&mut self.buf, name, 2, 2);
        put_u32(&mut self.buf, payload.len() as u32);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self.buf.extend_from_slice(payload);
        self.buf.push(object_tag::END_OBJECT);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    fn record_block(&self, records: &[RawRecord]) -> Vec<u8> {
        let mut block = Vec::new();
        // Header: size, flags, min and max timestamps
        block.extend_from_slice(&20u16.to_le_bytes());
        let flags: u16 = if self.compressed { 1 } else { 0 };
        block.extend_from_slice(&flags.to_le_bytes());
        block.extend_from_slice(&SYNC_TIMESTAMP.to_le_bytes());
        block.extend_from_slice(&u64::MAX.to_le_bytes());

        let mut previous_timestamp = 0u64;
        for record in records {
            if self.compressed {
                block.push(
                    header_flags::METADATA_ID
                        | header_flags::THREAD_ID
                        | header_flags::STACK_ID
                        | header_flags::DATA_LENGTH,
                );
                put_varint(&mut block, u64::from(record.metadata_id));
                put_varint(&mut block, record.thread_id);
                put_varint(&mut block, u64::from(record.stack_id));
                put_varint(&mut block, record.timestamp - previous_timestamp);
                put_varint(&mut block, record.payload.len() as u64);
                previous_timestamp = record.timestamp;
                block.extend_from_slice(&record.payload);
            } else {
                put_u32(&mut block, record.metadata_id);
                put_u32(&mut block, 1);
                block.extend_from_slice(&record.thread_id.to_le_bytes());
                block.extend_from_slice(&record.thread_id.to_le_bytes());
                put_u32(&mut block, 0);
                put_u32(&mut block, record.stack_id);
                block.extend_from_slice(&record.timestamp.to_le_bytes());
                block.extend_from_slice(&[0u8; 32]);
                put_u32(&mut block, record.payload.len() as u32);
                block.extend_from_slice(&record.payload);
                while block.len() % 4 != 0 {
                    block.push(0);
                }
            }
        }
        block
    }
}

struct RawRecord {
    metadata_id: u32,
    thread_id: u64,
    stack_id: u32,
    timestamp: u64,
    payload: Vec<u8>,
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_type(buf: &mut Vec<u8>, name: &str, version: u32, min_reader_version: u32) {
    buf.push(object_tag::BEGIN_PRIVATE_OBJECT);
    buf.push(object_tag::NULL_REFERENCE);
    put_u32(buf, version);
    put_u32(buf, min_reader_version);
    put_u32(buf, name.len() as u32);
    buf.extend_from_slice(name.as_bytes());
    buf.push(object_tag::END_OBJECT);
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_utf16(buf: &mut Vec<u8>, text: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    put_u32(buf, units.len() as u32);
    for unit in units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
}

fn put_field_type(buf: &mut Vec<u8>, field_type: &FieldType) {
    put_u32(buf, field_type.code());
    match field_type {
        FieldType::Array(element) => put_field_type(buf, element),
        FieldType::Struct(fields) => {
            put_u32(buf, fields.len() as u32);
            for field in fields {
                put_field(buf, field);
            }
        }
        _ => {}
    }
}

fn put_field(buf: &mut Vec<u8>, field: &FieldDescriptor) {
    put_field_type(buf, &field.field_type);
    put_utf16(buf, &field.name);
}

fn put_value(buf: &mut Vec<u8>, field_type: &FieldType, value: &Value) {
    match (field_type, value) {
        (FieldType::Boolean, Value::Boolean(v)) => put_u32(buf, u32::from(*v)),
        (FieldType::Int32, Value::Int32(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (FieldType::UInt32, Value::UInt32(v)) => put_u32(buf, *v),
        (FieldType::Int64, Value::Int64(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (FieldType::UInt64, Value::UInt64(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (FieldType::Double, Value::Double(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (FieldType::Guid, Value::Guid(v)) => buf.extend_from_slice(&v.to_bytes_le()),
        (FieldType::Utf16String, Value::String(v)) => put_utf16(buf, v),
        (FieldType::Utf8String, Value::String(v)) => {
            put_u32(buf, v.len() as u32);
            buf.extend_from_slice(v.as_bytes());
        }
        (FieldType::Array(element), Value::Array(items)) => {
            buf.extend_from_slice(&(items.len() as u16).to_le_bytes());
            for item in items {
                put_value(buf, element, item);
            }
        }
        (FieldType::Struct(fields), Value::Struct(members)) => {
            for (field, (_, member)) in fields.iter().zip(members) {
                put_value(buf, &field.field_type, member);
            }
        }
        (ty, v) => panic!("value {:?} does not fit type {:?}", v, ty),
    }
}

/// Fields of the DiagnosticSource relay event
pub fn relay_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("EventName", FieldType::Utf16String),
        FieldDescriptor::new(
            "Arguments",
            FieldType::Array(Box::new(FieldType::Struct(vec![
                FieldDescriptor::new("Key", FieldType::Utf16String),
                FieldDescriptor::new("Value", FieldType::Utf16String),
            ]))),
        ),
    ]
}

pub fn relay_schema(id: u32) -> SchemaDef {
    SchemaDef {
        id,
        provider: "Microsoft-Diagnostics-DiagnosticSource",
        event_id: 2,
        name: "Event",
        fields: relay_fields(),
    }
}

/// Values of one relay event
pub fn relay_values(name: &str, args: &[(&str, &str)]) -> Vec<Value> {
    let arguments = args
        .iter()
        .map(|(key, value)| {
            Value::Struct(vec![
                ("Key".to_string(), Value::String(key.to_string())),
                ("Value".to_string(), Value::String(value.to_string())),
            ])
        })
        .collect();
    vec![Value::String(name.to_string()), Value::Array(arguments)]
}

/// The two-event HTTP trace used by the end-to-end tests
pub fn http_trace() -> TraceBuilder {
    let mut builder = TraceBuilder::new();
    builder.metadata(relay_schema(1)).events(vec![
        EventRecord::new(
            1,
            1.234,
            relay_values(
                "System.Net.Http.Request",
                &[("RequestUri", "http://x"), ("Method", "GET"), ("LoggingRequestId", "42")],
            ),
        ),
        EventRecord::new(
            1,
            5.0,
            relay_values(
                "System.Net.Http.Response",
                &[("StatusCode", "200"), ("LoggingRequestId", "42")],
            ),
        ),
    ]);
    builder
}

/// What a fake runtime was asked to do
#[derive(Debug, Default)]
pub struct RuntimeLog {
    pub commands: Vec<(u8, u8)>,
    pub request: Option<CollectTracingRequest>,
    pub stopped_session: Option<u64>,
    /// Session stream left open after a stop that was ignored
    pub held_session: Option<UnixStream>,
    /// Stop command connection that never got an answer
    pub held_control: Option<UnixStream>,
}

/// Speaks the runtime side of the diagnostics protocol
pub struct FakeRuntime {
    pub process_id: u64,
    pub runtime_id: Uuid,
    /// Written to the session stream right after the start response
    pub trace: Vec<u8>,
    /// Write an End block and close the stream when told to stop
    pub close_on_stop: bool,
    /// Answer the stop command at all
    pub answer_stop: bool,
    /// Error code returned for resume, if any
    pub resume_error: Option<u32>,
}

impl FakeRuntime {
    pub fn new(process_id: u64, trace: Vec<u8>) -> Self {
        Self {
            process_id,
            runtime_id: Uuid::from_u128(0x0123_4567_89AB_CDEF_0011_2233_4455_6677),
            trace,
            close_on_stop: true,
            answer_stop: true,
            resume_error: None,
        }
    }

    /// Connect back to a reversed server, one advertised connection per
    /// command, until told to stop or the server goes away
    pub fn spawn_reversed(self, server_path: PathBuf) -> JoinHandle<RuntimeLog> {
        thread::spawn(move || {
            let mut log = RuntimeLog::default();
            let mut session: Option<UnixStream> = None;
            loop {
                let Ok(mut stream) = UnixStream::connect(&server_path) else {
                    break;
                };
                let advertise = Advertise {
                    runtime_id: self.runtime_id,
                    process_id: self.process_id,
                };
                if stream.write_all(&advertise.encode()).is_err() {
                    break;
                }
                if !self.serve_one(stream, &mut log, &mut session) {
                    break;
                }
            }
            log
        })
    }

    /// Listen on `socket_path` like an attachable runtime
    pub fn spawn_listening(self, socket_path: PathBuf) -> JoinHandle<RuntimeLog> {
        let listener = UnixListener::bind(&socket_path).unwrap();
        thread::spawn(move || {
            let mut log = RuntimeLog::default();
            let mut session: Option<UnixStream> = None;
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                if !self.serve_one(stream, &mut log, &mut session) {
                    break;
                }
            }
            log
        })
    }

    /// Handle one command; false once the runtime is done
    fn serve_one(
        &self,
        mut stream: UnixStream,
        log: &mut RuntimeLog,
        session: &mut Option<UnixStream>,
    ) -> bool {
        let Ok(command) = protocol::receive(&mut stream) else {
            return false;
        };
        log.commands.push((command.command_set, command.command_id));

        match (command.command_set, command.command_id) {
            (command_set::PROCESS, process::PROCESS_INFO) => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&self.process_id.to_le_bytes());
                payload.extend_from_slice(&self.runtime_id.to_bytes_le());
                protocol::write_string(&mut payload, "dotnet app.dll").unwrap();
                protocol::write_string(&mut payload, "Linux").unwrap();
                protocol::write_string(&mut payload, "x64").unwrap();
                respond(&mut stream, server::OK, payload);
                true
            }
            (command_set::EVENT_PIPE, event_pipe::COLLECT_TRACING_2) => {
                log.request = CollectTracingRequest::decode(&command.payload).ok();
                respond(&mut stream, server::OK, SESSION_ID.to_le_bytes().to_vec());
                let _ = stream.write_all(&self.trace);
                *session = Some(stream);
                true
            }
            (command_set::PROCESS, process::RESUME_RUNTIME) => {
                match self.resume_error {
                    Some(code) => respond(&mut stream, server::ERROR, code.to_le_bytes().to_vec()),
                    None => respond(&mut stream, server::OK, 0u32.to_le_bytes().to_vec()),
                }
                true
            }
            (command_set::EVENT_PIPE, event_pipe::STOP_TRACING) => {
                let mut id = [0u8; 8];
                id.copy_from_slice(&command.payload[..8]);
                log.stopped_session = Some(u64::from_le_bytes(id));
                if !self.answer_stop {
                    log.held_session = session.take();
                    log.held_control = Some(stream);
                    return false;
                }
                respond(&mut stream, server::OK, id.to_vec());
                if self.close_on_stop {
                    if let Some(mut session) = session.take() {
                        let _ = session.write_all(&[object_tag::NULL_REFERENCE]);
                        let _ = session.shutdown(Shutdown::Both);
                    }
                } else {
                    // Keep the stream open so only the local shutdown ends it
                    log.held_session = session.take();
                }
                false
            }
            _ => {
                respond(&mut stream, server::ERROR, 0x8013_1385u32.to_le_bytes().to_vec());
                true
            }
        }
    }
}

fn respond(stream: &mut UnixStream, id: u8, payload: Vec<u8>) {
    let _ = protocol::send(stream, &IpcMessage::new(command_set::SERVER, id, payload));
}
