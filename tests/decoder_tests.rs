mod common;

use common::{http_trace, relay_schema, relay_values, EventRecord, SchemaDef, TraceBuilder, TRACE_PID};
use eventpiper::nettrace::{DecodedEvent, FieldDescriptor, FieldType, TraceStreamDecoder, Value};
use eventpiper::utils::error::DecodeError;
use pretty_assertions::assert_eq;
use uuid::Uuid;

fn decode_all(bytes: &[u8]) -> Vec<Result<DecodedEvent, DecodeError>> {
    TraceStreamDecoder::new(bytes).unwrap().collect()
}

fn mixed_schema() -> SchemaDef {
    SchemaDef {
        id: 7,
        provider: "Test-Provider",
        event_id: 31,
        name: "Mixed",
        fields: vec![
            FieldDescriptor::new("Flag", FieldType::Boolean),
            FieldDescriptor::new("Count", FieldType::Int32),
            FieldDescriptor::new("Bytes", FieldType::UInt64),
            FieldDescriptor::new("Ratio", FieldType::Double),
            FieldDescriptor::new("Activity", FieldType::Guid),
            FieldDescriptor::new("Label", FieldType::Utf8String),
            FieldDescriptor::new("Tags", FieldType::Array(Box::new(FieldType::UInt32))),
            FieldDescriptor::new(
                "Origin",
                FieldType::Struct(vec![
                    FieldDescriptor::new("Host", FieldType::Utf16String),
                    FieldDescriptor::new("Port", FieldType::Int64),
                ]),
            ),
        ],
    }
}

fn mixed_values(count: i32) -> Vec<Value> {
    vec![
        Value::Boolean(count % 2 == 0),
        Value::Int32(count),
        Value::UInt64(u64::MAX - count as u64),
        Value::Double(0.25 * f64::from(count)),
        Value::Guid(Uuid::from_u128(0xAABB_CCDD + count as u128)),
        Value::String(format!("label-{}", count)),
        Value::Array(vec![Value::UInt32(1), Value::UInt32(count as u32)]),
        Value::Struct(vec![
            ("Host".to_string(), Value::String("localhost".to_string())),
            ("Port".to_string(), Value::Int64(-8080)),
        ]),
    ]
}

fn expected_mixed(timestamp_ms: f64, count: i32) -> DecodedEvent {
    let names = ["Flag", "Count", "Bytes", "Ratio", "Activity", "Label", "Tags", "Origin"];
    DecodedEvent {
        timestamp_ms,
        provider_name: "Test-Provider".to_string(),
        event_name: "Mixed".to_string(),
        event_id: 31,
        thread_id: 1,
        stack: None,
        fields: names
            .iter()
            .map(|name| name.to_string())
            .zip(mixed_values(count))
            .collect(),
    }
}

fn mixed_trace(builder: TraceBuilder) -> Vec<u8> {
    let mut builder = builder;
    builder
        .metadata(mixed_schema())
        .events(vec![
            EventRecord::new(7, 0.5, mixed_values(1)),
            EventRecord::new(7, 2.5, mixed_values(2)),
        ])
        .events(vec![EventRecord::new(7, 10.0, mixed_values(3))])
        .end();
    builder.bytes()
}

#[test]
fn test_round_trip_compressed_headers() {
    let events: Vec<DecodedEvent> = decode_all(&mixed_trace(TraceBuilder::new()))
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(
        events,
        vec![
            expected_mixed(0.5, 1),
            expected_mixed(2.5, 2),
            expected_mixed(10.0, 3),
        ]
    );
}

#[test]
fn test_round_trip_uncompressed_headers() {
    let events: Vec<DecodedEvent> = decode_all(&mixed_trace(TraceBuilder::new().uncompressed()))
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(events.len(), 3);
    assert_eq!(events[1], expected_mixed(2.5, 2));
}

#[test]
fn test_header_and_schemas_exposed() {
    let bytes = mixed_trace(TraceBuilder::new());
    let mut decoder = TraceStreamDecoder::new(bytes.as_slice()).unwrap();
    assert_eq!(decoder.format_version(), 5);
    assert_eq!(decoder.header().process_id, TRACE_PID);
    assert_eq!(
        decoder.header().start_time.unwrap().to_string(),
        "2024-03-09 07:05:01"
    );

    assert!(decoder.next().is_some());
    let schema = decoder.schemas().get(7).unwrap();
    assert_eq!(schema.provider_name, "Test-Provider");
    assert_eq!(schema.fields.len(), 8);
}

#[test]
fn test_unregistered_schema_is_an_error() {
    let mut builder = TraceBuilder::new();
    builder
        .metadata(relay_schema(1))
        .events(vec![EventRecord::new(9, 1.0, Vec::new())])
        .end();

    let results = decode_all(&builder.bytes());
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(DecodeError::UnknownSchema(9))));
}

#[test]
fn test_truncation_inside_and_between_blocks() {
    let mut builder = TraceBuilder::new();
    let header_end = builder.len();
    builder.metadata(relay_schema(1));
    let metadata_end = builder.len();
    let full = http_trace().bytes();
    let boundaries = [header_end, metadata_end, full.len()];

    for cut in 0..=full.len() {
        let prefix = &full[..cut];
        let Ok(decoder) = TraceStreamDecoder::new(prefix) else {
            assert!(cut < header_end, "header failed at {}", cut);
            continue;
        };
        let results: Vec<_> = decoder.collect();

        if boundaries.contains(&cut) {
            assert!(
                results.iter().all(Result::is_ok),
                "cut at block boundary {} should end cleanly",
                cut
            );
        } else {
            assert!(
                matches!(results.last(), Some(Err(DecodeError::Truncated { .. }))),
                "cut at {} should be truncated, got {:?}",
                cut,
                results.last()
            );
        }
    }

    assert_eq!(decode_all(&full).len(), 2);
}

#[test]
fn test_header_truncation() {
    let full = http_trace().bytes();
    assert!(matches!(
        TraceStreamDecoder::new(&full[..10]),
        Err(DecodeError::Truncated { context: "trace signature" })
    ));
    assert!(matches!(
        TraceStreamDecoder::new(&full[..20]),
        Err(DecodeError::Truncated { context: "trace signature" })
    ));
    assert!(matches!(
        TraceStreamDecoder::new(&full[..40]),
        Err(DecodeError::Truncated { context: "trace header" })
    ));
}

#[test]
fn test_unsupported_versions_rejected() {
    for (version, min_reader) in [(3, 3), (6, 6), (5, 6)] {
        let bytes = TraceBuilder::with_version(version, min_reader).bytes();
        match TraceStreamDecoder::new(bytes.as_slice()) {
            Err(DecodeError::UnsupportedVersion {
                version: v,
                min_reader_version: m,
            }) => assert_eq!((v, m), (version, min_reader)),
            Err(other) => panic!("expected UnsupportedVersion, got {}", other),
            Ok(_) => panic!("version {}/{} accepted", version, min_reader),
        }
    }

    let bytes = TraceBuilder::with_version(4, 4).bytes();
    assert!(TraceStreamDecoder::new(bytes.as_slice()).is_ok());
}

#[test]
fn test_bad_magic() {
    let mut bytes = http_trace().bytes();
    bytes[..8].copy_from_slice(b"Nettrice");
    assert!(matches!(
        TraceStreamDecoder::new(bytes.as_slice()),
        Err(DecodeError::BadMagic)
    ));
}

#[test]
fn test_schema_reregistration() {
    let mut builder = TraceBuilder::new();
    builder
        .metadata(relay_schema(1))
        .metadata(relay_schema(1))
        .events(vec![EventRecord::new(
            1,
            1.0,
            relay_values("Other", &[]),
        )]);
    let results = decode_all(&builder.bytes());
    assert!(results[0].is_ok());

    let mut conflicting = relay_schema(1);
    conflicting.fields.pop();
    let mut builder = TraceBuilder::new();
    builder.metadata(relay_schema(1)).metadata(conflicting);
    let results = decode_all(&builder.bytes());
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(DecodeError::SchemaConflict(1))));
}

#[test]
fn test_stacks_resolve_until_sequence_point() {
    let schema = SchemaDef {
        id: 3,
        provider: "Test-Provider",
        event_id: 1,
        name: "Tick",
        fields: vec![FieldDescriptor::new("N", FieldType::Int32)],
    };
    let with_stack = |ms: f64| EventRecord {
        stack_id: 1,
        ..EventRecord::new(3, ms, vec![Value::Int32(0)])
    };

    let mut builder = TraceBuilder::new();
    builder
        .metadata(schema)
        .stacks(1, &[vec![0x7f00_1000, 0x7f00_2000]])
        .events(vec![with_stack(1.0)])
        .sequence_point(2.0)
        .events(vec![with_stack(3.0)])
        .end();

    let events: Vec<DecodedEvent> = decode_all(&builder.bytes())
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(events[0].stack, Some(vec![0x7f00_1000, 0x7f00_2000]));
    assert_eq!(events[1].stack, None);
}

#[test]
fn test_events_before_failure_in_block_are_kept() {
    let mut builder = TraceBuilder::new();
    builder.metadata(relay_schema(1)).events(vec![
        EventRecord::new(1, 1.0, relay_values("First", &[])),
        // EventName only; the payload ends before Arguments
        EventRecord::new(1, 2.0, vec![Value::String("Short".to_string())]),
        EventRecord::new(1, 3.0, relay_values("Never", &[])),
    ]);

    let results = decode_all(&builder.bytes());
    assert_eq!(results.len(), 2);
    let first = results[0].as_ref().unwrap();
    assert_eq!(first.field("EventName"), Some(&Value::String("First".to_string())));
    assert!(matches!(results[1], Err(DecodeError::Corrupt(_))));
}

#[test]
fn test_trailing_payload_bytes_tolerated() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&42i32.to_le_bytes());
    payload.extend_from_slice(&[0xEE; 6]);

    let mut builder = TraceBuilder::new();
    builder
        .metadata(SchemaDef {
            id: 2,
            provider: "Test-Provider",
            event_id: 1,
            name: "Tick",
            fields: vec![FieldDescriptor::new("N", FieldType::Int32)],
        })
        .raw_event(2, 4.0, payload);

    let results = decode_all(&builder.bytes());
    let event = results[0].as_ref().unwrap();
    assert_eq!(event.fields, vec![("N".to_string(), Value::Int32(42))]);
    assert_eq!(event.timestamp_ms, 4.0);
}

#[test]
fn test_unknown_block_tag() {
    let mut builder = http_trace();
    builder.block("RundownBlock", &[1, 2, 3]);
    let results = decode_all(&builder.bytes());
    assert_eq!(results.len(), 3);
    assert!(matches!(&results[2], Err(DecodeError::UnknownBlock(name)) if name == "RundownBlock"));
}

#[test]
fn test_serialization_framing_layout() {
    let bytes = http_trace().bytes();
    assert_eq!(&bytes[..8], b"Nettrace");
    assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 20);
    assert_eq!(&bytes[12..32], b"!FastSerialization.1");

    let mut ended = http_trace();
    ended.end();
    let ended = ended.bytes();
    assert_eq!(ended.len(), bytes.len() + 1);
    assert_eq!(decode_all(&ended).len(), 2);

    // Anything after the closing null reference is never read
    let mut trailing = ended.clone();
    trailing.extend_from_slice(&[0xFF; 7]);
    assert_eq!(decode_all(&trailing).len(), 2);
}
