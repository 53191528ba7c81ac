//! Event schemas declared by metadata records, and their registry.
//!
//! A metadata record payload:
//!
//! ```text
//! u32 schema id | string provider | u32 event id | string event name
//! u64 keywords | u32 version | u32 level | u32 field count | fields...
//! field  = type descriptor, string name
//! type   = u32 code [struct: u32 count, fields...] [array: element type]
//! ```

use super::cursor::PayloadCursor;
use super::format::type_code;
use crate::utils::error::DecodeError;
use log::{debug, warn};
use std::collections::HashMap;

/// Guard against hostile nesting in type descriptors
const MAX_TYPE_DEPTH: usize = 32;

/// Declared type of one field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Boolean,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Guid,
    Utf16String,
    Utf8String,
    Array(Box<FieldType>),
    Struct(Vec<FieldDescriptor>),
}

impl FieldType {
    /// Wire code of this type
    pub fn code(&self) -> u32 {
        match self {
            FieldType::Boolean => type_code::BOOLEAN,
            FieldType::Int32 => type_code::INT32,
            FieldType::UInt32 => type_code::UINT32,
            FieldType::Int64 => type_code::INT64,
            FieldType::UInt64 => type_code::UINT64,
            FieldType::Double => type_code::DOUBLE,
            FieldType::Guid => type_code::GUID,
            FieldType::Utf16String => type_code::UTF16_STRING,
            FieldType::Utf8String => type_code::UTF8_STRING,
            FieldType::Array(_) => type_code::ARRAY,
            FieldType::Struct(_) => type_code::STRUCT,
        }
    }

    fn parse(cursor: &mut PayloadCursor<'_>, depth: usize) -> Result<Self, DecodeError> {
        if depth > MAX_TYPE_DEPTH {
            return Err(DecodeError::Corrupt(format!(
                "field types nested deeper than {}",
                MAX_TYPE_DEPTH
            )));
        }

        Ok(match cursor.u32()? {
            type_code::BOOLEAN => FieldType::Boolean,
            type_code::INT32 => FieldType::Int32,
            type_code::UINT32 => FieldType::UInt32,
            type_code::INT64 => FieldType::Int64,
            type_code::UINT64 => FieldType::UInt64,
            type_code::DOUBLE => FieldType::Double,
            type_code::GUID => FieldType::Guid,
            type_code::UTF16_STRING => FieldType::Utf16String,
            type_code::UTF8_STRING => FieldType::Utf8String,
            type_code::ARRAY => FieldType::Array(Box::new(FieldType::parse(cursor, depth + 1)?)),
            type_code::STRUCT => {
                let count = cursor.u32()?;
                FieldType::Struct(parse_fields(cursor, count, depth + 1)?)
            }
            other => {
                return Err(DecodeError::Corrupt(format!(
                    "unknown field type code {}",
                    other
                )))
            }
        })
    }
}

/// Name and type of one field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

fn parse_fields(
    cursor: &mut PayloadCursor<'_>,
    count: u32,
    depth: usize,
) -> Result<Vec<FieldDescriptor>, DecodeError> {
    // Every field needs at least a type code and a name length
    let mut fields = Vec::with_capacity((count as usize).min(cursor.remaining() / 8));
    for _ in 0..count {
        let field_type = FieldType::parse(cursor, depth)?;
        let name = cursor.utf16_string()?;
        fields.push(FieldDescriptor { name, field_type });
    }
    Ok(fields)
}

/// Layout of one event, registered by id before any event uses it
#[derive(Debug, Clone, PartialEq)]
pub struct EventSchema {
    pub id: u32,
    pub provider_name: String,
    pub event_id: u32,
    pub event_name: String,
    pub keywords: u64,
    pub version: u32,
    pub level: u32,
    pub fields: Vec<FieldDescriptor>,
    /// Raw descriptor bytes, compared on re-registration
    layout: Vec<u8>,
}

impl EventSchema {
    /// Parse a metadata record payload
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = PayloadCursor::new(payload, "metadata record");

        let id = cursor.u32()?;
        if id == 0 {
            return Err(DecodeError::Corrupt("schema id 0 is reserved".to_string()));
        }
        let provider_name = cursor.utf16_string()?;
        let event_id = cursor.u32()?;
        let event_name = cursor.utf16_string()?;
        let keywords = cursor.u64()?;
        let version = cursor.u32()?;
        let level = cursor.u32()?;

        let layout_start = cursor.position();
        let count = cursor.u32()?;
        let fields = parse_fields(&mut cursor, count, 0)?;
        let layout = payload[layout_start..cursor.position()].to_vec();

        if !cursor.is_empty() {
            debug!(
                "Ignoring {} trailing metadata bytes for schema {}",
                cursor.remaining(),
                id
            );
        }

        Ok(Self {
            id,
            provider_name,
            event_id,
            event_name,
            keywords,
            version,
            level,
            fields,
            layout,
        })
    }

    /// Field descriptors are byte-for-byte the same
    pub fn same_layout(&self, other: &EventSchema) -> bool {
        self.layout == other.layout
    }

    /// Same event from the same provider, with the same layout
    pub fn same_definition(&self, other: &EventSchema) -> bool {
        self.provider_name == other.provider_name
            && self.event_id == other.event_id
            && self.event_name == other.event_name
            && self.same_layout(other)
    }
}

/// Schemas of one trace stream, keyed by id
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<u32, EventSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema
    ///
    /// Registering an id again is accepted only for the same event with an
    /// identical layout.
    pub fn register(&mut self, schema: EventSchema) -> Result<(), DecodeError> {
        match self.schemas.get(&schema.id) {
            Some(existing) if existing.same_definition(&schema) => {
                debug!("Schema {} re-registered with identical layout", schema.id);
                Ok(())
            }
            Some(existing) => {
                warn!(
                    "Schema {} was {}/{}, now {}/{}",
                    schema.id,
                    existing.provider_name,
                    existing.event_name,
                    schema.provider_name,
                    schema.event_name
                );
                Err(DecodeError::SchemaConflict(schema.id))
            }
            None => {
                debug!(
                    "Registered schema {}: {}/{} ({} fields)",
                    schema.id,
                    schema.provider_name,
                    schema.event_name,
                    schema.fields.len()
                );
                self.schemas.insert(schema.id, schema);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&EventSchema> {
        self.schemas.get(&id)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
