//! Decoded field values.

use super::cursor::PayloadCursor;
use super::schema::FieldType;
use crate::utils::error::DecodeError;
use uuid::Uuid;

/// One decoded field, shaped by its [`FieldType`]
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Guid(Uuid),
    String(String),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int32(v) => Some(v.into()),
            Value::UInt32(v) => Some(v.into()),
            Value::Int64(v) => Some(v),
            Value::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Member of a struct value, by name
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(members) => members
                .iter()
                .find(|(member, _)| member == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    /// Read one value of `field_type` at the cursor
    pub(crate) fn decode(
        cursor: &mut PayloadCursor<'_>,
        field_type: &FieldType,
    ) -> Result<Self, DecodeError> {
        Ok(match field_type {
            FieldType::Boolean => Value::Boolean(cursor.u32()? != 0),
            FieldType::Int32 => Value::Int32(cursor.i32()?),
            FieldType::UInt32 => Value::UInt32(cursor.u32()?),
            FieldType::Int64 => Value::Int64(cursor.i64()?),
            FieldType::UInt64 => Value::UInt64(cursor.u64()?),
            FieldType::Double => Value::Double(cursor.f64()?),
            FieldType::Guid => Value::Guid(cursor.guid()?),
            FieldType::Utf16String => Value::String(cursor.utf16_string()?),
            FieldType::Utf8String => Value::String(cursor.utf8_string()?),
            FieldType::Array(element) => {
                let count = cursor.u16()? as usize;
                let mut items = Vec::with_capacity(count.min(cursor.remaining()));
                for _ in 0..count {
                    items.push(Value::decode(cursor, element)?);
                }
                Value::Array(items)
            }
            FieldType::Struct(fields) => {
                let mut members = Vec::with_capacity(fields.len());
                for field in fields {
                    members.push((field.name.clone(), Value::decode(cursor, &field.field_type)?));
                }
                Value::Struct(members)
            }
        })
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Guid(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Struct(members) => {
                write!(f, "{{")?;
                for (i, (name, value)) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}
