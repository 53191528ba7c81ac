//! Trace stream decoding.
//!
//! The stream is self-describing: metadata blocks declare event schemas,
//! event blocks carry records laid out by those schemas. Blocks travel
//! inside the nettrace object framing (`object`).

mod cursor;
pub mod decoder;
pub mod format;
pub mod object;
pub mod schema;
pub mod value;

pub use decoder::{DecodedEvent, TraceStreamDecoder};
pub use format::{BlockKind, TraceHeader};
pub use schema::{EventSchema, FieldDescriptor, FieldType, SchemaRegistry};
pub use value::Value;
