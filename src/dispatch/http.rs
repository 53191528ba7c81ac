//! HTTP request/response lines from DiagnosticSource relay events.
//!
//! The relay event carries the logical event name in `EventName` and the
//! filtered payload as `Arguments`, a list of `{Key, Value}` string pairs.

use crate::nettrace::{DecodedEvent, Value};
use crate::utils::error::DispatchError;
use serde::Serialize;
use std::fmt;

/// Event name every DiagnosticSource relay event is published under
pub const RELAY_EVENT_NAME: &str = "Event";

pub const HTTP_REQUEST_EVENT: &str = "System.Net.Http.Request";
pub const HTTP_RESPONSE_EVENT: &str = "System.Net.Http.Response";

/// One emitted line
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HttpLogEntry {
    Request {
        timestamp_ms: f64,
        request_id: String,
        method: String,
        uri: String,
    },
    Response {
        timestamp_ms: f64,
        request_id: String,
        status_code: String,
    },
}

impl HttpLogEntry {
    /// Build the entry a decoded event stands for
    ///
    /// Returns `Ok(None)` for anything that is not an HTTP relay event.
    pub fn from_event(event: &DecodedEvent) -> Result<Option<Self>, DispatchError> {
        if event.event_name != RELAY_EVENT_NAME {
            return Ok(None);
        }
        let name = relay_name(event)?;
        if name != HTTP_REQUEST_EVENT && name != HTTP_RESPONSE_EVENT {
            return Ok(None);
        }
        let relay = RelayEvent::parse(name, event)?;
        let timestamp_ms = event.timestamp_ms;

        let entry = match relay.name {
            HTTP_REQUEST_EVENT => HttpLogEntry::Request {
                timestamp_ms,
                uri: relay.require("RequestUri")?,
                method: relay.require("Method")?,
                request_id: relay.require("LoggingRequestId")?,
            },
            HTTP_RESPONSE_EVENT => HttpLogEntry::Response {
                timestamp_ms,
                status_code: relay.require("StatusCode")?,
                request_id: relay.require("LoggingRequestId")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(entry))
    }

    pub fn request_id(&self) -> &str {
        match self {
            HttpLogEntry::Request { request_id, .. } | HttpLogEntry::Response { request_id, .. } => {
                request_id
            }
        }
    }
}

impl fmt::Display for HttpLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpLogEntry::Request {
                timestamp_ms,
                request_id,
                method,
                uri,
            } => write!(
                f,
                "{:.3}ms Request#{} - {} {}",
                timestamp_ms, request_id, method, uri
            ),
            HttpLogEntry::Response {
                timestamp_ms,
                request_id,
                status_code,
            } => write!(
                f,
                "{:.3}ms Response#{} - {}",
                timestamp_ms, request_id, status_code
            ),
        }
    }
}

/// Typed view over a relay event's two fields
struct RelayEvent<'a> {
    name: &'a str,
    arguments: Vec<(&'a str, &'a str)>,
}

/// Inner event name of a relay event
fn relay_name(event: &DecodedEvent) -> Result<&str, DispatchError> {
    event
        .field("EventName")
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::MalformedPayload {
            event: RELAY_EVENT_NAME.to_string(),
            reason: "no EventName string".to_string(),
        })
}

impl<'a> RelayEvent<'a> {
    /// Arguments are only looked at once `name` is known to matter
    fn parse(name: &'a str, event: &'a DecodedEvent) -> Result<Self, DispatchError> {
        let malformed = |reason: &str| DispatchError::MalformedPayload {
            event: name.to_string(),
            reason: reason.to_string(),
        };

        let items = event
            .field("Arguments")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("no Arguments array"))?;

        let mut arguments = Vec::with_capacity(items.len());
        for item in items {
            let key = item.field("Key").and_then(Value::as_str);
            let value = item.field("Value").and_then(Value::as_str);
            match (key, value) {
                (Some(key), Some(value)) => arguments.push((key, value)),
                _ => return Err(malformed("argument is not a Key/Value string pair")),
            }
        }

        Ok(Self { name, arguments })
    }

    /// First value for `key`; later duplicates are ignored
    fn get(&self, key: &str) -> Option<&'a str> {
        self.arguments
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    fn require(&self, key: &str) -> Result<String, DispatchError> {
        self.get(key)
            .map(str::to_string)
            .ok_or_else(|| DispatchError::MalformedPayload {
                event: self.name.to_string(),
                reason: format!("missing {} argument", key),
            })
    }
}
