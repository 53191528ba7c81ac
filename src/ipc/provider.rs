//! EventPipe provider configuration and the start-session payload.

use super::protocol::{read_string, write_string};
use crate::utils::config::{
    DEFAULT_BUFFER_SIZE_MB, DIAGNOSTIC_SOURCE_KEYWORDS, DIAGNOSTIC_SOURCE_PROVIDER,
    HTTP_FILTER_AND_PAYLOAD_SPECS,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Trace format requested from the runtime (nettrace)
pub const FORMAT_NETTRACE: u32 = 1;

/// Event verbosity, ordered from least to most verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventLevel {
    Off = 0,
    Critical = 1,
    Error = 2,
    Warning = 3,
    Informational = 4,
    Verbose = 5,
}

impl EventLevel {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Off,
            1 => Self::Critical,
            2 => Self::Error,
            3 => Self::Warning,
            4 => Self::Informational,
            5 => Self::Verbose,
            _ => return None,
        })
    }
}

/// One provider to enable in a trace session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub name: String,
    pub keywords: u64,
    pub level: EventLevel,
    pub filter_data: String,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, level: EventLevel, keywords: u64) -> Self {
        Self {
            name: name.into(),
            keywords,
            level,
            filter_data: String::new(),
        }
    }

    /// Append a `key=value` argument to the filter data
    ///
    /// Keys and values containing `;` or `=` are wrapped in double quotes,
    /// the way the runtime's argument parser expects them.
    pub fn with_argument(mut self, key: &str, value: &str) -> Self {
        if !self.filter_data.is_empty() {
            self.filter_data.push(';');
        }
        self.filter_data.push_str(&quote_argument(key));
        self.filter_data.push('=');
        self.filter_data.push_str(&quote_argument(value));
        self
    }

    /// DiagnosticSource relay provider filtered down to HttpClient events
    pub fn http_diagnostic_source() -> Self {
        Self::new(
            DIAGNOSTIC_SOURCE_PROVIDER,
            EventLevel::Verbose,
            DIAGNOSTIC_SOURCE_KEYWORDS,
        )
        .with_argument("FilterAndPayloadSpecs", &HTTP_FILTER_AND_PAYLOAD_SPECS.join("\n"))
    }
}

fn quote_argument(text: &str) -> String {
    if text.contains(';') || text.contains('=') {
        format!("\"{}\"", text)
    } else {
        text.to_string()
    }
}

/// Payload of the CollectTracing2 command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectTracingRequest {
    pub circular_buffer_mb: u32,
    pub format: u32,
    pub request_rundown: bool,
    pub providers: Vec<ProviderConfig>,
}

impl CollectTracingRequest {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            circular_buffer_mb: DEFAULT_BUFFER_SIZE_MB,
            format: FORMAT_NETTRACE,
            request_rundown: false,
            providers,
        }
    }

    pub fn with_buffer_size(mut self, megabytes: u32) -> Self {
        self.circular_buffer_mb = megabytes;
        self
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(self.circular_buffer_mb)?;
        buf.write_u32::<LittleEndian>(self.format)?;
        buf.write_u8(self.request_rundown as u8)?;
        buf.write_u32::<LittleEndian>(self.providers.len() as u32)?;
        for provider in &self.providers {
            buf.write_u64::<LittleEndian>(provider.keywords)?;
            buf.write_u32::<LittleEndian>(provider.level as u32)?;
            write_string(&mut buf, &provider.name)?;
            write_string(&mut buf, &provider.filter_data)?;
        }
        Ok(buf)
    }

    /// Parse a payload back, as the runtime does on its side
    pub fn decode(mut payload: &[u8]) -> io::Result<Self> {
        let circular_buffer_mb = payload.read_u32::<LittleEndian>()?;
        let format = payload.read_u32::<LittleEndian>()?;
        let request_rundown = payload.read_u8()? != 0;
        let count = payload.read_u32::<LittleEndian>()?;

        let mut providers = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let keywords = payload.read_u64::<LittleEndian>()?;
            let raw_level = payload.read_u32::<LittleEndian>()?;
            let level = EventLevel::from_u32(raw_level).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid event level {}", raw_level),
                )
            })?;
            let name = read_string(&mut payload)?;
            let filter_data = read_string(&mut payload)?;
            providers.push(ProviderConfig {
                name,
                keywords,
                level,
                filter_data,
            });
        }

        Ok(Self {
            circular_buffer_mb,
            format,
            request_rundown,
            providers,
        })
    }
}
