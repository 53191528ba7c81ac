//! Drives decoded events to the output, one at a time, in arrival order.

use super::http::{HttpLogEntry, RELAY_EVENT_NAME};
use crate::nettrace::DecodedEvent;
use crate::utils::error::{DecodeError, DispatchError};
use log::{debug, info, warn};
use serde::Serialize;
use std::io::{self, Write};
use std::str::FromStr;

/// How emitted entries are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `1.234ms Request#42 - GET http://x`
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}' (expected text or json)", other)),
        }
    }
}

/// Counters for one dispatch run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub events_seen: u64,
    pub relay_events: u64,
    pub lines_written: u64,
    pub malformed_skipped: u64,
}

pub struct EventDispatcher<W: Write> {
    writer: W,
    format: OutputFormat,
    stats: DispatchStats,
}

impl<W: Write> EventDispatcher<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self {
            writer,
            format,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Handle one event
    ///
    /// A malformed relay event is logged and skipped; only output failures
    /// are returned.
    pub fn dispatch(&mut self, event: &DecodedEvent) -> Result<Option<HttpLogEntry>, DispatchError> {
        self.stats.events_seen += 1;
        if event.event_name == RELAY_EVENT_NAME {
            self.stats.relay_events += 1;
        }

        match HttpLogEntry::from_event(event) {
            Ok(Some(entry)) => {
                self.write_entry(&entry)?;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(err) if err.is_malformed() => {
                warn!("Skipping event at {:.3}ms: {}", event.timestamp_ms, err);
                self.stats.malformed_skipped += 1;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Dispatch every event until the stream ends or fails
    pub fn run<I>(&mut self, events: I) -> Result<DispatchStats, DispatchError>
    where
        I: IntoIterator<Item = Result<DecodedEvent, DecodeError>>,
    {
        for event in events {
            self.dispatch(&event?)?;
        }
        self.writer.flush()?;

        info!(
            "Dispatched {} events ({} relay): {} lines, {} malformed skipped",
            self.stats.events_seen,
            self.stats.relay_events,
            self.stats.lines_written,
            self.stats.malformed_skipped
        );
        Ok(self.stats)
    }

    fn write_entry(&mut self, entry: &HttpLogEntry) -> Result<(), DispatchError> {
        match self.format {
            OutputFormat::Text => writeln!(self.writer, "{}", entry)?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.writer, entry).map_err(io::Error::from)?;
                writeln!(self.writer)?;
            }
        }
        // Lines are consumed live, so do not sit on them
        self.writer.flush()?;
        self.stats.lines_written += 1;
        debug!("Wrote entry for request {}", entry.request_id());
        Ok(())
    }
}
