//! Turning decoded events into output lines.

pub mod dispatcher;
pub mod http;

pub use dispatcher::{DispatchStats, EventDispatcher, OutputFormat};
pub use http::HttpLogEntry;
