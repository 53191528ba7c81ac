//! eventpiper
//!
//! Attaches to a .NET process (or launches one), opens an EventPipe trace
//! session over its diagnostics socket, decodes the event stream as it
//! arrives and prints HTTP request/response lines.
//!
//! ## Layers
//!
//! - [`ipc`]: diagnostics IPC, reversed server and session negotiation
//! - [`nettrace`]: streaming trace decoder
//! - [`dispatch`]: relay events to output lines
//! - [`commands`]: one end-to-end trace run

pub mod commands;
pub mod dispatch;
pub mod ipc;
pub mod nettrace;
pub mod utils;
