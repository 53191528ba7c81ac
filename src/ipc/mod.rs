//! Diagnostics IPC: finding a runtime and negotiating a trace session.
//!
//! This module handles:
//! - Framing control messages (`protocol`)
//! - Accepting runtimes that connect back to us (`server`, `advertise`)
//! - Attaching to runtimes that are already listening (`endpoint`)
//! - Starting, stopping and resuming (`client`, `provider`)

pub mod advertise;
pub mod client;
pub mod endpoint;
pub mod protocol;
pub mod provider;
pub mod server;

// Re-export main types
pub use advertise::Advertise;
pub use client::{ProcessInfo, ResumeOutcome, SessionNegotiator, SessionStopHandle, TraceSession};
pub use endpoint::{find_runtime_socket, Endpoint, IpcConnection};
pub use protocol::IpcMessage;
pub use provider::{CollectTracingRequest, EventLevel, ProviderConfig};
pub use server::ReversedServer;
