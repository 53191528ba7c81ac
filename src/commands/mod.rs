//! CLI command implementations.
//!
//! Commands orchestrate the library components to perform user tasks.

pub mod trace;

// Re-export main command functions
pub use trace::{execute_trace, validate_args, TraceArgs, TraceTarget};
