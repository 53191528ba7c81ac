//! Configuration and constants for the CLI.

use std::time::Duration;

/// How long a launch waits for the child runtime to connect back
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on reading the advertise message from a fresh connection
pub const ADVERTISE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for a response to a control command
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a stop request lets the runtime flush before the stream is cut
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Runtime-side circular buffer for the session, in megabytes
pub const DEFAULT_BUFFER_SIZE_MB: u32 = 256;

/// Largest trace block the decoder will buffer
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

/// Environment variable telling a launched runtime where to connect
pub const DIAGNOSTIC_PORTS_ENV: &str = "DOTNET_DiagnosticPorts";

/// Prefix of the runtime's own diagnostics socket in the temp directory
pub const RUNTIME_SOCKET_PREFIX: &str = "dotnet-diagnostic-";

// Provider used to relay DiagnosticSource events over EventPipe
pub const DIAGNOSTIC_SOURCE_PROVIDER: &str = "Microsoft-Diagnostics-DiagnosticSource";
pub const DIAGNOSTIC_SOURCE_KEYWORDS: u64 = 0x3;

// Filter specs: `Listener/Event:-payload;payload;...`, one per line
pub const HTTP_FILTER_AND_PAYLOAD_SPECS: &[&str] = &[
    "HttpHandlerDiagnosticListener/System.Net.Http.Request:-Request.RequestUri;Request.Method;LoggingRequestId",
    "HttpHandlerDiagnosticListener/System.Net.Http.Response:-Response.StatusCode;LoggingRequestId",
];
