//! Trace command implementation.
//!
//! The trace command:
//! 1. Reaches the target runtime (attach by pid, or launch and accept)
//! 2. Starts a trace session with the HTTP DiagnosticSource provider
//! 3. Resumes a launched runtime
//! 4. Decodes the stream and prints request/response lines until it ends

use crate::dispatch::{DispatchStats, EventDispatcher, OutputFormat};
use crate::ipc::{
    CollectTracingRequest, Endpoint, ProviderConfig, ResumeOutcome, ReversedServer,
    SessionNegotiator, TraceSession,
};
use crate::utils::config::{DEFAULT_ACCEPT_TIMEOUT, DEFAULT_BUFFER_SIZE_MB, DIAGNOSTIC_PORTS_ENV};
use crate::utils::error::{DecodeError, DispatchError};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

/// What to trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceTarget {
    /// A running process, by pid
    Attach(u32),
    /// A program to start with the diagnostics port pointed at us
    Launch { program: String, args: Vec<String> },
}

impl TraceTarget {
    /// An integer target is a pid; anything else is a program
    pub fn parse(target: &str, args: Vec<String>) -> Self {
        match target.parse::<u32>() {
            Ok(pid) => TraceTarget::Attach(pid),
            Err(_) => TraceTarget::Launch {
                program: target.to_string(),
                args,
            },
        }
    }
}

/// Arguments for the trace command
///
/// **Public** - used by main.rs to construct from CLI args
#[derive(Debug, Clone)]
pub struct TraceArgs {
    pub target: TraceTarget,

    /// Arguments given after a pid target, which has no use for them
    pub extra_args: Vec<String>,

    pub format: OutputFormat,

    /// How long a launched runtime gets to connect back
    pub accept_timeout: Duration,

    /// Runtime-side circular buffer, in MB
    pub buffer_size_mb: u32,
}

impl TraceArgs {
    pub fn new(target: &str, args: Vec<String>) -> Self {
        let target = TraceTarget::parse(target, args.clone());
        let extra_args = match target {
            TraceTarget::Attach(_) => args,
            TraceTarget::Launch { .. } => Vec::new(),
        };
        Self {
            target,
            extra_args,
            format: OutputFormat::Text,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            buffer_size_mb: DEFAULT_BUFFER_SIZE_MB,
        }
    }
}

/// Execute the trace command
///
/// **Public** - main entry point called from main.rs
///
/// # Returns
/// Counters of the dispatch run once the stream ends
///
/// # Errors
/// * The target cannot be reached or refuses the session
/// * The trace stream is corrupt or cut short without a stop request
/// * Writing to stdout fails
pub fn execute_trace(args: TraceArgs) -> Result<DispatchStats> {
    let start_time = Instant::now();

    // Present only in launch mode; dropping it closes the listener
    let mut server: Option<ReversedServer> = None;

    info!("Step 1/4: Connecting to target...");
    let negotiator = match &args.target {
        TraceTarget::Attach(pid) => attach(*pid)?,
        TraceTarget::Launch { program, args: program_args } => {
            let (launched, negotiator) = launch(program, program_args, args.accept_timeout)?;
            server = Some(launched);
            negotiator
        }
    };

    info!("Step 2/4: Starting trace session...");
    let request = CollectTracingRequest::new(vec![ProviderConfig::http_diagnostic_source()])
        .with_buffer_size(args.buffer_size_mb);
    let session = negotiator
        .start_session_with(request)
        .context("Failed to start trace session")?;

    install_stop_on_ctrl_c(&session);

    if server.is_some() {
        info!("Step 3/4: Resuming runtime...");
        match negotiator.resume_runtime().context("Failed to resume runtime")? {
            ResumeOutcome::Resumed => debug!("Runtime resumed"),
            ResumeOutcome::NotSuspended => debug!("Runtime was already running"),
        }
    } else {
        info!("Step 3/4: Runtime already running, nothing to resume");
    }

    info!("Step 4/4: Streaming events (Ctrl-C to stop)...");
    let stats = stream_events(&session, args.format)?;

    drop(session);
    drop(server);

    info!(
        "Trace completed in {:.2}s, {} lines written",
        start_time.elapsed().as_secs_f64(),
        stats.lines_written
    );
    Ok(stats)
}

/// Validate trace arguments before doing any work
///
/// **Public** - called by main.rs before execute_trace
pub fn validate_args(args: &TraceArgs) -> Result<()> {
    match &args.target {
        TraceTarget::Attach(0) => bail!("pid 0 is not a valid target"),
        TraceTarget::Attach(pid) if *pid == std::process::id() => {
            bail!("Cannot trace this process itself (pid {})", pid)
        }
        TraceTarget::Attach(pid) if !args.extra_args.is_empty() => bail!(
            "Arguments {:?} can only be passed to a launched program, not to pid {}",
            args.extra_args,
            pid
        ),
        TraceTarget::Launch { program, .. } if program.trim().is_empty() => {
            bail!("Program to launch is empty")
        }
        _ => {}
    }

    if args.buffer_size_mb == 0 {
        bail!("Buffer size must be at least 1 MB");
    }
    if args.accept_timeout.is_zero() {
        bail!("Accept timeout must be greater than zero");
    }
    Ok(())
}

fn attach(pid: u32) -> Result<SessionNegotiator> {
    info!("Attaching to pid {}", pid);
    let endpoint =
        Endpoint::attach(pid).with_context(|| format!("Failed to attach to pid {}", pid))?;
    SessionNegotiator::new(endpoint, pid).context("Attached to the wrong runtime")
}

/// Start the server, launch the program and wait for its runtime
fn launch(
    program: &str,
    program_args: &[String],
    accept_timeout: Duration,
) -> Result<(ReversedServer, SessionNegotiator)> {
    let socket_path = rendezvous_path(&std::env::temp_dir(), std::process::id(), Local::now());
    let server = ReversedServer::start(&socket_path).with_context(|| {
        format!("Failed to listen on {}", socket_path.display())
    })?;

    let mut child = spawn_program(program, program_args, &socket_path)?;
    let pid = child.id();
    info!("Launched {} as pid {}", program, pid);

    let endpoint = match server.accept_process(pid, accept_timeout) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            // The runtime waits suspended for us; do not leave it hanging
            warn!("Runtime of pid {} never connected, killing it", pid);
            if let Err(kill_err) = child.kill() {
                debug!("Failed to kill pid {}: {}", pid, kill_err);
            }
            let _ = child.wait();
            return Err(e).with_context(|| format!("Runtime of pid {} did not connect", pid));
        }
    };

    let negotiator = SessionNegotiator::new(endpoint, pid)?;
    Ok((server, negotiator))
}

fn spawn_program(program: &str, program_args: &[String], socket_path: &Path) -> Result<Child> {
    debug!(
        "Spawning {} {:?} with {}={}",
        program,
        program_args,
        DIAGNOSTIC_PORTS_ENV,
        socket_path.display()
    );
    Command::new(program)
        .args(program_args)
        .env(DIAGNOSTIC_PORTS_ENV, socket_path)
        .spawn()
        .with_context(|| format!("Failed to launch {}", program))
}

/// `<dir>/eventpiper-<pid>-<yyyyMMdd_HHmmss>.socket`
pub fn rendezvous_path(dir: &Path, pid: u32, now: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "eventpiper-{}-{}.socket",
        pid,
        now.format("%Y%m%d_%H%M%S")
    ))
}

fn install_stop_on_ctrl_c(session: &TraceSession) {
    let handle = session.stop_handle();
    let result = ctrlc::set_handler(move || {
        info!("Interrupted, stopping trace session 0x{:X}", handle.session_id());
        if let Err(e) = handle.stop() {
            warn!("Failed to stop trace session: {}", e);
        }
    });
    if let Err(e) = result {
        warn!("Ctrl-C will not stop the session cleanly: {}", e);
    }
}

fn stream_events(session: &TraceSession, format: OutputFormat) -> Result<DispatchStats> {
    let events = match session.events() {
        Ok(events) => events,
        Err(e) if session.stop_requested() && ended_by_stop(&e) => {
            info!("Session stopped before the trace header arrived");
            return Ok(DispatchStats::default());
        }
        Err(e) => return Err(e).context("Failed to read trace stream header"),
    };
    debug!(
        "Trace format v{}, session started by pid {}",
        events.format_version(),
        events.header().process_id
    );

    let mut dispatcher = EventDispatcher::new(io::stdout().lock(), format);
    match dispatcher.run(events) {
        Ok(stats) => Ok(stats),
        Err(DispatchError::Decode(e)) if session.stop_requested() && ended_by_stop(&e) => {
            debug!("Stream cut short after stop request: {}", e);
            let stats = dispatcher.stats();
            info!(
                "Session stopped: {} events, {} lines written",
                stats.events_seen, stats.lines_written
            );
            Ok(stats)
        }
        Err(e) => Err(e).context("Trace stream failed"),
    }
}

/// Failures a stop request is expected to cause mid-stream
pub fn ended_by_stop(err: &DecodeError) -> bool {
    match err {
        DecodeError::Truncated { .. } => true,
        DecodeError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}
