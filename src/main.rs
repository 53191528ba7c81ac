//! eventpiper CLI
//!
//! Prints the HTTP requests and responses a .NET process makes, live,
//! from its DiagnosticSource events.

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use eventpiper::commands::{execute_trace, validate_args, TraceArgs};
use eventpiper::dispatch::OutputFormat;
use eventpiper::utils::config::{DEFAULT_ACCEPT_TIMEOUT, DEFAULT_BUFFER_SIZE_MB};
use std::time::Duration;

/// eventpiper - live HTTP log of a .NET process
#[derive(Parser, Debug)]
#[command(name = "eventpiper")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Pid of a running process, or a program to launch
    target: String,

    /// Arguments for the launched program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output format: text or json
    #[arg(short, long, default_value = "text", env = "EVENTPIPER_FORMAT")]
    format: OutputFormat,

    /// Seconds a launched runtime gets to connect back
    #[arg(long, default_value_t = DEFAULT_ACCEPT_TIMEOUT.as_secs(), env = "EVENTPIPER_ACCEPT_TIMEOUT")]
    accept_timeout: u64,

    /// Runtime-side event buffer size in MB
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE_MB, env = "EVENTPIPER_BUFFER_SIZE")]
    buffer_size: u32,
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let mut args = TraceArgs::new(&cli.target, cli.args);
    args.format = cli.format;
    args.accept_timeout = Duration::from_secs(cli.accept_timeout);
    args.buffer_size_mb = cli.buffer_size;

    // Validate args first
    validate_args(&args)?;

    execute_trace(args)?;

    Ok(())
}
