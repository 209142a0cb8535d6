//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Telemetry Plane - streaming data-plane service host
#[derive(Parser, Debug)]
#[command(
    name = "telemetry-plane",
    author,
    version,
    about = "Telemetry streaming data-plane",
    long_about = "Runs the batch ingestion engine and the dataset router against a broker.\n\n\
                  Source topics are drained into storage in windows (failures go to the DLQ),\n\
                  the global topic is fanned out to per-dataset topics."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "TELEMETRY_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "TELEMETRY_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the data-plane until a signal (or the synthetic load drains)
    Run(RunArgs),

    /// Validate configuration (file + environment) without running
    Validate(ValidateArgs),
}

/// Arguments for the `run` command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file (TOML or JSON); defaults only when omitted
    #[arg(short, long, env = "TELEMETRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the injected instance identity
    #[arg(long, env = "TELEMETRY_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Storage backend
    #[arg(long, value_enum, default_value = "memory", env = "TELEMETRY_STORAGE")]
    pub storage: StorageKind,

    /// Output directory for the jsonl storage backend
    #[arg(long, default_value = "data", env = "TELEMETRY_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Publish this many synthetic events, then exit once drained (0 = none)
    #[arg(long, default_value = "0", env = "TELEMETRY_SYNTHETIC_EVENTS")]
    pub synthetic_events: u64,

    /// Synthetic publish rate in events/second (0 = as fast as possible)
    #[arg(long, default_value = "0", env = "TELEMETRY_SYNTHETIC_RATE")]
    pub synthetic_rate: u64,

    /// Share of synthetic events with a malformed payload (0.0 - 1.0)
    #[arg(long, default_value = "0.0", env = "TELEMETRY_SYNTHETIC_MALFORMED_RATIO")]
    pub malformed_ratio: f64,

    /// Run timeout in seconds (0 = no timeout)
    #[arg(long, default_value = "0", env = "TELEMETRY_TIMEOUT")]
    pub timeout: u64,

    /// Health check period in milliseconds
    #[arg(long, default_value = "500", env = "TELEMETRY_HEALTH_INTERVAL_MS")]
    pub health_interval_ms: u64,

    /// Validate configuration and exit without running
    #[arg(long)]
    pub dry_run: bool,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "9000", env = "TELEMETRY_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate (environment only when omitted)
    #[arg(short, long, env = "TELEMETRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Storage backend selection
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageKind {
    /// In-memory store (lost on exit)
    #[default]
    Memory,
    /// One JSON-lines file per dataset under `--data-dir`
    Jsonl,
}

/// Log output format
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}
