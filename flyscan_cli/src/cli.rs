//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

pub fn json_mode() -> bool {
    JSON_MODE.get().copied().unwrap_or(false)
}

#[derive(Parser, Debug)]
#[command(name = "flyscan", version, about = "Fly-scan engine CLI (simulated hardware)")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/flyscan.toml")]
    pub config: PathBuf,

    /// Optional motor table CSV (strict header), appended to [[motors]]
    #[arg(long, value_name = "FILE")]
    pub motors: Option<PathBuf>,

    /// Log and report as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configure and run the [scan] section against the simulators
    Scan {
        /// Override scan.duration (seconds per point, 0 = let detectors decide)
        #[arg(long, value_name = "SECS")]
        duration: Option<f64>,
        /// Override scan.exposure (seconds, 0 = longest that fits)
        #[arg(long, value_name = "SECS")]
        exposure: Option<f64>,
        /// Simulated seconds per wall-clock second (overrides simulator.time_scale)
        #[arg(long, value_name = "FACTOR")]
        time_scale: Option<f64>,
        /// Pause after this many steps, then resume from there
        #[arg(long, value_name = "STEP")]
        pause_at: Option<usize>,
    },
    /// Validate the config and the [scan] section without moving anything
    Validate,
    /// Print the planned trajectory for the [scan] section as JSON lines
    Plan {
        /// Stop after this many samples
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Quick health check: build the simulated rig and list its motors
    SelfCheck,
}
