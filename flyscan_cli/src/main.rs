//! `flyscan`: drive the fly-scan engine against simulated hardware.

mod cli;
mod error_fmt;
mod rig;
mod scan;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use eyre::Result;
use flyscan_core::RunOutcome;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::{Cli, Commands, FILE_GUARD, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};
use crate::scan::ScanOverrides;

/// Exit code for a scan stopped by Ctrl-C.
const EXIT_ABORTED: i32 = 130;

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    let _ = color_eyre::install();

    match real_main(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if cli::json_mode() {
                eprintln!("{}", format_error_json(&e));
            } else {
                eprintln!("{}", humanize(&e));
            }
            std::process::exit(exit_code_for_error(&e));
        }
    }
}

fn real_main(cli: Cli) -> Result<i32> {
    // Logging needs [logging] from the config; a config that fails to load
    // is reported through the console-only subscriber.
    let cfg = match rig::load_config(&cli.config, cli.motors.as_deref()) {
        Ok(cfg) => {
            init_tracing(cli.json, &cli.log_level, Some(&cfg.logging))?;
            cfg
        }
        Err(e) => {
            init_tracing(cli.json, &cli.log_level, None)?;
            return Err(e);
        }
    };
    tracing::debug!(config = %cli.config.display(), motors = cfg.motors.len(), "config loaded");

    match cli.cmd {
        Commands::Scan {
            duration,
            exposure,
            time_scale,
            pause_at,
        } => {
            let shutdown = Arc::new(AtomicBool::new(false));
            {
                let flag = Arc::clone(&shutdown);
                ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
                    .map_err(|e| eyre::eyre!("install Ctrl-C handler: {e}"))?;
            }
            let overrides = ScanOverrides {
                duration,
                exposure,
                time_scale,
                pause_at,
            };
            let (outcome, status) = scan::run_scan(cfg, overrides, shutdown)?;
            if outcome == RunOutcome::Aborted {
                if cli::json_mode() {
                    eprintln!("{}", serde_json::json!({ "reason": "Aborted", "completed_steps": status.completed_steps }));
                } else {
                    eprintln!("scan aborted after {} of {} steps", status.completed_steps, status.total_steps);
                }
                return Ok(EXIT_ABORTED);
            }
            if !cli::json_mode() {
                println!("scan complete: {} of {} steps", status.completed_steps, status.total_steps);
            }
        }
        Commands::Validate => scan::validate(&cfg)?,
        Commands::Plan { limit } => {
            let samples = scan::plan(&cfg, limit)?;
            if !cli::json_mode() {
                println!("{samples} samples");
            }
        }
        Commands::SelfCheck => scan::self_check(&cfg)?,
    }
    Ok(0)
}

/// Console subscriber (pretty or JSON lines, on stderr) plus an optional
/// non-blocking file appender. `RUST_LOG` overrides the level.
fn init_tracing(json: bool, cli_level: &str, logging: Option<&flyscan_config::Logging>) -> Result<()> {
    let level = logging
        .and_then(|l| l.level.as_deref())
        .filter(|_| cli_level == "info")
        .unwrap_or(cli_level);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let console = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_target(false).with_writer(std::io::stderr).boxed()
    };

    let file = match logging.and_then(|l| l.file.as_deref()) {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let name = path.file_name().ok_or_else(|| eyre::eyre!("logging.file has no file name"))?;
            let appender = match logging.and_then(|l| l.rotation.as_deref()) {
                Some("daily") => tracing_appender::rolling::daily(dir, name),
                Some("hourly") => tracing_appender::rolling::hourly(dir, name),
                _ => tracing_appender::rolling::never(dir, name),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().json().with_ansi(false).with_writer(writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| eyre::eyre!("install tracing subscriber: {e}"))
}
