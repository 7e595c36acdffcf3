//! Subcommand bodies: scan execution, validation, trajectory dump and self-check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel as xch;
use eyre::{Result, WrapErr};
use flyscan_config::Config;
use flyscan_core::config::SequencerCfg;
use flyscan_core::controller::steps_per_run;
use flyscan_core::motor::cs_axis_mapping;
use flyscan_core::parts::DETECTORS;
use flyscan_core::profile::TriggerMode;
use flyscan_core::trajectory::TrajectoryPlanner;
use flyscan_core::{Controller, RunOutcome, ScanState, ScanStatus};
use flyscan_traits::{MotionController, ProfileWrite};
use serde_json::json;

use crate::cli::json_mode;
use crate::rig::{self, DETECTOR};

/// Scan-section overrides given on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOverrides {
    pub duration: Option<f64>,
    pub exposure: Option<f64>,
    pub time_scale: Option<f64>,
    pub pause_at: Option<usize>,
}

fn apply_overrides(cfg: &mut Config, o: ScanOverrides) -> Result<()> {
    if let Some(scan) = cfg.scan.as_mut() {
        if let Some(d) = o.duration {
            scan.duration = d;
        }
        if let Some(e) = o.exposure {
            scan.exposure = e;
        }
        scan.validate().wrap_err("invalid scan overrides")?;
    }
    if let Some(ts) = o.time_scale
        && !(ts.is_finite() && ts > 0.0)
    {
        eyre::bail!("--time-scale must be > 0");
    }
    Ok(())
}

fn print_status(st: &ScanStatus) {
    if json_mode() {
        if let Ok(line) = serde_json::to_string(st) {
            println!("{line}");
        }
    } else {
        tracing::info!(
            state = %st.state,
            completed = st.completed_steps,
            configured = st.configured_steps,
            total = st.total_steps,
            "status"
        );
    }
}

/// Forward status updates until `done` fires; pauses the scan once when it
/// passes `pause_at`.
fn watch(controller: Controller, done: xch::Receiver<()>, pause_at: Option<usize>) -> std::thread::JoinHandle<()> {
    let statuses = controller.subscribe();
    std::thread::spawn(move || {
        let mut pause_at = pause_at;
        loop {
            xch::select! {
                recv(statuses) -> st => {
                    let Ok(st) = st else { return };
                    print_status(&st);
                    if let Some(step) = pause_at
                        && st.state == ScanState::Running
                        && st.completed_steps >= step
                    {
                        pause_at = None;
                        tracing::info!(step, "pausing");
                        if let Err(e) = controller.pause(step) {
                            tracing::warn!(error = %e, "pause failed");
                        }
                    }
                }
                recv(done) -> _ => {
                    for st in statuses.try_iter() {
                        print_status(&st);
                    }
                    return;
                }
            }
        }
    })
}

/// Run the scan to completion, re-running through breakpoints and resuming
/// after a pause. An abort (Ctrl-C) ends the loop with `Aborted`.
pub fn run_scan(mut cfg: Config, overrides: ScanOverrides, shutdown: Arc<AtomicBool>) -> Result<(RunOutcome, ScanStatus)> {
    apply_overrides(&mut cfg, overrides)?;
    let params = rig::scan_section(&cfg)?;
    let time_scale = overrides.time_scale.unwrap_or(cfg.simulator.time_scale);
    let rig = rig::build(&cfg, time_scale)?;
    let controller = rig.controller.clone();

    {
        let c = controller.clone();
        let flag = Arc::clone(&shutdown);
        std::thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(20));
            }
            if c.state().abortable() {
                tracing::warn!("interrupt received, aborting scan");
                if let Err(e) = c.abort() {
                    tracing::warn!(error = %e, "abort failed");
                }
            }
        });
    }

    let (done_tx, done_rx) = xch::bounded(1);
    let watcher = watch(controller.clone(), done_rx, overrides.pause_at);

    let result = drive(&controller, params, &shutdown);
    let _ = done_tx.send(());
    let _ = watcher.join();
    let outcome = result?;

    let st = controller.status();
    tracing::info!(
        outcome = ?outcome,
        completed = st.completed_steps,
        total = st.total_steps,
        samples_loaded = rig.pmac.samples_loaded(),
        "scan done"
    );
    Ok((outcome, st))
}

fn drive(controller: &Controller, params: flyscan_core::ConfigureParams, shutdown: &AtomicBool) -> Result<RunOutcome> {
    controller.configure(params)?;
    let mut outcome = controller.run()?;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(RunOutcome::Aborted);
        }
        outcome = match outcome {
            RunOutcome::Armed => controller.run()?,
            RunOutcome::Paused => {
                wait_until_paused(controller)?;
                controller.resume()?
            }
            RunOutcome::Finished | RunOutcome::Aborted => return Ok(outcome),
        };
    }
}

/// A run ends as soon as a pause stops it; the seek that follows may
/// still be in progress.
fn wait_until_paused(controller: &Controller) -> Result<()> {
    let statuses = controller.subscribe();
    loop {
        match statuses.recv_timeout(Duration::from_secs(30)) {
            Ok(st) if st.state == ScanState::Paused => return Ok(()),
            Ok(st) if st.state == ScanState::Seeking => {}
            Ok(st) => eyre::bail!("scan left pause as {}", st.state),
            Err(_) => eyre::bail!("timed out waiting for the scan to pause"),
        }
    }
}

/// Validate the config, then the scan through the controller's tweak loop.
pub fn validate(cfg: &Config) -> Result<()> {
    let Some(scan) = &cfg.scan else {
        if json_mode() {
            println!("{}", json!({ "ok": true, "scan": null }));
        } else {
            println!("config ok (no [scan] section)");
        }
        return Ok(());
    };
    let params = rig::scan_section(cfg)?;
    let rig = rig::build(cfg, cfg.simulator.time_scale)?;
    let validated = rig.controller.validate(params)?;
    let exposure = validated
        .get(DETECTORS)
        .and_then(|rows| rows.get(0).and_then(|r| r.get("exposure")).and_then(serde_json::Value::as_f64));
    let steps = validated.generator.size();
    if json_mode() {
        println!(
            "{}",
            json!({
                "ok": true,
                "steps": steps,
                "duration": validated.generator.duration,
                "exposure": exposure,
                "axes_to_move": validated.axes_to_move,
            })
        );
    } else {
        println!("config ok: {steps} steps over {} lines", scan.lines.len());
        println!("duration: {:.6} s", validated.generator.duration);
        if let Some(e) = exposure {
            println!("{DETECTOR} exposure: {e:.6} s");
        }
    }
    Ok(())
}

/// Plan every run of the scan offline and print its profile samples.
pub fn plan(cfg: &Config, limit: Option<usize>) -> Result<usize> {
    let params = rig::scan_section(cfg)?;
    let rig = rig::build(cfg, cfg.simulator.time_scale)?;
    let validated = rig.controller.validate(params)?;
    let generator = validated.generator.clone();
    if generator.duration <= 0.0 {
        eyre::bail!("trajectory scans need a fixed point duration");
    }

    let axes: Vec<String> = generator
        .axes()
        .into_iter()
        .filter(|a| validated.axes_to_move.contains(a))
        .collect();
    let pmac: &dyn MotionController = &rig.pmac;
    let (cs_port, mapping) = cs_axis_mapping(pmac, &axes)?;
    let planner_cfg = flyscan_core::config::PlannerCfg::from(&cfg.planner);
    // The rig's sequencer gates the detector, so its row trigger picks the outputs.
    let mode = TriggerMode::from(SequencerCfg::try_from(&cfg.sequencer)?.row_trigger);
    let mut planner = TrajectoryPlanner::new(planner_cfg, generator.clone(), mapping, mode);

    let runs = steps_per_run(&generator, &validated.axes_to_move, &validated.breakpoints)?;
    let limit = limit.unwrap_or(usize::MAX);
    let mut index = 0;
    let mut completed = 0;
    'runs: for (segment, steps) in runs.into_iter().enumerate() {
        planner.start(completed, steps);
        tracing::debug!(segment, completed, steps, cs_port = %cs_port, "planning run");
        while !planner.all_written() {
            planner.emit()?;
            let Some(chunk) = planner.take_chunk() else {
                continue;
            };
            for line in sample_lines(&chunk, segment, index) {
                if index >= limit {
                    break 'runs;
                }
                if json_mode() {
                    println!("{line}");
                } else {
                    println!("{}", render_plain(&line));
                }
                index += 1;
            }
        }
        completed += steps;
    }
    tracing::info!(samples = index, "trajectory planned");
    Ok(index)
}

fn sample_lines(chunk: &ProfileWrite, segment: usize, first: usize) -> Vec<serde_json::Value> {
    (0..chunk.len())
        .map(|i| {
            let positions: serde_json::Map<String, serde_json::Value> = chunk
                .positions
                .iter()
                .filter_map(|(axis, values)| values.get(i).map(|v| (axis.to_string(), json!(v))))
                .collect();
            json!({
                "index": first + i,
                "segment": segment,
                "ticks": chunk.time_array[i],
                "velocity_mode": chunk.velocity_mode[i],
                "user_program": chunk.user_programs[i],
                "positions": positions,
            })
        })
        .collect()
}

fn render_plain(line: &serde_json::Value) -> String {
    let positions = line["positions"]
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| format!("{k}={:.6}", v.as_f64().unwrap_or(f64::NAN)))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    format!(
        "{:>6} {:>9}us {:<22} {:<10} {positions}",
        line["index"],
        line["ticks"],
        line["velocity_mode"].as_str().unwrap_or("?"),
        line["user_program"].as_str().unwrap_or("?"),
    )
}

/// Build the rig and report what the controller can scan.
pub fn self_check(cfg: &Config) -> Result<()> {
    let rig = rig::build(cfg, cfg.simulator.time_scale)?;
    let pmac: &dyn MotionController = &rig.pmac;
    let i10 = pmac.i10().map_err(|e| eyre::eyre!("read i10: {e}"))?;
    let layout = pmac.layout().map_err(|e| eyre::eyre!("read layout: {e}"))?;
    let mris: Vec<&str> = rig.process.mris().collect();
    if json_mode() {
        let motors: Vec<_> = layout.iter().map(|r| json!({ "name": r.name, "mri": r.mri })).collect();
        println!(
            "{}",
            json!({ "ok": true, "controllers": mris, "i10": i10, "motors": motors, "state": rig.controller.state() })
        );
    } else {
        println!("ok: controllers {}", mris.join(", "));
        println!("servo i10: {i10}");
        for row in &layout {
            println!("motor {} ({})", row.name, row.mri);
        }
    }
    Ok(())
}
