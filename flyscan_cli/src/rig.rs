//! Config loading and assembly of the simulated beamline.

use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use flyscan_config::Config;
use flyscan_core::config::{ControllerCfg, PlannerCfg, SequencerCfg};
use flyscan_core::conversions::{motor_record, position_capture, scan_params};
use flyscan_core::parts::{DetectorPart, SequencerPart, TrajectoryPart};
use flyscan_core::{ConfigureParams, Controller, Process, ScanSettings};
use flyscan_hardware::{SimDetector, SimMotionController, sim_sequencer_pair};
use flyscan_traits::{Clock, MonotonicClock};

/// Name of the simulated detector part.
pub const DETECTOR: &str = "det";

/// Read, merge and validate the config. A motor CSV given on the command
/// line wins over `motors_csv`; relative CSV paths resolve against the
/// config file's directory.
pub fn load_config(path: &Path, motors_csv: Option<&Path>) -> Result<Config> {
    let text = std::fs::read_to_string(path).wrap_err_with(|| format!("read config {}", path.display()))?;
    let mut cfg = flyscan_config::load_toml(&text).wrap_err("parse config TOML")?;

    let csv = motors_csv.map(Path::to_path_buf).or_else(|| {
        cfg.motors_csv.as_ref().map(|p| {
            let p = Path::new(p);
            if p.is_relative() {
                path.parent().unwrap_or_else(|| Path::new(".")).join(p)
            } else {
                p.to_path_buf()
            }
        })
    });
    if let Some(csv) = csv {
        let motors = flyscan_config::load_motors_csv(&csv)?;
        tracing::debug!(path = %csv.display(), count = motors.len(), "motor table loaded");
        cfg.motors.extend(motors);
    }

    cfg.validate().wrap_err("invalid configuration")?;
    Ok(cfg)
}

/// The simulated controller and the handles the CLI inspects.
pub struct Rig {
    pub process: Process,
    pub controller: Controller,
    pub pmac: SimMotionController,
}

/// Build the simulators and the scan controller they sit under.
pub fn build(cfg: &Config, time_scale: f64) -> Result<Rig> {
    let clock: Arc<dyn Clock + Send + Sync> = Arc::new(MonotonicClock::new());
    let sim = &cfg.simulator;

    let mut pmac = SimMotionController::new(Arc::clone(&clock), time_scale).with_i10(sim.i10);
    for m in &cfg.motors {
        pmac = pmac.with_motor(&m.name, &format!("{}:{}", cfg.controller.mri, m.name), motor_record(m));
    }
    let (a, b, gate) = sim_sequencer_pair(Arc::clone(&clock), time_scale);
    let det = SimDetector::new(clock, time_scale, sim.readout_time_s, sim.frequency_accuracy_ppm);

    let planner = PlannerCfg::from(&cfg.planner);
    let trajectory = TrajectoryPart::new("pmac", Box::new(pmac.clone()), planner.clone())
        .with_default_cs_port(&sim.cs_port);
    let mut sequencer = SequencerPart::new(
        "panda",
        Box::new(a),
        Box::new(b),
        Box::new(gate),
        SequencerCfg::try_from(&cfg.sequencer)?,
    );
    for m in &cfg.motors {
        if let Some(capture) = position_capture(m) {
            sequencer = sequencer.with_capture(&m.name, capture);
        }
    }

    let controller = Controller::new(
        ControllerCfg::from(&cfg.controller),
        vec![
            Box::new(trajectory),
            Box::new(sequencer),
            Box::new(DetectorPart::new(DETECTOR, Box::new(det))),
        ],
    );
    controller.set_settings(ScanSettings {
        min_turnaround: planner.min_turnaround,
        min_interval: planner.min_interval,
        ..ScanSettings::default()
    });

    let mut process = Process::new();
    process.add_controller(controller.clone())?;
    tracing::info!(mri = %controller.mri(), motors = cfg.motors.len(), time_scale, "simulated rig ready");
    Ok(Rig {
        process,
        controller,
        pmac,
    })
}

/// Configure parameters for the config's `[scan]` section.
pub fn scan_section(cfg: &Config) -> Result<ConfigureParams> {
    let scan = cfg.scan.as_ref().ok_or_else(|| eyre::eyre!("config has no [scan] section"))?;
    scan_params(scan, &[DETECTOR])
}
