//! `From` implementations bridging `flyscan_config` types to `flyscan_core` types.

use std::time::Duration;

use flyscan_traits::MotorRecord;

use crate::config::{ControllerCfg, PlannerCfg, RowTrigger, SequencerCfg};
use crate::error::{Result, ScanError};
use crate::generator::{CompoundGenerator, Dimension, LineGenerator, StaticPointGenerator};
use crate::params::ConfigureParams;
use crate::seq_builder::PositionCapture;

// ── PlannerCfg ───────────────────────────────────────────────────────────────

impl From<&flyscan_config::PlannerCfg> for PlannerCfg {
    fn from(c: &flyscan_config::PlannerCfg) -> Self {
        Self {
            profile_points: c.profile_points,
            batch_points: c.batch_points,
            max_move_time: c.max_move_time_s,
            min_interval: c.min_interval_s,
            min_turnaround: c.min_turnaround_s,
        }
    }
}

// ── SequencerCfg ─────────────────────────────────────────────────────────────

impl std::str::FromStr for RowTrigger {
    type Err = ScanError;

    fn from_str(s: &str) -> std::result::Result<Self, ScanError> {
        match s {
            "position_compare" => Ok(Self::PositionCompare),
            "motion_controller" => Ok(Self::MotionController),
            "none" => Ok(Self::None),
            other => Err(ScanError::Config(format!("unknown row trigger {other:?}"))),
        }
    }
}

impl TryFrom<&flyscan_config::SequencerCfg> for SequencerCfg {
    type Error = ScanError;

    fn try_from(c: &flyscan_config::SequencerCfg) -> std::result::Result<Self, ScanError> {
        Ok(Self {
            table_rows: c.table_rows,
            max_repeats: c.max_repeats,
            min_table_duration: c.min_table_duration_s,
            row_trigger: c.row_trigger.parse()?,
        })
    }
}

// ── ControllerCfg ────────────────────────────────────────────────────────────

impl From<&flyscan_config::ControllerCfg> for ControllerCfg {
    fn from(c: &flyscan_config::ControllerCfg) -> Self {
        Self {
            mri: c.mri.clone(),
            default_timeout: Duration::from_millis(c.default_timeout_ms),
            tweak_iterations: c.tweak_iterations,
        }
    }
}

// ── Motors ───────────────────────────────────────────────────────────────────

/// Motor record the simulated controller serves for a configured motor.
pub fn motor_record(m: &flyscan_config::MotorCfg) -> MotorRecord {
    MotorRecord {
        cs: m.cs.clone(),
        max_velocity: m.max_velocity,
        max_velocity_percent: m.max_velocity_percent,
        acceleration_time: m.acceleration_time,
        resolution: m.resolution,
        offset: m.offset,
        readback: m.readback,
        velocity_settle: m.velocity_settle,
        units: m.units.clone(),
        user_low_limit: m.low_limit,
        user_high_limit: m.high_limit,
    }
}

/// Position capture of a motor whose encoder is wired to a sequencer bus.
pub fn position_capture(m: &flyscan_config::MotorCfg) -> Option<PositionCapture> {
    let bus = m.encoder.as_deref()?.chars().next()?.to_ascii_uppercase();
    Some(PositionCapture {
        bus,
        scale: m.encoder_scale(),
        offset: m.encoder_offset,
    })
}

// ── Scan ─────────────────────────────────────────────────────────────────────

impl From<&flyscan_config::LineCfg> for LineGenerator {
    fn from(l: &flyscan_config::LineCfg) -> Self {
        Self::new(&l.axis, &l.units, l.start, l.stop, l.size, l.alternate)
    }
}

impl From<&flyscan_config::ScanCfg> for CompoundGenerator {
    fn from(s: &flyscan_config::ScanCfg) -> Self {
        let mut dims: Vec<Dimension> = s.lines.iter().map(|l| LineGenerator::from(l).into()).collect();
        if s.static_points > 0 {
            dims.push(StaticPointGenerator::new(s.static_points).into());
        }
        Self::new(dims, s.duration).with_delay_after(s.delay_after)
    }
}

/// Configure parameters for a scan section; `exposure` goes to every
/// detector named in `detectors`.
pub fn scan_params(s: &flyscan_config::ScanCfg, detectors: &[&str]) -> Result<ConfigureParams> {
    let generator = CompoundGenerator::from(s);
    generator.prepare()?;
    let rows: Vec<serde_json::Value> = detectors
        .iter()
        .map(|name| serde_json::json!({ "name": name, "enable": true, "exposure": s.exposure }))
        .collect();
    let mut params = ConfigureParams::new(generator, s.axes_to_move()).with_breakpoints(s.breakpoints.clone());
    if !rows.is_empty() {
        params = params.with(crate::parts::DETECTORS, serde_json::Value::Array(rows));
    }
    Ok(params)
}
