#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas for the scan engine.
//!
//! - `Config` and its sections are deserialized from TOML and validated.
//! - Motor tables may also come from a CSV file with fixed headers.
use std::collections::BTreeSet;

use serde::Deserialize;

/// Row trigger names accepted by `[sequencer] row_trigger`.
pub const ROW_TRIGGERS: [&str; 3] = ["position_compare", "motion_controller", "none"];

/// CS axis letters a motor may be assigned to.
pub const CS_AXES: &str = "ABCUVWXYZ";

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PlannerCfg {
    /// Profile samples to keep written ahead of execution
    pub profile_points: usize,
    /// Scan points fetched from the generator at a time
    pub batch_points: usize,
    /// Longest single profile segment before it is split (s)
    pub max_move_time_s: f64,
    /// Shortest interval between profile samples (s)
    pub min_interval_s: f64,
    /// Shortest turnaround between rows (s)
    pub min_turnaround_s: f64,
}

impl Default for PlannerCfg {
    fn default() -> Self {
        Self {
            profile_points: 10_000,
            batch_points: 4_000,
            max_move_time_s: 4.0,
            min_interval_s: 0.002,
            min_turnaround_s: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SequencerCfg {
    /// Rows per hardware table
    pub table_rows: usize,
    /// Largest repeat count of one row
    pub max_repeats: u32,
    /// A table is filled until it runs at least this long (s)
    pub min_table_duration_s: f64,
    /// "position_compare" | "motion_controller" | "none"
    pub row_trigger: String,
}

impl Default for SequencerCfg {
    fn default() -> Self {
        Self {
            table_rows: 4096,
            max_repeats: 4096,
            min_table_duration_s: 15.0,
            row_trigger: "position_compare".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControllerCfg {
    pub mri: String,
    /// Bound on every hardware wait (ms)
    pub default_timeout_ms: u64,
    /// Validate rounds before giving up on converging tweaks
    pub tweak_iterations: usize,
}

impl Default for ControllerCfg {
    fn default() -> Self {
        Self {
            mri: "SCAN".to_string(),
            default_timeout_ms: 10_000,
            tweak_iterations: 10,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Simulator {
    /// Simulated seconds per wall-clock second
    pub time_scale: f64,
    /// Servo interrupt divider reported by the simulated controller
    pub i10: u32,
    /// Coordinate system used by scans that move no axes
    pub cs_port: String,
    /// Simulated detector readout (s)
    pub readout_time_s: f64,
    pub frequency_accuracy_ppm: f64,
}

impl Default for Simulator {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            i10: 1_705_244,
            cs_port: "CS1".to_string(),
            readout_time_s: 0.002,
            frequency_accuracy_ppm: 50.0,
        }
    }
}

/// One motor in the motion controller layout.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MotorCfg {
    pub name: String,
    /// "CS1,A" style assignment
    pub cs: String,
    pub max_velocity: f64,
    pub acceleration_time: f64,
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    #[serde(default)]
    pub offset: f64,
    /// Starting position (EGU)
    #[serde(default)]
    pub readback: f64,
    #[serde(default)]
    pub velocity_settle: f64,
    #[serde(default = "default_units")]
    pub units: String,
    /// Soft limits; both 0 disables them
    #[serde(default)]
    pub low_limit: f64,
    #[serde(default)]
    pub high_limit: f64,
    #[serde(default = "default_velocity_percent")]
    pub max_velocity_percent: f64,
    /// Sequencer position bus ("A" | "B" | "C") carrying this axis' encoder
    #[serde(default)]
    pub encoder: Option<String>,
    #[serde(default)]
    pub encoder_scale: Option<f64>,
    #[serde(default)]
    pub encoder_offset: f64,
}

fn default_resolution() -> f64 {
    0.001
}

fn default_units() -> String {
    "mm".to_string()
}

fn default_velocity_percent() -> f64 {
    100.0
}

impl MotorCfg {
    /// Split the CS assignment into port and axis letter.
    pub fn cs_parts(&self) -> Option<(&str, char)> {
        let (port, axis) = self.cs.split_once(',')?;
        let mut chars = axis.trim().chars();
        let letter = chars.next()?.to_ascii_uppercase();
        if port.trim().is_empty() || chars.next().is_some() || !CS_AXES.contains(letter) {
            return None;
        }
        Some((port.trim(), letter))
    }

    /// EGU per encoder count; defaults to the motor resolution.
    pub fn encoder_scale(&self) -> f64 {
        self.encoder_scale.unwrap_or(self.resolution)
    }
}

/// One line dimension of the scan, outermost first.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LineCfg {
    pub axis: String,
    #[serde(default = "default_units")]
    pub units: String,
    pub start: f64,
    pub stop: f64,
    pub size: usize,
    /// Reverse every other pass (snake)
    #[serde(default)]
    pub alternate: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ScanCfg {
    /// Line dimensions, outermost first
    pub lines: Vec<LineCfg>,
    /// Points that move nothing, innermost; 0 leaves them out
    pub static_points: usize,
    /// Seconds per point; 0 lets the detector fix it from `exposure`
    pub duration: f64,
    pub delay_after: f64,
    /// Defaults to every line axis
    pub axes_to_move: Option<Vec<String>>,
    pub breakpoints: Vec<usize>,
    /// Detector exposure (s); 0 uses the longest that fits
    pub exposure: f64,
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub planner: PlannerCfg,
    #[serde(default)]
    pub sequencer: SequencerCfg,
    #[serde(default)]
    pub controller: ControllerCfg,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub simulator: Simulator,
    #[serde(default)]
    pub motors: Vec<MotorCfg>,
    /// Optional CSV motor table appended to `motors`
    #[serde(default)]
    pub motors_csv: Option<String>,
    /// Scan to run when none is given on the command line
    #[serde(default)]
    pub scan: Option<ScanCfg>,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Motor table CSV schema.
///
/// Expected headers:
/// name,cs,max_velocity,acceleration_time,resolution,units,encoder
///
/// Example:
/// name,cs,max_velocity,acceleration_time,resolution,units,encoder
/// x,"CS1,A",1.0,0.4,0.001,mm,A
#[derive(Debug, Deserialize, Clone)]
struct MotorRow {
    name: String,
    cs: String,
    max_velocity: f64,
    acceleration_time: f64,
    resolution: f64,
    units: String,
    encoder: Option<String>,
}

const MOTOR_HEADERS: [&str; 7] = [
    "name",
    "cs",
    "max_velocity",
    "acceleration_time",
    "resolution",
    "units",
    "encoder",
];

impl From<MotorRow> for MotorCfg {
    fn from(r: MotorRow) -> Self {
        Self {
            name: r.name,
            cs: r.cs,
            max_velocity: r.max_velocity,
            acceleration_time: r.acceleration_time,
            resolution: r.resolution,
            offset: 0.0,
            readback: 0.0,
            velocity_settle: 0.0,
            units: r.units,
            low_limit: 0.0,
            high_limit: 0.0,
            max_velocity_percent: default_velocity_percent(),
            encoder: r.encoder.filter(|e| !e.trim().is_empty()),
            encoder_scale: None,
            encoder_offset: 0.0,
        }
    }
}

pub fn load_motors_csv(path: &std::path::Path) -> eyre::Result<Vec<MotorCfg>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open motor CSV {:?}: {}", path, e))?;

    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let actual: Vec<&str> = headers.iter().collect();
    if actual != MOTOR_HEADERS {
        eyre::bail!(
            "motor CSV must have headers '{}', got: {}",
            MOTOR_HEADERS.join(","),
            actual.join(",")
        );
    }

    let mut motors = Vec::new();
    for (idx, rec) in rdr.deserialize::<MotorRow>().enumerate() {
        match rec {
            Ok(row) => motors.push(MotorCfg::from(row)),
            Err(e) => eyre::bail!("invalid CSV row {}: {}", idx + 2, e),
        }
    }
    Ok(motors)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Planner
        if self.planner.profile_points == 0 {
            eyre::bail!("planner.profile_points must be >= 1");
        }
        if self.planner.batch_points == 0 {
            eyre::bail!("planner.batch_points must be >= 1");
        }
        if self.planner.max_move_time_s <= 0.0 {
            eyre::bail!("planner.max_move_time_s must be > 0");
        }
        if self.planner.min_interval_s <= 0.0 {
            eyre::bail!("planner.min_interval_s must be > 0");
        }
        if self.planner.min_turnaround_s < 0.0 {
            eyre::bail!("planner.min_turnaround_s must be >= 0");
        }

        // Sequencer
        if self.sequencer.table_rows < 4 {
            eyre::bail!("sequencer.table_rows must be >= 4");
        }
        if self.sequencer.max_repeats == 0 {
            eyre::bail!("sequencer.max_repeats must be >= 1");
        }
        if self.sequencer.min_table_duration_s < 0.0 {
            eyre::bail!("sequencer.min_table_duration_s must be >= 0");
        }
        if !ROW_TRIGGERS.contains(&self.sequencer.row_trigger.as_str()) {
            eyre::bail!(
                "sequencer.row_trigger must be one of {:?}, got {:?}",
                ROW_TRIGGERS,
                self.sequencer.row_trigger
            );
        }

        // Controller
        if self.controller.mri.trim().is_empty() {
            eyre::bail!("controller.mri must not be empty");
        }
        if self.controller.default_timeout_ms == 0 {
            eyre::bail!("controller.default_timeout_ms must be >= 1");
        }
        if self.controller.tweak_iterations == 0 {
            eyre::bail!("controller.tweak_iterations must be >= 1");
        }

        // Logging
        if let Some(rotation) = &self.logging.rotation
            && !matches!(rotation.as_str(), "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be never, daily or hourly");
        }

        // Simulator
        if self.simulator.time_scale <= 0.0 {
            eyre::bail!("simulator.time_scale must be > 0");
        }
        if self.simulator.i10 == 0 {
            eyre::bail!("simulator.i10 must be >= 1");
        }
        if self.simulator.readout_time_s < 0.0 {
            eyre::bail!("simulator.readout_time_s must be >= 0");
        }

        self.validate_motors()?;
        if let Some(scan) = &self.scan {
            scan.validate()?;
        }
        Ok(())
    }

    fn validate_motors(&self) -> eyre::Result<()> {
        let mut names = BTreeSet::new();
        let mut axes = BTreeSet::new();
        for m in &self.motors {
            if !names.insert(m.name.as_str()) {
                eyre::bail!("motor {} is listed twice", m.name);
            }
            let Some((port, letter)) = m.cs_parts() else {
                eyre::bail!("motor {}: cs must look like \"CS1,A\", got {:?}", m.name, m.cs);
            };
            if !axes.insert((port.to_string(), letter)) {
                eyre::bail!("motor {}: CS axis {port},{letter} is already assigned", m.name);
            }
            if m.max_velocity <= 0.0 {
                eyre::bail!("motor {}: max_velocity must be > 0", m.name);
            }
            if m.acceleration_time <= 0.0 {
                eyre::bail!("motor {}: acceleration_time must be > 0", m.name);
            }
            if m.resolution == 0.0 || !m.resolution.is_finite() {
                eyre::bail!("motor {}: resolution must be non-zero", m.name);
            }
            if !(m.max_velocity_percent > 0.0 && m.max_velocity_percent <= 100.0) {
                eyre::bail!("motor {}: max_velocity_percent must be in (0, 100]", m.name);
            }
            if m.low_limit > m.high_limit {
                eyre::bail!("motor {}: low_limit is above high_limit", m.name);
            }
            if let Some(enc) = &m.encoder
                && !matches!(enc.as_str(), "A" | "B" | "C")
            {
                eyre::bail!("motor {}: encoder must be A, B or C", m.name);
            }
            if m.encoder_scale() == 0.0 {
                eyre::bail!("motor {}: encoder_scale must be non-zero", m.name);
            }
        }
        Ok(())
    }
}

impl ScanCfg {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.duration < 0.0 {
            eyre::bail!("scan.duration must be >= 0");
        }
        if self.duration == 0.0 && self.exposure <= 0.0 {
            eyre::bail!("scan.duration must be > 0 unless scan.exposure is set");
        }
        if self.delay_after < 0.0 {
            eyre::bail!("scan.delay_after must be >= 0");
        }
        if self.exposure < 0.0 {
            eyre::bail!("scan.exposure must be >= 0");
        }
        if self.lines.is_empty() && self.static_points == 0 {
            eyre::bail!("scan needs at least one line or static_points");
        }
        let mut seen = BTreeSet::new();
        for line in &self.lines {
            if line.size == 0 {
                eyre::bail!("scan line {}: size must be >= 1", line.axis);
            }
            if !seen.insert(line.axis.as_str()) {
                eyre::bail!("scan axis {} appears in two lines", line.axis);
            }
        }
        if self.breakpoints.contains(&0) {
            eyre::bail!("scan.breakpoints must all be >= 1");
        }
        Ok(())
    }

    /// Axes the scan may move: explicit, or every line axis.
    pub fn axes_to_move(&self) -> Vec<String> {
        self.axes_to_move
            .clone()
            .unwrap_or_else(|| self.lines.iter().map(|l| l.axis.clone()).collect())
    }
}
