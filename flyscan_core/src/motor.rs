//! Per-axis kinematic model and coordinate-system axis mapping.

use std::collections::{BTreeMap, BTreeSet};

use eyre::WrapErr;
use flyscan_traits::{MotionController, MotorRecord};

use crate::error::{Result, ScanError};
use crate::hw_error::hw_report;
use crate::velocity::{Limits, VelocityProfile};

/// Axis letters a coordinate system can expose.
pub const CS_AXIS_NAMES: [char; 9] = ['A', 'B', 'C', 'U', 'V', 'W', 'X', 'Y', 'Z'];

/// Immutable snapshot of one motor taken at configure.
#[derive(Debug, Clone, PartialEq)]
pub struct MotorInfo {
    pub cs_axis: char,
    pub cs_port: String,
    pub scannable: String,
    pub mri: String,
    /// EGU/s^2.
    pub acceleration: f64,
    /// EGU/s, already scaled by the max velocity percentage.
    pub max_velocity: f64,
    pub velocity_settle: f64,
    /// EGU per count.
    pub resolution: f64,
    pub offset: f64,
    pub units: String,
    pub low_limit: f64,
    pub high_limit: f64,
    pub current_position: f64,
}

impl MotorInfo {
    /// Build from a motor record whose `cs` field reads like `"CS1,A"`.
    pub fn from_record(scannable: &str, mri: &str, rec: &MotorRecord) -> Result<Self> {
        let (cs_port, cs_axis) = parse_cs(&rec.cs).ok_or_else(|| {
            ScanError::Config(format!("{scannable} is not assigned to a coordinate system (cs={:?})", rec.cs))
        })?;
        if !(rec.max_velocity > 0.0 && rec.acceleration_time > 0.0) {
            return Err(ScanError::Config(format!(
                "{scannable}: max_velocity {} and acceleration_time {} must be > 0",
                rec.max_velocity, rec.acceleration_time
            ))
            .into());
        }
        if rec.resolution == 0.0 {
            return Err(ScanError::Config(format!("{scannable}: resolution must be non-zero")).into());
        }
        let percent = if rec.max_velocity_percent > 0.0 { rec.max_velocity_percent } else { 100.0 };
        let max_velocity = rec.max_velocity * percent / 100.0;
        Ok(Self {
            cs_axis,
            cs_port,
            scannable: scannable.to_string(),
            mri: mri.to_string(),
            acceleration: max_velocity / rec.acceleration_time,
            max_velocity,
            velocity_settle: rec.velocity_settle,
            resolution: rec.resolution,
            offset: rec.offset,
            units: rec.units.clone(),
            low_limit: rec.user_low_limit,
            high_limit: rec.user_high_limit,
            current_position: rec.readback,
        })
    }

    /// Seconds to change velocity from `v1` to `v2` at full acceleration.
    pub fn acceleration_time(&self, v1: f64, v2: f64) -> f64 {
        (v2 - v1).abs() / self.acceleration
    }

    /// Distance covered while ramping from `v1` to `v2`.
    pub fn ramp_distance(&self, v1: f64, v2: f64) -> f64 {
        self.ramp_distance_over(v1, v2, self.acceleration_time(v1, v2))
    }

    /// Distance covered ramping linearly from `v1` to `v2` over `time`.
    pub fn ramp_distance_over(&self, v1: f64, v2: f64, time: f64) -> f64 {
        (v1 + v2) * time / 2.0
    }

    pub fn in_cts(&self, position: f64) -> i64 {
        ((position - self.offset) / self.resolution).round() as i64
    }

    pub fn in_egu(&self, counts: i64) -> f64 {
        counts as f64 * self.resolution + self.offset
    }

    pub fn limits(&self, min_interval: f64) -> Limits {
        Limits {
            acceleration: self.acceleration,
            max_velocity: self.max_velocity,
            settle: self.velocity_settle,
            min_interval,
        }
    }

    pub fn make_velocity_profile(
        &self,
        v1: f64,
        v2: f64,
        distance: f64,
        min_time: f64,
        min_interval: f64,
    ) -> VelocityProfile {
        VelocityProfile::solve(v1, v2, distance, min_time, self.limits(min_interval))
    }

    /// Whether soft limits are configured (a 0/0 pair means none).
    pub fn has_soft_limits(&self) -> bool {
        !(self.low_limit == 0.0 && self.high_limit == 0.0)
    }

    pub fn check_soft_limit(&self, position: f64) -> Result<()> {
        if self.has_soft_limits() && (position < self.low_limit || position > self.high_limit) {
            return Err(ScanError::SoftLimit {
                axis: self.scannable.clone(),
                position,
                low: self.low_limit,
                high: self.high_limit,
            }
            .into());
        }
        Ok(())
    }
}

/// Scannable name -> motor info, all in one coordinate system.
pub type AxisMapping = BTreeMap<String, MotorInfo>;

fn parse_cs(cs: &str) -> Option<(String, char)> {
    let (port, axis) = cs.split_once(',')?;
    let port = port.trim();
    let mut chars = axis.trim().chars();
    let letter = chars.next()?.to_ascii_uppercase();
    if port.is_empty() || chars.next().is_some() || !CS_AXIS_NAMES.contains(&letter) {
        return None;
    }
    Some((port.to_string(), letter))
}

/// Resolve `axes_to_move` against the controller layout. Returns the single
/// CS port that carries every requested axis and the per-axis motor info.
pub fn cs_axis_mapping(
    pmac: &dyn MotionController,
    axes_to_move: &[String],
) -> Result<(String, AxisMapping)> {
    let layout = pmac.layout().map_err(hw_report).wrap_err("reading motion controller layout")?;
    let mut mapping = AxisMapping::new();
    let mut ports = BTreeSet::new();
    let mut letters = BTreeSet::new();
    for axis in axes_to_move {
        let Some(row) = layout.iter().find(|r| &r.name == axis) else {
            return Err(ScanError::Config(format!("axis {axis} is not in the motion controller layout")).into());
        };
        let rec = pmac.motor(&row.mri).map_err(hw_report).wrap_err_with(|| format!("reading motor {}", row.mri))?;
        let info = MotorInfo::from_record(axis, &row.mri, &rec)?;
        if !letters.insert(info.cs_axis) {
            return Err(ScanError::Config(format!(
                "CS axis {} is used by more than one of {axes_to_move:?}",
                info.cs_axis
            ))
            .into());
        }
        ports.insert(info.cs_port.clone());
        mapping.insert(axis.clone(), info);
    }
    if ports.len() > 1 {
        return Err(ScanError::Config(format!("axes {axes_to_move:?} span coordinate systems {ports:?}")).into());
    }
    let cs_port = ports.into_iter().next().unwrap_or_default();
    Ok((cs_port, mapping))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockMotionController;

    fn record(cs: &str) -> MotorRecord {
        MotorRecord {
            cs: cs.to_string(),
            max_velocity: 1.0,
            acceleration_time: 0.4,
            resolution: 0.001,
            ..MotorRecord::default()
        }
    }

    #[test]
    fn derived_kinematics() {
        let m = MotorInfo::from_record("x", "BL:X", &record("CS1,A")).unwrap();
        assert_eq!(m.cs_axis, 'A');
        assert_eq!(m.cs_port, "CS1");
        assert!((m.acceleration - 2.5).abs() < 1e-12);
        assert!((m.acceleration_time(0.0, 0.25) - 0.1).abs() < 1e-12);
        assert!((m.ramp_distance(0.0, 0.25) - 0.0125).abs() < 1e-12);
        assert_eq!(m.in_cts(0.05), 50);
        assert_eq!(m.in_cts(-0.35), -350);
        assert!((m.in_egu(50) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn max_velocity_percent_scales_velocity_and_acceleration() {
        let mut r = record("CS1,X");
        r.max_velocity_percent = 50.0;
        let m = MotorInfo::from_record("x", "BL:X", &r).unwrap();
        assert!((m.max_velocity - 0.5).abs() < 1e-12);
        assert!((m.acceleration - 1.25).abs() < 1e-12);
    }

    #[test]
    fn soft_limits_only_apply_when_configured() {
        let mut m = MotorInfo::from_record("x", "BL:X", &record("CS1,A")).unwrap();
        assert!(m.check_soft_limit(1e6).is_ok());
        m.low_limit = -1.0;
        m.high_limit = 1.0;
        assert!(m.check_soft_limit(0.5).is_ok());
        let err = m.check_soft_limit(1.5).unwrap_err();
        assert!(matches!(err.downcast_ref::<ScanError>(), Some(ScanError::SoftLimit { .. })));
    }

    #[test]
    fn rejects_unassigned_motor() {
        assert!(MotorInfo::from_record("x", "BL:X", &record("")).is_err());
        assert!(MotorInfo::from_record("x", "BL:X", &record("CS1,Q")).is_err());
    }

    #[test]
    fn mapping_requires_single_cs() {
        let pmac = MockMotionController::new()
            .with_motor("x", "BL:X", record("CS1,A"))
            .with_motor("y", "BL:Y", record("CS2,B"));
        let err = cs_axis_mapping(&pmac, &["x".into(), "y".into()]).unwrap_err();
        assert!(err.to_string().contains("span"));
    }

    #[test]
    fn mapping_rejects_duplicate_letters_and_missing_axes() {
        let pmac = MockMotionController::new()
            .with_motor("x", "BL:X", record("CS1,A"))
            .with_motor("y", "BL:Y", record("CS1,A"));
        assert!(cs_axis_mapping(&pmac, &["x".into(), "y".into()]).is_err());
        assert!(cs_axis_mapping(&pmac, &["z".into()]).is_err());
    }

    #[test]
    fn mapping_happy_path() {
        let pmac = MockMotionController::new()
            .with_motor("x", "BL:X", record("CS1,A"))
            .with_motor("y", "BL:Y", record("CS1,B"));
        let (port, map) = cs_axis_mapping(&pmac, &["x".into(), "y".into()]).unwrap();
        assert_eq!(port, "CS1");
        assert_eq!(map["y"].cs_axis, 'B');
    }
}
