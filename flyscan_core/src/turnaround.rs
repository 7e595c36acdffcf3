//! Time-synchronized motion between two non-joined points.

use std::collections::BTreeMap;

use crate::error::{Result, ScanError};
use crate::geometry::point_velocities;
use crate::motor::AxisMapping;
use crate::points::{AxisPositions, ScanPoint};
use crate::util::PROFILE_TICK_S;
use crate::velocity::VelocityProfile;

const ITERATIONS: usize = 2;

/// Per-axis breakpoint arrays of a synchronized turnaround.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Turnaround {
    pub time_arrays: BTreeMap<String, Vec<f64>>,
    pub velocity_arrays: BTreeMap<String, Vec<f64>>,
    profiles: BTreeMap<String, VelocityProfile>,
    /// Duration shared by every axis.
    pub total_time: f64,
}

/// One interpolated sample of a turnaround.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnaroundSample {
    /// Seconds since the previous sample.
    pub dt: f64,
    pub positions: AxisPositions,
}

/// Plan the motion from `point_a.upper` to `point_b.lower`, leaving at the exit
/// velocity of `a` and arriving at the entry velocity of `b`, with every axis
/// finishing at the same instant.
pub fn profile_between_points(
    axis_mapping: &AxisMapping,
    point_a: &ScanPoint,
    point_b: &ScanPoint,
    min_turnaround: f64,
    min_interval: f64,
) -> Result<Turnaround> {
    let start_velocities = point_velocities(axis_mapping, point_a, false);
    let end_velocities = point_velocities(axis_mapping, point_b, true);
    let mut min_time = min_turnaround.max(point_a.delay_after);
    let mut quantize = false;

    for iteration in 0..ITERATIONS {
        let mut profiles = BTreeMap::new();
        for (axis, motor) in axis_mapping {
            let distance = point_b.lower_of(axis) - point_a.upper_of(axis);
            let p = motor.make_velocity_profile(
                start_velocities[axis],
                end_velocities[axis],
                distance,
                min_time,
                min_interval,
            );
            profiles.insert(axis.clone(), p);
        }
        if quantize || profiles.values().any(VelocityProfile::check_quantize) {
            quantize = true;
            for p in profiles.values_mut() {
                p.quantize();
            }
        }

        let t_star = profiles
            .values()
            .map(VelocityProfile::t_total)
            .fold(min_time, f64::max);
        let consistent = profiles
            .values()
            .all(|p| (p.t_total() - t_star).abs() <= PROFILE_TICK_S);
        tracing::trace!(iteration, t_star, consistent, "turnaround iteration");
        if consistent {
            let mut out = Turnaround {
                total_time: t_star,
                ..Turnaround::default()
            };
            for (axis, p) in profiles {
                let (times, velocities) = p.make_arrays();
                out.time_arrays.insert(axis.clone(), times);
                out.velocity_arrays.insert(axis.clone(), velocities);
                out.profiles.insert(axis, p);
            }
            return Ok(out);
        }
        min_time = t_star;
    }
    Err(ScanError::Turnaround(format!("Can't get a consistent time in {ITERATIONS} iterations")).into())
}

impl Turnaround {
    /// Position samples on the union of every axis' change instants.
    ///
    /// Instants closer than `min_interval` to the previous kept instant are
    /// dropped; the final instant is always kept and lands exactly on
    /// `point_b.lower`. A turnaround with no axes yields one sample spanning
    /// the whole gap.
    pub fn samples(&self, axis_mapping: &AxisMapping, point_a: &ScanPoint, point_b: &ScanPoint, min_interval: f64) -> Vec<TurnaroundSample> {
        let total = self.total_time.max(min_interval);
        let mut instants: Vec<f64> = self
            .time_arrays
            .values()
            .flat_map(|t| t.iter().copied())
            .filter(|&t| t > 0.0 && t < total)
            .collect();
        instants.sort_by(f64::total_cmp);

        let mut kept: Vec<f64> = Vec::with_capacity(instants.len() + 1);
        let mut prev = 0.0;
        for t in instants {
            if t - prev >= min_interval - 1e-12 && total - t >= min_interval - 1e-12 {
                kept.push(t);
                prev = t;
            }
        }
        kept.push(total);

        let mut out = Vec::with_capacity(kept.len());
        let mut prev = 0.0;
        let last = kept.len() - 1;
        for (i, t) in kept.into_iter().enumerate() {
            let positions = axis_mapping
                .keys()
                .map(|axis| {
                    let pos = if i == last {
                        point_b.lower_of(axis)
                    } else {
                        let x = self.profiles.get(axis).map_or(0.0, |p| p.position_at(t));
                        point_a.upper_of(axis) + x
                    };
                    (axis.clone(), pos)
                })
                .collect();
            out.push(TurnaroundSample { dt: t - prev, positions });
            prev = t;
        }
        out
    }
}
