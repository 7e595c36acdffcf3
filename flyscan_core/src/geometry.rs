//! Per-point velocity and adjacency helpers.

use std::collections::BTreeMap;

use crate::motor::AxisMapping;
use crate::points::ScanPoint;

/// Velocity at the boundary of `point`: the entry velocity (lower to centre)
/// when `entry` is true, else the exit velocity (centre to upper).
///
/// A linear point gives its mean velocity on both sides; a point whose centre
/// is off the midpoint of its bounds gives the velocity that makes a linear
/// ramp through the centre cover the right half-distances.
pub fn point_velocities(axis_mapping: &AxisMapping, point: &ScanPoint, entry: bool) -> BTreeMap<String, f64> {
    axis_mapping
        .keys()
        .map(|axis| (axis.clone(), boundary_velocity(point, axis, entry)))
        .collect()
}

fn boundary_velocity(point: &ScanPoint, axis: &str, entry: bool) -> f64 {
    if point.duration <= 0.0 {
        return 0.0;
    }
    let lower = point.lower_of(axis);
    let upper = point.upper_of(axis);
    let centre = point.position_of(axis);
    let half = if entry { centre - lower } else { upper - centre };
    4.0 * half / point.duration - (upper - lower) / point.duration
}

/// Consecutive points share a boundary on every axis and no delay separates them.
pub fn points_joined(axis_mapping: &AxisMapping, point: &ScanPoint, next: &ScanPoint) -> bool {
    if point.delay_after > 0.0 {
        return false;
    }
    axis_mapping
        .keys()
        .all(|axis| point.upper.get(axis) == next.lower.get(axis))
}

/// Consecutive points move every axis at the same mean velocity.
pub fn points_same_velocity(axis_mapping: &AxisMapping, point: &ScanPoint, next: &ScanPoint) -> bool {
    axis_mapping.keys().all(|axis| {
        let a = point.mean_velocity(axis);
        let b = next.mean_velocity(axis);
        (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
    })
}

/// Whether the centre of `point` sits off the midpoint of its bounds on any axis.
pub fn point_is_nonlinear(axis_mapping: &AxisMapping, point: &ScanPoint) -> bool {
    axis_mapping.keys().any(|axis| {
        let mid = (point.lower_of(axis) + point.upper_of(axis)) / 2.0;
        (point.position_of(axis) - mid).abs() > 1e-12 * mid.abs().max(1.0)
    })
}
