//! Scan point value types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Axis name -> position (engineering units).
pub type AxisPositions = BTreeMap<String, f64>;

/// One scan point: where every axis is at the centre and over which interval
/// it moves while the point is acquired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    pub positions: AxisPositions,
    pub lower: AxisPositions,
    pub upper: AxisPositions,
    /// Seconds; 0 means variable (must be tweaked before running).
    pub duration: f64,
    /// Gap inserted before the next point, seconds.
    pub delay_after: f64,
    /// Index of this point in each generator dimension, outermost first.
    pub indexes: Vec<usize>,
}

impl ScanPoint {
    pub fn lower_of(&self, axis: &str) -> f64 {
        self.lower.get(axis).copied().unwrap_or(0.0)
    }

    pub fn upper_of(&self, axis: &str) -> f64 {
        self.upper.get(axis).copied().unwrap_or(0.0)
    }

    pub fn position_of(&self, axis: &str) -> f64 {
        self.positions.get(axis).copied().unwrap_or(0.0)
    }

    /// Mean velocity on `axis` over the point.
    pub fn mean_velocity(&self, axis: &str) -> f64 {
        if self.duration > 0.0 {
            (self.upper_of(axis) - self.lower_of(axis)) / self.duration
        } else {
            0.0
        }
    }
}

/// A contiguous run of points `[start, start + points.len())` of a scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointBatch {
    pub start: usize,
    pub points: Vec<ScanPoint>,
}

impl PointBatch {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn end(&self) -> usize {
        self.start + self.points.len()
    }

    /// Point with absolute index `i`, if it is inside this batch.
    pub fn get(&self, i: usize) -> Option<&ScanPoint> {
        i.checked_sub(self.start).and_then(|k| self.points.get(k))
    }
}
