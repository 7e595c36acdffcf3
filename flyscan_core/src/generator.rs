//! Built-in scan point generators.
//!
//! A `CompoundGenerator` nests line and static dimensions (outermost first)
//! and produces `ScanPoint`s lazily by index. It serializes with `serde`, which
//! is how validate clones and tweaks it.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::points::{AxisPositions, PointBatch, ScanPoint};

/// Evenly spaced points between `start` and `stop` on one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineGenerator {
    pub axis: String,
    #[serde(default = "default_units")]
    pub units: String,
    pub start: f64,
    pub stop: f64,
    pub size: usize,
    /// Reverse direction on every other pass (snake).
    #[serde(default)]
    pub alternate: bool,
}

fn default_units() -> String {
    "mm".to_string()
}

impl LineGenerator {
    pub fn new(axis: &str, units: &str, start: f64, stop: f64, size: usize, alternate: bool) -> Self {
        Self {
            axis: axis.to_string(),
            units: units.to_string(),
            start,
            stop,
            size,
            alternate,
        }
    }

    pub fn step(&self) -> f64 {
        if self.size <= 1 {
            0.0
        } else {
            (self.stop - self.start) / (self.size - 1) as f64
        }
    }

    pub fn position_at(&self, idx: usize) -> f64 {
        self.position_at_f(idx as f64)
    }

    /// Position at a fractional index; `k +/- 0.5` gives the point bounds, so
    /// the upper bound of one point is bit-identical to the lower of the next.
    pub fn position_at_f(&self, k: f64) -> f64 {
        self.start + self.step() * k
    }
}

/// `size` points that move no axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPointGenerator {
    pub size: usize,
}

impl StaticPointGenerator {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Dimension {
    Line(LineGenerator),
    Static(StaticPointGenerator),
}

impl Dimension {
    pub fn size(&self) -> usize {
        match self {
            Self::Line(l) => l.size,
            Self::Static(s) => s.size,
        }
    }

    pub fn axes(&self) -> Vec<String> {
        match self {
            Self::Line(l) => vec![l.axis.clone()],
            Self::Static(_) => Vec::new(),
        }
    }

    pub fn alternate(&self) -> bool {
        matches!(self, Self::Line(l) if l.alternate)
    }
}

impl From<LineGenerator> for Dimension {
    fn from(l: LineGenerator) -> Self {
        Self::Line(l)
    }
}

impl From<StaticPointGenerator> for Dimension {
    fn from(s: StaticPointGenerator) -> Self {
        Self::Static(s)
    }
}

/// Nested product of dimensions with a fixed per-point duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundGenerator {
    /// Outermost first.
    pub dimensions: Vec<Dimension>,
    /// Seconds per point; 0 means variable.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub delay_after: f64,
}

impl CompoundGenerator {
    pub fn new(dimensions: Vec<Dimension>, duration: f64) -> Self {
        Self {
            dimensions,
            duration,
            delay_after: 0.0,
        }
    }

    #[must_use]
    pub fn with_duration(&self, duration: f64) -> Self {
        Self {
            duration,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_delay_after(mut self, delay_after: f64) -> Self {
        self.delay_after = delay_after;
        self
    }

    /// Checks the generator is well formed. Idempotent.
    pub fn prepare(&self) -> Result<()> {
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(ScanError::Validation(format!("duration {} must be >= 0", self.duration)).into());
        }
        if !self.delay_after.is_finite() || self.delay_after < 0.0 {
            return Err(ScanError::Validation(format!(
                "delay_after {} must be >= 0",
                self.delay_after
            ))
            .into());
        }
        let mut seen = std::collections::BTreeSet::new();
        for d in &self.dimensions {
            if let Dimension::Line(l) = d
                && !(l.start.is_finite() && l.stop.is_finite())
            {
                return Err(ScanError::Validation(format!("line on {} has non-finite bounds", l.axis)).into());
            }
            for a in d.axes() {
                if !seen.insert(a.clone()) {
                    return Err(ScanError::Validation(format!("axis {a} appears in two dimensions")).into());
                }
            }
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.dimensions.iter().map(Dimension::size).product()
    }

    pub fn axes(&self) -> Vec<String> {
        self.dimensions.iter().flat_map(Dimension::axes).collect()
    }

    pub fn units(&self, axis: &str) -> Option<&str> {
        self.dimensions.iter().find_map(|d| match d {
            Dimension::Line(l) if l.axis == axis => Some(l.units.as_str()),
            _ => None,
        })
    }

    /// Indexes per dimension (outermost first) for flattened index `i`, with
    /// snake reversal applied, and whether the innermost dimension runs reversed.
    fn unravel(&self, i: usize) -> (Vec<usize>, bool) {
        let n = self.dimensions.len();
        let mut idx = vec![0; n];
        let mut inner_size = 1;
        let mut reversed_inner = false;
        for d in (0..n).rev() {
            let size = self.dimensions[d].size().max(1);
            let outer = i / inner_size / size;
            let mut k = (i / inner_size) % size;
            let reversed = self.dimensions[d].alternate() && outer % 2 == 1;
            if reversed {
                k = size - 1 - k;
            }
            if d == n - 1 {
                reversed_inner = reversed;
            }
            idx[d] = k;
            inner_size *= size;
        }
        (idx, reversed_inner)
    }

    pub fn get_point(&self, i: usize) -> ScanPoint {
        let (indexes, reversed_inner) = self.unravel(i);
        let n = self.dimensions.len();
        let mut positions = AxisPositions::new();
        let mut lower = AxisPositions::new();
        let mut upper = AxisPositions::new();
        for (d, dim) in self.dimensions.iter().enumerate() {
            let Dimension::Line(line) = dim else { continue };
            let pos = line.position_at(indexes[d]);
            positions.insert(line.axis.clone(), pos);
            if d + 1 == n {
                let k = indexes[d] as f64;
                let (lo, hi) = if reversed_inner { (k + 0.5, k - 0.5) } else { (k - 0.5, k + 0.5) };
                lower.insert(line.axis.clone(), line.position_at_f(lo));
                upper.insert(line.axis.clone(), line.position_at_f(hi));
            } else {
                lower.insert(line.axis.clone(), pos);
                upper.insert(line.axis.clone(), pos);
            }
        }
        ScanPoint {
            positions,
            lower,
            upper,
            duration: self.duration,
            delay_after: self.delay_after,
            indexes,
        }
    }

    /// Points `[start, end)`, clamped to the generator size.
    pub fn get_points(&self, start: usize, end: usize) -> PointBatch {
        let end = end.min(self.size());
        PointBatch {
            start,
            points: (start..end.max(start)).map(|i| self.get_point(i)).collect(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(v: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(v.clone())
            .map_err(|e| ScanError::Validation(format!("bad generator: {e}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snake_2x3() -> CompoundGenerator {
        CompoundGenerator::new(
            vec![
                LineGenerator::new("y", "mm", 0.0, 0.1, 2, false).into(),
                LineGenerator::new("x", "mm", 0.0, 0.5, 3, true).into(),
            ],
            1.0,
        )
    }

    #[test]
    fn snake_reverses_odd_rows() {
        let g = snake_2x3();
        assert_eq!(g.size(), 6);
        let xs: Vec<f64> = (0..6).map(|i| g.get_point(i).position_of("x")).collect();
        assert_eq!(xs, vec![0.0, 0.25, 0.5, 0.5, 0.25, 0.0]);
        let p3 = g.get_point(3);
        assert!((p3.lower_of("x") - 0.625).abs() < 1e-12);
        assert!((p3.upper_of("x") - 0.375).abs() < 1e-12);
        assert_eq!(p3.indexes, vec![1, 2]);
    }

    #[test]
    fn outer_axes_have_degenerate_bounds() {
        let g = snake_2x3();
        let p = g.get_point(4);
        assert_eq!(p.lower_of("y"), 0.1);
        assert_eq!(p.upper_of("y"), 0.1);
    }

    #[test]
    fn static_points_have_no_axes() {
        let g = CompoundGenerator::new(vec![StaticPointGenerator::new(5).into()], 0.1);
        assert_eq!(g.size(), 5);
        assert!(g.axes().is_empty());
        assert!(g.get_point(4).positions.is_empty());
        assert_eq!(g.get_points(3, 10).len(), 2);
    }

    #[test]
    fn serde_clone_preserves_generator() {
        let g = snake_2x3().with_delay_after(0.5);
        let back = CompoundGenerator::from_value(&g.to_value()).unwrap();
        assert_eq!(back, g);
        assert_eq!(back.with_duration(0.2).duration, 0.2);
    }

    #[test]
    fn prepare_rejects_duplicate_axes() {
        let g = CompoundGenerator::new(
            vec![
                LineGenerator::new("x", "mm", 0.0, 1.0, 2, false).into(),
                LineGenerator::new("x", "mm", 0.0, 1.0, 2, false).into(),
            ],
            1.0,
        );
        assert!(g.prepare().is_err());
    }
}
