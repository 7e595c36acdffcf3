//! Lazy generation of sequencer rows from scan points.
//!
//! Each scan row (a run of joined points) becomes a triggered row-start entry
//! followed by run-length encoded live pulses. Rows are separated by a dead
//! pulse lasting the turnaround between them, and the stream ends with a long
//! dead pulse and a looping idle row.

use std::collections::BTreeMap;

use flyscan_traits::SeqTrigger;

use crate::config::{PlannerCfg, RowTrigger};
use crate::error::{Result, ScanError};
use crate::generator::CompoundGenerator;
use crate::geometry::points_joined;
use crate::motor::AxisMapping;
use crate::points::{PointBatch, ScanPoint};
use crate::seq_rows::{LAST_PULSE, MIN_PULSE, SequencerRows};
use crate::turnaround::profile_between_points;
use crate::util::SEQ_TICK_S;

/// How an axis' position reaches the sequencer's compare inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionCapture {
    /// Position bus letter, `'A'..='C'`.
    pub bus: char,
    /// EGU per count on the bus.
    pub scale: f64,
    pub offset: f64,
}

impl PositionCapture {
    pub fn counts(&self, position: f64) -> i64 {
        ((position - self.offset) / self.scale).round() as i64
    }
}

/// Half of a point's duration in sequencer ticks, never below `MIN_PULSE`.
pub fn half_ticks(duration: f64) -> u32 {
    let t = (duration / 2.0 / SEQ_TICK_S).round();
    if t >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        (t as u32).max(MIN_PULSE)
    }
}

/// Iterator of row batches for scan steps `[start, end)`.
#[derive(Debug, Clone)]
pub struct SeqRowGenerator {
    generator: CompoundGenerator,
    axis_mapping: AxisMapping,
    captures: BTreeMap<String, PositionCapture>,
    row_trigger: RowTrigger,
    max_repeats: u32,
    batch_rows: usize,
    min_turnaround: f64,
    min_interval: f64,
    start: usize,
    end: usize,
    index: usize,
    row_open: bool,
    run: Option<(u32, u32)>,
    batch: PointBatch,
    done: bool,
}

impl SeqRowGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generator: CompoundGenerator,
        axis_mapping: AxisMapping,
        captures: BTreeMap<String, PositionCapture>,
        row_trigger: RowTrigger,
        max_repeats: u32,
        batch_rows: usize,
        start: usize,
        end: usize,
    ) -> Result<Self> {
        if row_trigger == RowTrigger::PositionCompare {
            for c in captures.values() {
                if SeqTrigger::position(c.bus, true).is_none() || c.scale == 0.0 {
                    return Err(ScanError::Config(format!("bad position capture {c:?}")).into());
                }
            }
            if !axis_mapping.is_empty() && !axis_mapping.keys().any(|a| captures.contains_key(a)) {
                return Err(ScanError::Config(format!(
                    "none of {:?} is wired to a position bus",
                    axis_mapping.keys().collect::<Vec<_>>()
                ))
                .into());
            }
        }
        let end = end.min(generator.size());
        let planner = PlannerCfg::default();
        Ok(Self {
            generator,
            axis_mapping,
            captures,
            row_trigger,
            max_repeats: max_repeats.max(1),
            batch_rows: batch_rows.max(1),
            min_turnaround: planner.min_turnaround,
            min_interval: planner.min_interval,
            start,
            end,
            index: start,
            row_open: false,
            run: None,
            batch: PointBatch::default(),
            done: false,
        })
    }

    /// Plan dead rows with the same turnaround constraints as the trajectory.
    #[must_use]
    pub fn with_turnaround(mut self, min_turnaround: f64, min_interval: f64) -> Self {
        self.min_turnaround = min_turnaround;
        self.min_interval = min_interval;
        self
    }

    fn point(&mut self, i: usize) -> ScanPoint {
        if let Some(p) = self.batch.get(i) {
            return p.clone();
        }
        let end = (i + 4096).min(self.generator.size());
        self.batch = self.generator.get_points(i, end);
        self.batch.get(i).cloned().unwrap_or_else(|| self.generator.get_point(i))
    }

    fn software_timed(&self) -> bool {
        self.axis_mapping.is_empty() || self.row_trigger == RowTrigger::None
    }

    /// Trigger and compare position starting the row at `point`.
    fn row_start_trigger(&self, point: &ScanPoint) -> Result<(SeqTrigger, i32)> {
        if self.software_timed() {
            return Ok((SeqTrigger::Immediate, 0));
        }
        if self.row_trigger == RowTrigger::MotionController {
            return Ok((SeqTrigger::BitA1, 0));
        }
        let best = self
            .captures
            .iter()
            .filter(|(axis, _)| self.axis_mapping.contains_key(*axis))
            .map(|(axis, cap)| {
                let lower = cap.counts(point.lower_of(axis));
                let upper = cap.counts(point.upper_of(axis));
                (axis, cap, lower, upper)
            })
            .fold(None::<(&str, &PositionCapture, i64, i64)>, |best, (axis, cap, lower, upper)| match best {
                Some(b) if (b.3 - b.2).abs() >= (upper - lower).abs() => Some(b),
                _ => Some((axis.as_str(), cap, lower, upper)),
            });
        match best {
            Some((axis, cap, lower, upper)) if upper != lower => {
                let trigger = SeqTrigger::position(cap.bus, upper > lower).unwrap_or(SeqTrigger::Immediate);
                let position = i32::try_from(lower).map_err(|_| {
                    ScanError::Config(format!(
                        "{axis} compare position {lower} counts at step {} does not fit the sequencer",
                        self.index
                    ))
                })?;
                Ok((trigger, position))
            }
            _ => {
                tracing::warn!(indexes = ?point.indexes, "row start moves no captured axis; starting immediately");
                Ok((SeqTrigger::Immediate, 0))
            }
        }
    }

    /// Dead pulse covering the gap between `previous` and `next`: both halves
    /// together last the turnaround the motors take between the rows.
    fn dead_row(&self, previous: &ScanPoint, next: &ScanPoint, rows: &mut SequencerRows) -> Result<()> {
        let (trigger, half) = if self.software_timed() {
            (SeqTrigger::Immediate, half_ticks(previous.delay_after))
        } else {
            let turnaround =
                profile_between_points(&self.axis_mapping, previous, next, self.min_turnaround, self.min_interval)?;
            let trigger = if self.row_trigger == RowTrigger::MotionController {
                SeqTrigger::BitA0
            } else {
                SeqTrigger::Immediate
            };
            (trigger, half_ticks(turnaround.total_time))
        };
        rows.add_seq_entry(1, trigger, 0, half, false, true, 0);
        Ok(())
    }

    fn add_run(&mut self, half: u32, rows: &mut SequencerRows) {
        match &mut self.run {
            Some((h, count)) if *h == half && *count < self.max_repeats => *count += 1,
            _ => {
                self.flush_run(rows);
                self.run = Some((half, 1));
            }
        }
    }

    fn flush_run(&mut self, rows: &mut SequencerRows) {
        if let Some((half, count)) = self.run.take() {
            rows.add_seq_entry(count, SeqTrigger::Immediate, 0, half, true, false, 0);
        }
    }

    fn terminator(rows: &mut SequencerRows) {
        rows.add_seq_entry(1, SeqTrigger::Immediate, 0, LAST_PULSE, false, true, 0);
        rows.add_seq_entry(0, SeqTrigger::Immediate, 0, MIN_PULSE, false, false, 0);
    }

    fn next_rows(&mut self) -> Result<SequencerRows> {
        let mut rows = SequencerRows::new();
        while rows.len() < self.batch_rows {
            if !self.row_open {
                if self.index >= self.end {
                    Self::terminator(&mut rows);
                    self.done = true;
                    break;
                }
                let point = self.point(self.index);
                if self.index > self.start {
                    let previous = self.point(self.index - 1);
                    self.dead_row(&previous, &point, &mut rows)?;
                }
                let (trigger, position) = self.row_start_trigger(&point)?;
                rows.add_seq_entry(1, trigger, position, half_ticks(point.duration), true, false, 0);
                self.row_open = true;
                self.index += 1;
                continue;
            }
            let previous = self.point(self.index - 1);
            let joined = self.index < self.end && {
                let next = self.point(self.index);
                points_joined(&self.axis_mapping, &previous, &next)
            };
            if joined {
                let next = self.point(self.index);
                self.add_run(half_ticks(next.duration), &mut rows);
                self.index += 1;
            } else {
                self.flush_run(&mut rows);
                self.row_open = false;
                break;
            }
        }
        tracing::trace!(rows = rows.len(), index = self.index, "sequencer rows");
        Ok(rows)
    }
}

impl Iterator for SeqRowGenerator {
    type Item = Result<SequencerRows>;

    fn next(&mut self) -> Option<Result<SequencerRows>> {
        if self.done {
            return None;
        }
        let rows = self.next_rows();
        if rows.is_err() {
            self.done = true;
        }
        Some(rows)
    }
}
