//! Profile samples, trigger policy and the completed-step lookup.

use std::collections::VecDeque;

use flyscan_traits::{ProfileWrite, UserProgram, VelocityMode};

use crate::config::RowTrigger;
use crate::motor::AxisMapping;
use crate::points::AxisPositions;
use crate::util::{PROFILE_TICK_S, TickAccumulator};

/// Role of a profile sample within the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointType {
    StartOfRow,
    MidPoint,
    PointJoin,
    EndOfRow,
    Turnaround,
}

/// Which outputs the motion controller's user programs drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Live pulse per point, mid pulse at every centre, dead at row ends.
    EveryPoint,
    /// Live at the start of each row, dead at its end.
    #[default]
    RowGate,
    /// No outputs.
    None,
}

impl From<RowTrigger> for TriggerMode {
    /// Outputs a sequencer started by `row_trigger` needs from the motion controller.
    fn from(row_trigger: RowTrigger) -> Self {
        match row_trigger {
            RowTrigger::MotionController => Self::RowGate,
            RowTrigger::PositionCompare | RowTrigger::None => Self::None,
        }
    }
}

impl TriggerMode {
    pub fn user_program(self, point_type: PointType) -> UserProgram {
        match (self, point_type) {
            (Self::None, _) => UserProgram::NoProgram,
            (_, PointType::StartOfRow) => UserProgram::Live,
            (_, PointType::EndOfRow) => UserProgram::Dead,
            (Self::EveryPoint, PointType::MidPoint) => UserProgram::Mid,
            (Self::EveryPoint, PointType::PointJoin) => UserProgram::Live,
            _ => UserProgram::NoProgram,
        }
    }
}

/// One planned sample, timed in seconds from the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSample {
    pub dt: f64,
    pub positions: AxisPositions,
    pub velocity_mode: VelocityMode,
    pub user_program: UserProgram,
    /// Scan steps complete once this sample has executed.
    pub completed_steps: usize,
}

/// Completed steps per executed sample, indexed from the start of the run.
/// Entries that can no longer be queried are trimmed from the front.
#[derive(Debug, Clone, Default)]
pub struct StepLookup {
    base: usize,
    entries: VecDeque<usize>,
}

impl StepLookup {
    pub fn push(&mut self, steps: usize) {
        self.entries.push_back(steps);
    }

    /// Samples recorded so far, including trimmed ones.
    pub fn total(&self) -> usize {
        self.base + self.entries.len()
    }

    pub fn get(&self, index: usize) -> Option<usize> {
        index.checked_sub(self.base).and_then(|k| self.entries.get(k).copied())
    }

    pub fn last(&self) -> Option<usize> {
        self.entries.back().copied()
    }

    /// Drop entries before `index`.
    pub fn trim_before(&mut self, index: usize) {
        while self.base < index && !self.entries.is_empty() {
            self.entries.pop_front();
            self.base += 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().copied()
    }
}

/// Samples planned but not yet written, plus the tick conversion state that
/// must persist across chunks.
#[derive(Debug, Clone)]
pub struct ProfileBuffer {
    samples: Vec<ProfileSample>,
    last_positions: AxisPositions,
    ticks: TickAccumulator,
    max_move_time: f64,
    mode: TriggerMode,
}

impl ProfileBuffer {
    pub fn new(start: AxisPositions, max_move_time: f64, mode: TriggerMode) -> Self {
        Self {
            samples: Vec::new(),
            last_positions: start,
            ticks: TickAccumulator::new(PROFILE_TICK_S),
            max_move_time,
            mode,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last_positions(&self) -> &AxisPositions {
        &self.last_positions
    }

    /// Append a sample, splitting it into equal sub-samples when it is longer
    /// than the maximum move time. Every sample appended is recorded in
    /// `lookup`.
    pub fn push(&mut self, sample: ProfileSample, lookup: &mut StepLookup) {
        let parts = if self.max_move_time > 0.0 && sample.dt > self.max_move_time {
            (sample.dt / self.max_move_time - 1e-9).ceil().max(1.0) as usize
        } else {
            1
        };
        if parts > 1 {
            let dt = sample.dt / parts as f64;
            let prev_steps = lookup.last().unwrap_or(0).min(sample.completed_steps);
            for k in 1..parts {
                let frac = k as f64 / parts as f64;
                let positions = sample
                    .positions
                    .iter()
                    .map(|(axis, &end)| {
                        let start = self.last_positions.get(axis).copied().unwrap_or(end);
                        (axis.clone(), start + (end - start) * frac)
                    })
                    .collect();
                lookup.push(prev_steps);
                self.samples.push(ProfileSample {
                    dt,
                    positions,
                    velocity_mode: VelocityMode::AveragePrevToNext,
                    user_program: UserProgram::NoProgram,
                    completed_steps: prev_steps,
                });
            }
            self.last_positions.clone_from(&sample.positions);
            lookup.push(sample.completed_steps);
            self.samples.push(ProfileSample { dt, ..sample });
            return;
        }
        self.last_positions.clone_from(&sample.positions);
        lookup.push(sample.completed_steps);
        self.samples.push(sample);
    }

    /// Convenience for planner call sites that work in point types.
    #[allow(clippy::too_many_arguments)]
    pub fn push_point(
        &mut self,
        dt: f64,
        positions: AxisPositions,
        velocity_mode: VelocityMode,
        point_type: PointType,
        completed_steps: usize,
        lookup: &mut StepLookup,
    ) {
        let user_program = self.mode.user_program(point_type);
        self.push(
            ProfileSample {
                dt,
                positions,
                velocity_mode,
                user_program,
                completed_steps,
            },
            lookup,
        );
    }

    /// Remove samples for writing. Unless `last` is set, the final sample is
    /// held back so later appends can follow it.
    pub fn take_chunk(&mut self, axis_mapping: &AxisMapping, last: bool) -> Option<ProfileWrite> {
        let n = if last { self.samples.len() } else { self.samples.len().saturating_sub(1) };
        if n == 0 {
            return None;
        }
        let drained: Vec<ProfileSample> = self.samples.drain(..n).collect();
        let mut out = ProfileWrite::default();
        for motor in axis_mapping.values() {
            out.positions.insert(motor.cs_axis, Vec::with_capacity(n));
        }
        for s in drained {
            out.time_array.push(u32::try_from(self.ticks.push(s.dt)).unwrap_or(u32::MAX));
            out.velocity_mode.push(s.velocity_mode);
            out.user_programs.push(s.user_program);
            for (axis, motor) in axis_mapping {
                if let Some(col) = out.positions.get_mut(&motor.cs_axis) {
                    col.push(s.positions.get(axis).copied().unwrap_or(motor.current_position));
                }
            }
        }
        Some(out)
    }

    pub fn samples(&self) -> &[ProfileSample] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(TriggerMode::EveryPoint, PointType::StartOfRow, UserProgram::Live)]
    #[case(TriggerMode::EveryPoint, PointType::MidPoint, UserProgram::Mid)]
    #[case(TriggerMode::EveryPoint, PointType::PointJoin, UserProgram::Live)]
    #[case(TriggerMode::EveryPoint, PointType::EndOfRow, UserProgram::Dead)]
    #[case(TriggerMode::EveryPoint, PointType::Turnaround, UserProgram::NoProgram)]
    #[case(TriggerMode::RowGate, PointType::StartOfRow, UserProgram::Live)]
    #[case(TriggerMode::RowGate, PointType::MidPoint, UserProgram::NoProgram)]
    #[case(TriggerMode::RowGate, PointType::PointJoin, UserProgram::NoProgram)]
    #[case(TriggerMode::RowGate, PointType::EndOfRow, UserProgram::Dead)]
    #[case(TriggerMode::None, PointType::StartOfRow, UserProgram::NoProgram)]
    fn user_programs(#[case] mode: TriggerMode, #[case] pt: PointType, #[case] want: UserProgram) {
        assert_eq!(mode.user_program(pt), want);
    }

    #[test]
    fn lookup_trims_but_keeps_absolute_indexes() {
        let mut l = StepLookup::default();
        for s in [0, 0, 1, 2, 3] {
            l.push(s);
        }
        l.trim_before(3);
        assert_eq!(l.total(), 5);
        assert_eq!(l.get(2), None);
        assert_eq!(l.get(3), Some(2));
        assert_eq!(l.get(4), Some(3));
    }

    #[test]
    fn long_samples_are_split_uniformly() {
        let mut lookup = StepLookup::default();
        let mut start = AxisPositions::new();
        start.insert("x".into(), 0.0);
        let mut buf = ProfileBuffer::new(start, 4.0, TriggerMode::EveryPoint);
        let mut end = AxisPositions::new();
        end.insert("x".into(), 9.0);
        buf.push_point(9.0, end, VelocityMode::RealPrevToCurrent, PointType::EndOfRow, 1, &mut lookup);
        assert_eq!(buf.len(), 3);
        let xs: Vec<f64> = buf.samples().iter().map(|s| s.positions["x"]).collect();
        assert_eq!(xs, vec![3.0, 6.0, 9.0]);
        assert!(buf.samples().iter().all(|s| (s.dt - 3.0).abs() < 1e-12));
        assert_eq!(buf.samples()[0].velocity_mode, VelocityMode::AveragePrevToNext);
        assert_eq!(buf.samples()[2].user_program, UserProgram::Dead);
        assert_eq!(lookup.iter().collect::<Vec<_>>(), vec![0, 0, 1]);
    }

    #[test]
    fn chunk_holds_back_last_sample() {
        let mut lookup = StepLookup::default();
        let mut buf = ProfileBuffer::new(AxisPositions::new(), 4.0, TriggerMode::RowGate);
        for i in 0..3 {
            buf.push_point(0.5, AxisPositions::new(), VelocityMode::AveragePrevToNext, PointType::PointJoin, i, &mut lookup);
        }
        let chunk = buf.take_chunk(&AxisMapping::new(), false).unwrap();
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.time_array, vec![500_000, 500_000]);
        assert_eq!(buf.len(), 1);
        assert!(buf.take_chunk(&AxisMapping::new(), false).is_none());
        assert_eq!(buf.take_chunk(&AxisMapping::new(), true).unwrap().len(), 1);
    }

    proptest! {
        #[test]
        fn lookup_never_goes_backwards(
            samples in prop::collection::vec((0.001f64..10.0, 0usize..3), 1..40),
            max_move_time in 0.5f64..4.0,
        ) {
            let mut lookup = StepLookup::default();
            let mut buf = ProfileBuffer::new(AxisPositions::new(), max_move_time, TriggerMode::EveryPoint);
            let mut steps = 0;
            for (dt, advance) in samples {
                steps += advance;
                buf.push_point(dt, AxisPositions::new(), VelocityMode::AveragePrevToNext, PointType::PointJoin, steps, &mut lookup);
            }
            let recorded: Vec<usize> = lookup.iter().collect();
            prop_assert_eq!(recorded.len(), buf.len());
            prop_assert!(recorded.windows(2).all(|w| w[0] <= w[1]), "{:?}", recorded);
            prop_assert!(recorded.iter().all(|&s| s <= steps));
            prop_assert_eq!(lookup.last(), Some(steps));
            prop_assert!(buf.samples().iter().all(|s| s.dt <= max_move_time + 1e-9));
        }
    }
}
