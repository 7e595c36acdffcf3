//! Trajectory planner: turns scan points into motion controller profile samples.
//!
//! Samples are produced in bounded chunks. `emit` advances through the scan
//! until the buffer holds more than `profile_points` samples or the scan is
//! exhausted; the caller writes a chunk and calls `update_step` as progress
//! arrives, which plans and hands back the next chunk when the controller is
//! running low.

use std::collections::BTreeMap;

use flyscan_traits::{ProfileWrite, VelocityMode};

use crate::config::PlannerCfg;
use crate::error::Result;
use crate::generator::CompoundGenerator;
use crate::geometry::{point_is_nonlinear, point_velocities, points_joined, points_same_velocity};
use crate::motor::AxisMapping;
use crate::points::{AxisPositions, PointBatch, ScanPoint};
use crate::profile::{PointType, ProfileBuffer, StepLookup, TriggerMode};
use crate::turnaround::profile_between_points;

#[derive(Debug, Clone)]
pub struct TrajectoryPlanner {
    cfg: PlannerCfg,
    generator: CompoundGenerator,
    axis_mapping: AxisMapping,
    mode: TriggerMode,
    buffer: ProfileBuffer,
    lookup: StepLookup,
    batch: PointBatch,
    start_index: usize,
    end_index: usize,
    steps_up_to: usize,
    time_since_last_pvt: f64,
    skipped_in_row: bool,
    run_up_done: bool,
    tail_done: bool,
    written: usize,
}

impl TrajectoryPlanner {
    pub fn new(cfg: PlannerCfg, generator: CompoundGenerator, axis_mapping: AxisMapping, mode: TriggerMode) -> Self {
        let buffer = ProfileBuffer::new(AxisPositions::new(), cfg.max_move_time, mode);
        Self {
            cfg,
            generator,
            axis_mapping,
            mode,
            buffer,
            lookup: StepLookup::default(),
            batch: PointBatch::default(),
            start_index: 0,
            end_index: 0,
            steps_up_to: 0,
            time_since_last_pvt: 0.0,
            skipped_in_row: false,
            run_up_done: false,
            tail_done: false,
            written: 0,
        }
    }

    /// Reset for a run covering steps `[completed_steps, completed_steps + steps_to_do)`.
    pub fn start(&mut self, completed_steps: usize, steps_to_do: usize) {
        self.start_index = completed_steps;
        self.end_index = completed_steps;
        self.steps_up_to = (completed_steps + steps_to_do).min(self.generator.size());
        self.lookup = StepLookup::default();
        self.time_since_last_pvt = 0.0;
        self.skipped_in_row = false;
        self.run_up_done = false;
        self.tail_done = false;
        self.written = 0;
        self.buffer = ProfileBuffer::new(self.run_up_position(), self.cfg.max_move_time, self.mode);
    }

    pub fn axis_mapping(&self) -> &AxisMapping {
        &self.axis_mapping
    }

    pub fn steps_up_to(&self) -> usize {
        self.steps_up_to
    }

    pub fn lookup(&self) -> &StepLookup {
        &self.lookup
    }

    /// Every sample has been planned and handed out.
    pub fn all_written(&self) -> bool {
        self.tail_done && self.buffer.is_empty()
    }

    /// Samples handed out so far in this run.
    pub fn written(&self) -> usize {
        self.written
    }

    fn point(&mut self, i: usize) -> ScanPoint {
        if let Some(p) = self.batch.get(i) {
            return p.clone();
        }
        let end = (i + self.cfg.batch_points.max(1) + 1).min(self.generator.size());
        self.batch = self.generator.get_points(i, end);
        self.batch.get(i).cloned().unwrap_or_else(|| self.generator.get_point(i))
    }

    /// Where each axis must be so that ramping up from rest reaches
    /// `lower[start_index]` at the entry velocity.
    pub fn run_up_position(&mut self) -> AxisPositions {
        if self.start_index >= self.generator.size() {
            return AxisPositions::new();
        }
        let point = self.point(self.start_index);
        let velocities = point_velocities(&self.axis_mapping, &point, true);
        self.axis_mapping
            .iter()
            .map(|(axis, motor)| {
                let v = velocities[axis];
                (axis.clone(), point.lower_of(axis) - motor.ramp_distance(0.0, v))
            })
            .collect()
    }

    /// CS demands and move time to bring every axis to the run-up position.
    pub fn move_to_start(&mut self) -> (BTreeMap<char, f64>, f64) {
        let start = self.run_up_position();
        let mut demands = BTreeMap::new();
        let mut move_time: f64 = 0.0;
        for (axis, motor) in &self.axis_mapping {
            let target = start.get(axis).copied().unwrap_or(motor.current_position);
            let p = motor.make_velocity_profile(0.0, 0.0, target - motor.current_position, 0.0, self.cfg.min_interval);
            move_time = move_time.max(p.t_total());
            demands.insert(motor.cs_axis, target);
        }
        (demands, move_time)
    }

    /// Plan samples until the buffer exceeds `profile_points` or the run ends.
    pub fn emit(&mut self) -> Result<()> {
        if !self.run_up_done {
            self.emit_run_up()?;
            self.run_up_done = true;
        }
        while self.end_index < self.steps_up_to && self.buffer.len() <= self.cfg.profile_points {
            self.emit_point()?;
        }
        if self.end_index >= self.steps_up_to && !self.tail_done {
            self.emit_tail_off()?;
            self.tail_done = true;
        }
        Ok(())
    }

    fn emit_run_up(&mut self) -> Result<()> {
        if self.start_index >= self.steps_up_to {
            return Ok(());
        }
        let point = self.point(self.start_index);
        let velocities = point_velocities(&self.axis_mapping, &point, true);
        let ramp = self
            .axis_mapping
            .iter()
            .map(|(axis, m)| m.acceleration_time(0.0, velocities[axis]))
            .fold(0.0, f64::max);
        let dt = ramp.max(self.cfg.min_interval);
        self.push(dt, point.lower.clone(), VelocityMode::RealPrevToCurrent, PointType::StartOfRow, self.start_index)
    }

    fn emit_point(&mut self) -> Result<()> {
        let i = self.end_index;
        let point = self.point(i);
        let next = (i + 1 < self.steps_up_to).then(|| self.point(i + 1));
        let joined = next.as_ref().is_some_and(|n| points_joined(&self.axis_mapping, &point, n));
        let nonlinear = point_is_nonlinear(&self.axis_mapping, &point);

        if self.mode == TriggerMode::EveryPoint || nonlinear {
            if self.time_since_last_pvt > 0.0 {
                let dt = std::mem::take(&mut self.time_since_last_pvt);
                self.push(dt, point.lower.clone(), VelocityMode::AveragePrevToNext, PointType::PointJoin, i)?;
            }
            let half = point.duration / 2.0;
            self.push(half, point.positions.clone(), VelocityMode::AveragePrevToNext, PointType::MidPoint, i)?;
            self.push_boundary(half, &point, joined, i + 1)?;
        } else {
            self.time_since_last_pvt += point.duration;
            let same_velocity = next
                .as_ref()
                .is_some_and(|n| points_same_velocity(&self.axis_mapping, &point, n));
            if joined && same_velocity {
                self.skipped_in_row = true;
            } else {
                let dt = std::mem::take(&mut self.time_since_last_pvt);
                self.push_boundary(dt, &point, joined, i + 1)?;
            }
        }

        if let Some(next) = next.filter(|_| !joined) {
            self.emit_turnaround(&point, &next, i + 1)?;
        }
        self.end_index = i + 1;
        Ok(())
    }

    fn push_boundary(&mut self, dt: f64, point: &ScanPoint, joined: bool, steps: usize) -> Result<()> {
        let (mode, kind) = if joined {
            (VelocityMode::AveragePrevToNext, PointType::PointJoin)
        } else if self.skipped_in_row {
            (VelocityMode::AveragePrevToCurrent, PointType::EndOfRow)
        } else {
            (VelocityMode::RealPrevToCurrent, PointType::EndOfRow)
        };
        if !joined {
            self.skipped_in_row = false;
        }
        self.push(dt, point.upper.clone(), mode, kind, steps)
    }

    fn emit_turnaround(&mut self, point: &ScanPoint, next: &ScanPoint, steps: usize) -> Result<()> {
        let turnaround = profile_between_points(
            &self.axis_mapping,
            point,
            next,
            self.cfg.min_turnaround,
            self.cfg.min_interval,
        )?;
        let samples = turnaround.samples(&self.axis_mapping, point, next, self.cfg.min_interval);
        let last = samples.len().saturating_sub(1);
        for (k, s) in samples.into_iter().enumerate() {
            let kind = if k == last { PointType::StartOfRow } else { PointType::Turnaround };
            self.push(s.dt, s.positions, VelocityMode::RealPrevToCurrent, kind, steps)?;
        }
        Ok(())
    }

    fn emit_tail_off(&mut self) -> Result<()> {
        if self.steps_up_to <= self.start_index {
            // Nothing to scan: a single dead sample where we stand.
            let here = self.buffer.last_positions().clone();
            return self.push(self.cfg.min_interval, here, VelocityMode::ZeroVelocity, PointType::EndOfRow, self.steps_up_to);
        }
        let point = self.point(self.steps_up_to - 1);
        let velocities = point_velocities(&self.axis_mapping, &point, false);
        let mut positions = AxisPositions::new();
        let mut ramp: f64 = 0.0;
        for (axis, motor) in &self.axis_mapping {
            let v = velocities[axis];
            positions.insert(axis.clone(), point.upper_of(axis) + motor.ramp_distance(v, 0.0));
            ramp = ramp.max(motor.acceleration_time(v, 0.0));
        }
        let dt = ramp.max(self.cfg.min_interval);
        self.push(dt, positions, VelocityMode::ZeroVelocity, PointType::Turnaround, self.steps_up_to)
    }

    fn push(&mut self, dt: f64, positions: AxisPositions, mode: VelocityMode, kind: PointType, steps: usize) -> Result<()> {
        for (axis, motor) in &self.axis_mapping {
            if let Some(&p) = positions.get(axis) {
                motor.check_soft_limit(p)?;
            }
        }
        tracing::trace!(dt, ?mode, ?kind, steps, "profile sample");
        self.buffer.push_point(dt, positions, mode, kind, steps, &mut self.lookup);
        Ok(())
    }

    /// Next chunk to write, holding back one sample until planning is done.
    pub fn take_chunk(&mut self) -> Option<ProfileWrite> {
        let chunk = self.buffer.take_chunk(&self.axis_mapping, self.tail_done)?;
        self.written += chunk.len();
        tracing::debug!(samples = chunk.len(), written = self.written, end_index = self.end_index, "profile chunk");
        Some(chunk)
    }

    /// Completed steps after `scanned` samples have executed.
    pub fn completed_steps(&self, scanned: usize) -> usize {
        if scanned == 0 {
            return self.start_index;
        }
        self.lookup.get(scanned - 1).unwrap_or_else(|| self.lookup.last().unwrap_or(self.start_index))
    }

    /// Record progress; returns the completed-steps value and, when the
    /// controller is running low, the next chunk to append.
    pub fn update_step(&mut self, scanned: usize) -> Result<(usize, Option<ProfileWrite>)> {
        let completed = self.completed_steps(scanned);
        self.lookup.trim_before(scanned.saturating_sub(1));
        let mut chunk = None;
        if !self.all_written() && self.lookup.total().saturating_sub(scanned) < self.cfg.profile_points {
            self.emit()?;
            chunk = self.take_chunk();
        }
        Ok((completed, chunk))
    }
}
