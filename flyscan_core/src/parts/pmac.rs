//! Part binding the trajectory planner to a motion controller.

use std::time::Duration;

use flyscan_traits::{MotionController, ProfileEvent, ProfileWrite, UserProgram, VelocityMode};

use crate::config::PlannerCfg;
use crate::context::{HookResult, PartContext};
use crate::error::ScanError;
use crate::hooks::{DatasetKind, Info, Part, PartInfo, StepWindow, min_turnaround, trigger_mode};
use crate::hw_error::hw_report;
use crate::motor::{MotorInfo, cs_axis_mapping};
use crate::params::{ConfigureParams, ParameterTweakInfo};
use crate::profile::TriggerMode;
use crate::trajectory::TrajectoryPlanner;
use crate::util::{PROFILE_TICK_S, servo_period};

pub struct TrajectoryPart {
    name: String,
    pmac: Box<dyn MotionController>,
    cfg: PlannerCfg,
    /// Outputs for the current scan, from the parts that reported.
    mode: TriggerMode,
    /// Coordinate system used for scans that move no axes.
    default_cs_port: Option<String>,
    planner: Option<TrajectoryPlanner>,
    cs_port: Option<String>,
    /// Nothing to move and no outputs to drive.
    skipped: bool,
}

impl TrajectoryPart {
    pub fn new(name: &str, pmac: Box<dyn MotionController>, cfg: PlannerCfg) -> Self {
        Self {
            name: name.to_string(),
            pmac,
            cfg,
            mode: TriggerMode::None,
            default_cs_port: None,
            planner: None,
            cs_port: None,
            skipped: false,
        }
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    #[must_use]
    pub fn with_default_cs_port(mut self, cs_port: &str) -> Self {
        self.default_cs_port = Some(cs_port.to_string());
        self
    }

    pub fn planner(&self) -> Option<&TrajectoryPlanner> {
        self.planner.as_ref()
    }

    /// Planner settings with turnaround constraints from the controller applied.
    fn planner_cfg(&self, part_info: &PartInfo) -> PlannerCfg {
        let mut cfg = self.cfg.clone();
        if let Some((gap, interval)) = min_turnaround(part_info) {
            cfg.min_turnaround = gap;
            cfg.min_interval = interval;
        }
        cfg
    }

    fn moving_axes(params: &ConfigureParams) -> Vec<String> {
        params
            .generator
            .axes()
            .into_iter()
            .filter(|a| params.axes_to_move.contains(a))
            .collect()
    }

    fn write(&mut self, cs_port: Option<&str>, chunk: &ProfileWrite) -> HookResult<()> {
        tracing::debug!(part = %self.name, samples = chunk.len(), fresh = cs_port.is_some(), "write profile");
        self.pmac.write_profile(cs_port, chunk).map_err(hw_report)?;
        Ok(())
    }

    /// Load a single zero-velocity sample that clears the user outputs.
    fn reset_triggers(&mut self, ctx: &PartContext) -> HookResult<()> {
        let Some(cs_port) = self.cs_port.clone() else {
            return Ok(());
        };
        let ticks = (self.cfg.min_interval / PROFILE_TICK_S).round() as u32;
        let profile = ProfileWrite {
            time_array: vec![ticks],
            velocity_mode: vec![VelocityMode::ZeroVelocity],
            user_programs: vec![UserProgram::Zero],
            positions: std::collections::BTreeMap::new(),
        };
        self.write(Some(&cs_port), &profile)?;
        let events = self.pmac.execute_profile().map_err(hw_report)?;
        loop {
            match ctx.wait(&events, "trigger reset profile")? {
                ProfileEvent::Finished => return Ok(()),
                ProfileEvent::Failed(msg) => return Err(ScanError::HardwareFault(msg).into()),
                ProfileEvent::PointsScanned(_) => {}
            }
        }
    }
}

impl Part for TrajectoryPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn report_status(&mut self, _ctx: &PartContext) -> HookResult<Vec<Info>> {
        let layout = self.pmac.layout().map_err(hw_report)?;
        let mut infos = Vec::with_capacity(layout.len());
        for row in layout {
            let rec = self.pmac.motor(&row.mri).map_err(hw_report)?;
            match MotorInfo::from_record(&row.name, &row.mri, &rec) {
                Ok(m) => infos.push(Info::Motor(m)),
                Err(e) => tracing::debug!(motor = %row.name, error = %e, "motor not scannable"),
            }
        }
        Ok(infos)
    }

    fn validate(&mut self, _ctx: &PartContext, params: &ConfigureParams, part_info: &PartInfo) -> HookResult<Vec<ParameterTweakInfo>> {
        let axes = Self::moving_axes(params);
        if axes.is_empty() && trigger_mode(part_info) == TriggerMode::None {
            return Ok(Vec::new());
        }
        let cfg = self.planner_cfg(part_info);
        let i10 = self.pmac.i10().map_err(hw_report)?;
        let servo = servo_period(i10);
        if cfg.min_interval < servo {
            return Err(ScanError::Validation(format!(
                "minimum interval {} s is shorter than the servo period {servo} s",
                cfg.min_interval
            ))
            .into());
        }
        let (_, mapping) = cs_axis_mapping(self.pmac.as_ref(), &axes)?;
        for motor in mapping.values() {
            if let Some(units) = params.generator.units(&motor.scannable)
                && units != motor.units
            {
                return Err(ScanError::Validation(format!(
                    "{} scans in {units} but the motor works in {}",
                    motor.scannable, motor.units
                ))
                .into());
            }
        }
        if mapping.is_empty() && self.default_cs_port.is_none() && params.generator.size() > 0 {
            return Err(ScanError::Config("no axes to move and no default coordinate system".into()).into());
        }
        Ok(Vec::new())
    }

    fn configure(&mut self, ctx: &PartContext, window: StepWindow, params: &ConfigureParams, part_info: &PartInfo) -> HookResult<Vec<Info>> {
        self.mode = trigger_mode(part_info);
        let axes = Self::moving_axes(params);
        self.skipped = axes.is_empty() && self.mode == TriggerMode::None;
        if self.skipped {
            tracing::debug!(part = %self.name, "no axes and no outputs; trajectory skipped");
            self.planner = None;
            return Ok(Vec::new());
        }
        if params.generator.duration <= 0.0 {
            return Err(ScanError::Validation("trajectory scans need a fixed point duration".into()).into());
        }
        let (cs_port, mapping) = cs_axis_mapping(self.pmac.as_ref(), &axes)?;
        let cs_port = if mapping.is_empty() {
            self.default_cs_port
                .clone()
                .ok_or_else(|| ScanError::Config("no default coordinate system for a scan without axes".into()))?
        } else {
            cs_port
        };
        self.cs_port = Some(cs_port.clone());
        if self.mode != TriggerMode::None {
            self.reset_triggers(ctx)?;
        }

        let mut planner = TrajectoryPlanner::new(self.planner_cfg(part_info), params.generator.clone(), mapping, self.mode);
        planner.start(window.completed_steps, window.steps_to_do);
        tracing::info!(
            part = %self.name,
            cs_port = %cs_port,
            mode = ?self.mode,
            completed_steps = window.completed_steps,
            steps_to_do = window.steps_to_do,
            "configure trajectory"
        );

        let (demands, move_time) = planner.move_to_start();
        if !demands.is_empty() {
            let done = self.pmac.move_cs(&cs_port, &demands, move_time).map_err(hw_report)?;
            ctx.wait_completion(&done, Some(ctx.timeout() + Duration::from_secs_f64(move_time)), "move to run-up")?;
        }
        planner.emit()?;
        if let Some(chunk) = planner.take_chunk() {
            self.write(Some(&cs_port), &chunk)?;
        }
        let infos = planner
            .axis_mapping()
            .keys()
            .map(|axis| Info::Dataset {
                name: format!("{axis}.value_set"),
                kind: DatasetKind::PositionSetpoint,
                rank: 1,
            })
            .collect();
        self.planner = Some(planner);
        Ok(infos)
    }

    fn run(&mut self, ctx: &PartContext) -> HookResult<()> {
        if self.skipped {
            return Ok(());
        }
        if self.planner.is_none() {
            return Err(ScanError::State("trajectory not configured".into()).into());
        }
        let events = self.pmac.execute_profile().map_err(hw_report)?;
        let stall = ctx.timeout() + Duration::from_secs_f64(self.cfg.max_move_time);
        loop {
            match ctx.wait_for(&events, Some(stall), "profile progress")? {
                ProfileEvent::PointsScanned(scanned) => {
                    let Some(planner) = self.planner.as_mut() else {
                        return Err(ScanError::State("trajectory reset while running".into()).into());
                    };
                    let (completed, chunk) = planner.update_step(scanned)?;
                    ctx.report_progress(completed);
                    if let Some(chunk) = chunk {
                        self.write(None, &chunk)?;
                    }
                }
                ProfileEvent::Finished => break,
                ProfileEvent::Failed(msg) => return Err(ScanError::HardwareFault(format!("profile failed: {msg}")).into()),
            }
        }
        if let Some(planner) = &self.planner {
            ctx.report_progress(planner.steps_up_to());
        }
        Ok(())
    }

    fn seek(&mut self, ctx: &PartContext, window: StepWindow, params: &ConfigureParams, part_info: &PartInfo) -> HookResult<()> {
        if !self.skipped {
            self.pmac.abort_profile().map_err(hw_report)?;
        }
        self.configure(ctx, window, params, part_info).map(drop)
    }

    fn abort(&mut self, _ctx: &PartContext) -> HookResult<()> {
        if let Err(e) = self.pmac.abort_profile() {
            tracing::warn!(part = %self.name, error = %e, "abort profile failed");
        }
        Ok(())
    }

    fn reset(&mut self, ctx: &PartContext) -> HookResult<()> {
        self.planner = None;
        self.reset_triggers(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{CompoundGenerator, LineGenerator};
    use crate::config::RowTrigger;
    use crate::mocks::{MockMotionController, PmacCall};
    use flyscan_traits::MotorRecord;
    use rstest::rstest;

    fn pmac() -> MockMotionController {
        let rec = |cs: &str| MotorRecord {
            cs: cs.to_string(),
            max_velocity: 1.0,
            acceleration_time: 0.4,
            ..MotorRecord::default()
        };
        MockMotionController::new()
            .with_motor("x", "BL:X", rec("CS1,A"))
            .with_motor("y", "BL:Y", rec("CS1,B"))
            .with_motor("z", "BL:Z", MotorRecord::default())
    }

    fn params() -> ConfigureParams {
        let g = CompoundGenerator::new(
            vec![
                LineGenerator::new("y", "mm", 0.0, 0.1, 2, false).into(),
                LineGenerator::new("x", "mm", 0.0, 0.5, 3, true).into(),
            ],
            1.0,
        );
        ConfigureParams::new(g, vec!["x".into(), "y".into()])
    }

    fn ctx() -> PartContext {
        PartContext::detached("pmac", Duration::from_secs(1))
    }

    fn window() -> StepWindow {
        StepWindow {
            completed_steps: 0,
            steps_to_do: 6,
            total_steps: 6,
        }
    }

    /// Parts that make the trajectory pulse once per point.
    fn every_point() -> PartInfo {
        let mut pi = PartInfo::new();
        pi.insert("det".into(), vec![Info::DetectorTrigger]);
        pi
    }

    fn sequencer(row_trigger: RowTrigger) -> PartInfo {
        let mut pi = every_point();
        pi.insert("panda".into(), vec![Info::SequencerTrigger(row_trigger)]);
        pi
    }

    fn static_params() -> ConfigureParams {
        let g = CompoundGenerator::new(vec![crate::generator::StaticPointGenerator::new(6).into()], 0.1);
        ConfigureParams::new(g, vec![])
    }

    #[test]
    fn reports_only_cs_motors() {
        let mut part = TrajectoryPart::new("pmac", Box::new(pmac()), PlannerCfg::default());
        let infos = part.report_status(&ctx()).unwrap();
        assert_eq!(infos.len(), 2);
    }

    #[test]
    fn servo_period_bounds_min_interval() {
        let cfg = PlannerCfg {
            min_interval: 0.0001,
            ..PlannerCfg::default()
        };
        let mut part = TrajectoryPart::new("pmac", Box::new(pmac()), cfg);
        assert!(part.validate(&ctx(), &params(), &every_point()).is_err());
    }

    #[test]
    fn configure_moves_then_writes_and_run_finishes() {
        let hw = pmac();
        let mut part = TrajectoryPart::new("pmac", Box::new(hw.clone()), PlannerCfg::default());
        let infos = part.configure(&ctx(), window(), &params(), &PartInfo::new()).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(part.mode(), TriggerMode::None);
        let calls = hw.calls();
        let PmacCall::MoveCs { cs_port, demands, .. } = &calls[0] else {
            panic!("{calls:?}")
        };
        assert_eq!(cs_port, "CS1");
        assert!((demands[&'A'] - -0.1375).abs() < 1e-9);
        assert!(matches!(&calls[1], PmacCall::WriteProfile { cs_port: Some(p), .. } if p == "CS1"));

        part.run(&ctx()).unwrap();
        let profile = hw.current_profile();
        assert_eq!(profile.velocity_mode.last(), Some(&VelocityMode::ZeroVelocity));
        assert_eq!(hw.count(|c| matches!(c, PmacCall::ExecuteProfile)), 1);
    }

    #[test]
    fn outputs_are_zeroed_before_the_run_up() {
        let hw = pmac();
        let mut part = TrajectoryPart::new("pmac", Box::new(hw.clone()), PlannerCfg::default());
        part.configure(&ctx(), window(), &params(), &every_point()).unwrap();
        assert_eq!(part.mode(), TriggerMode::EveryPoint);

        let calls = hw.calls();
        let PmacCall::WriteProfile { cs_port: Some(port), profile } = &calls[0] else {
            panic!("{calls:?}")
        };
        assert_eq!(port, "CS1");
        assert_eq!(profile.user_programs, vec![UserProgram::Zero]);
        assert_eq!(profile.velocity_mode, vec![VelocityMode::ZeroVelocity]);
        assert!(matches!(calls[1], PmacCall::ExecuteProfile));
        assert!(matches!(calls[2], PmacCall::MoveCs { .. }));
        let PmacCall::WriteProfile { profile, .. } = &calls[3] else {
            panic!("{calls:?}")
        };
        assert_eq!(profile.user_programs[0], UserProgram::Live);
        assert_eq!(calls.len(), 4);
    }

    #[rstest]
    #[case(every_point(), TriggerMode::EveryPoint)]
    #[case(sequencer(RowTrigger::MotionController), TriggerMode::RowGate)]
    #[case(sequencer(RowTrigger::PositionCompare), TriggerMode::None)]
    #[case(sequencer(RowTrigger::None), TriggerMode::None)]
    #[case(PartInfo::new(), TriggerMode::None)]
    fn mode_follows_reporting_parts(#[case] part_info: PartInfo, #[case] want: TriggerMode) {
        let hw = pmac();
        let mut part = TrajectoryPart::new("pmac", Box::new(hw.clone()), PlannerCfg::default());
        part.configure(&ctx(), window(), &params(), &part_info).unwrap();
        assert_eq!(part.mode(), want);
        let resets = hw.count(|c| {
            matches!(c, PmacCall::WriteProfile { profile, .. } if profile.user_programs == vec![UserProgram::Zero])
        });
        assert_eq!(resets, usize::from(want != TriggerMode::None));
        let programs = hw.current_profile().user_programs;
        match want {
            TriggerMode::EveryPoint => assert!(programs.contains(&UserProgram::Mid)),
            TriggerMode::RowGate => {
                assert!(programs.contains(&UserProgram::Live));
                assert!(!programs.contains(&UserProgram::Mid));
            }
            TriggerMode::None => assert!(programs.iter().all(|p| *p == UserProgram::NoProgram)),
        }
    }

    #[test]
    fn reset_loads_trigger_reset_profile() {
        let hw = pmac();
        let mut part = TrajectoryPart::new("pmac", Box::new(hw.clone()), PlannerCfg::default());
        part.configure(&ctx(), window(), &params(), &every_point()).unwrap();
        hw.clear_calls();
        part.reset(&ctx()).unwrap();
        let p = hw.current_profile();
        assert_eq!(p.velocity_mode, vec![VelocityMode::ZeroVelocity]);
        assert_eq!(p.user_programs, vec![UserProgram::Zero]);
        assert_eq!(p.time_array, vec![2000]);
    }

    #[test]
    fn scan_without_axes_needs_default_cs() {
        let p = static_params();
        let mut part = TrajectoryPart::new("pmac", Box::new(pmac()), PlannerCfg::default());
        assert!(part.configure(&ctx(), window(), &p, &every_point()).is_err());
        let hw = pmac();
        let mut part = TrajectoryPart::new("pmac", Box::new(hw.clone()), PlannerCfg::default()).with_default_cs_port("CS1");
        part.configure(&ctx(), window(), &p, &every_point()).unwrap();
        assert_eq!(hw.count(|c| matches!(c, PmacCall::MoveCs { .. })), 0);
        part.run(&ctx()).unwrap();
    }

    #[test]
    fn scan_without_axes_or_outputs_is_skipped() {
        let hw = pmac();
        let mut part = TrajectoryPart::new("pmac", Box::new(hw.clone()), PlannerCfg::default());
        let p = static_params();
        let pi = sequencer(RowTrigger::PositionCompare);
        assert!(part.validate(&ctx(), &p, &pi).unwrap().is_empty());
        assert!(part.configure(&ctx(), window(), &p, &pi).unwrap().is_empty());
        part.run(&ctx()).unwrap();
        part.seek(&ctx(), window(), &p, &pi).unwrap();
        assert!(hw.calls().is_empty());
        assert!(part.planner().is_none());
    }
}
