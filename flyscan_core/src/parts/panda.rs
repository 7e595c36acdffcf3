//! Part driving a double-buffered pair of sequencer tables behind a gate.

use std::collections::BTreeMap;

use crossbeam_channel as xch;
use flyscan_traits::{Gate, Sequencer};

use crate::config::SequencerCfg;
use crate::context::{ControlOutcome, HookResult, PartContext};
use crate::double_buffer::DoubleBuffer;
use crate::error::ScanError;
use crate::hooks::{Info, Part, PartInfo, StepWindow, min_turnaround, motor_infos, position_captures};
use crate::hw_error::hw_report;
use crate::motor::AxisMapping;
use crate::params::ConfigureParams;
use crate::seq_builder::{PositionCapture, SeqRowGenerator};

pub struct SequencerPart {
    name: String,
    db: DoubleBuffer,
    gate: Box<dyn Gate>,
    cfg: SequencerCfg,
    /// Encoders wired to this sequencer's position buses.
    captures: BTreeMap<String, PositionCapture>,
}

impl SequencerPart {
    pub fn new(
        name: &str,
        table_a: Box<dyn Sequencer>,
        table_b: Box<dyn Sequencer>,
        gate: Box<dyn Gate>,
        cfg: SequencerCfg,
    ) -> Self {
        Self {
            name: name.to_string(),
            db: DoubleBuffer::new(table_a, table_b, cfg.clone()),
            gate,
            cfg,
            captures: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_capture(mut self, axis: &str, capture: PositionCapture) -> Self {
        self.captures.insert(axis.to_string(), capture);
        self
    }

    fn reset_gate(&mut self) {
        if let Err(e) = self.gate.force_reset() {
            tracing::warn!(part = %self.name, error = %e, "gate reset failed");
        }
    }

    fn load(&mut self, window: StepWindow, params: &ConfigureParams, part_info: &PartInfo) -> HookResult<()> {
        let scan_axes = params.generator.axes();
        let mapping: AxisMapping = motor_infos(part_info)
            .filter(|m| params.axes_to_move.contains(&m.scannable) && scan_axes.contains(&m.scannable))
            .map(|m| (m.scannable.clone(), m.clone()))
            .collect();
        let mut captures = self.captures.clone();
        for (axis, capture) in position_captures(part_info) {
            captures.entry(axis.to_string()).or_insert(*capture);
        }
        let mut rows = SeqRowGenerator::new(
            params.generator.clone(),
            mapping,
            captures,
            self.cfg.row_trigger,
            self.cfg.max_repeats,
            self.cfg.table_rows,
            window.completed_steps,
            window.end(),
        )?;
        if let Some((gap, interval)) = min_turnaround(part_info) {
            rows = rows.with_turnaround(gap, interval);
        }
        tracing::info!(
            part = %self.name,
            completed_steps = window.completed_steps,
            steps_to_do = window.steps_to_do,
            trigger = ?self.cfg.row_trigger,
            "configure sequencer"
        );
        self.db.configure(rows)?;
        Ok(())
    }
}

impl Part for SequencerPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn report_status(&mut self, _ctx: &PartContext) -> HookResult<Vec<Info>> {
        let mut infos = vec![Info::SequencerTrigger(self.cfg.row_trigger)];
        infos.extend(self.captures.iter().map(|(axis, capture)| Info::PositionCapture {
            axis: axis.clone(),
            capture: *capture,
        }));
        Ok(infos)
    }

    fn configure(&mut self, _ctx: &PartContext, window: StepWindow, params: &ConfigureParams, part_info: &PartInfo) -> HookResult<Vec<Info>> {
        self.reset_gate();
        self.load(window, params, part_info)?;
        Ok(Vec::new())
    }

    fn run(&mut self, ctx: &PartContext) -> HookResult<()> {
        let [a, b] = self.db.run()?;
        self.gate.force_set().map_err(hw_report)?;
        let signal = ctx.abort_token().signal().clone();
        while !self.db.finished() {
            let (index, msg) = xch::select! {
                recv(a) -> m => (0, m),
                recv(b) -> m => (1, m),
                recv(signal) -> _ => return Err(ControlOutcome::Aborted),
            };
            let active = msg.map_err(|_| ScanError::Hardware("sequencer active subscription closed".into()))?;
            self.db.handle_active(index, active)?;
        }
        Ok(())
    }

    fn post_run_armed(&mut self, ctx: &PartContext, window: StepWindow, params: &ConfigureParams, part_info: &PartInfo) -> HookResult<()> {
        self.db.clean_up();
        self.configure(ctx, window, params, part_info).map(drop)
    }

    fn post_run_ready(&mut self, _ctx: &PartContext) -> HookResult<()> {
        self.reset_gate();
        self.db.clean_up();
        Ok(())
    }

    fn seek(&mut self, ctx: &PartContext, window: StepWindow, params: &ConfigureParams, part_info: &PartInfo) -> HookResult<()> {
        self.db.clean_up();
        self.configure(ctx, window, params, part_info).map(drop)
    }

    fn abort(&mut self, _ctx: &PartContext) -> HookResult<()> {
        self.reset_gate();
        self.db.clean_up();
        Ok(())
    }

    fn reset(&mut self, _ctx: &PartContext) -> HookResult<()> {
        self.reset_gate();
        self.db.clean_up();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RowTrigger;
    use crate::generator::{CompoundGenerator, LineGenerator, StaticPointGenerator};
    use crate::mocks::{MockGate, MockSequencer};
    use crate::motor::MotorInfo;
    use crate::seq_rows::LIVE_OUT;
    use flyscan_traits::{MotorRecord, SeqTrigger};
    use std::time::Duration;

    fn ctx() -> PartContext {
        PartContext::detached("panda", Duration::from_secs(1))
    }

    fn part(cfg: SequencerCfg) -> (SequencerPart, MockSequencer, MockSequencer, MockGate) {
        let (a, b, g) = (MockSequencer::new(), MockSequencer::new(), MockGate::new());
        let p = SequencerPart::new("panda", Box::new(a.clone()), Box::new(b.clone()), Box::new(g.clone()), cfg);
        (p, a, b, g)
    }

    fn window(n: usize) -> StepWindow {
        StepWindow {
            completed_steps: 0,
            steps_to_do: n,
            total_steps: n,
        }
    }

    #[test]
    fn single_table_scan_runs_straight_through() {
        let (mut p, a, b, g) = part(SequencerCfg {
            row_trigger: RowTrigger::None,
            ..SequencerCfg::default()
        });
        let params = ConfigureParams::new(CompoundGenerator::new(vec![StaticPointGenerator::new(5).into()], 0.1), vec![]);
        p.configure(&ctx(), window(5), &params, &PartInfo::new()).unwrap();
        assert_eq!(a.tables().len(), 1);
        assert!(b.tables().is_empty());
        p.run(&ctx()).unwrap();
        p.post_run_ready(&ctx()).unwrap();
        assert_eq!(g.calls(), vec!["force_reset", "force_set", "force_reset"]);
    }

    #[test]
    fn refills_tables_as_they_drain() {
        let (mut p, a, b, _g) = part(SequencerCfg {
            table_rows: 4,
            max_repeats: 1,
            min_table_duration: 0.0,
            row_trigger: RowTrigger::None,
        });
        let params = ConfigureParams::new(CompoundGenerator::new(vec![StaticPointGenerator::new(20).into()], 0.1), vec![]);
        p.configure(&ctx(), window(20), &params, &PartInfo::new()).unwrap();
        assert_eq!(a.tables().len(), 1);
        assert_eq!(b.tables().len(), 1);

        let h = std::thread::spawn(move || p.run(&ctx()).map_err(|e| format!("{e:?}")));
        while a.subscriber_count() == 0 || b.subscriber_count() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        for i in 0..200 {
            if h.is_finished() {
                break;
            }
            let table = if i % 2 == 0 { &a } else { &b };
            table.set_active(true);
            table.set_active(false);
            std::thread::sleep(Duration::from_millis(5));
        }
        h.join().unwrap().unwrap();
        let tables: Vec<_> = a.tables().into_iter().chain(b.tables()).collect();
        assert!(tables.len() > 2);
        let live: u32 = tables
            .iter()
            .flat_map(|t| t.rows().collect::<Vec<_>>())
            .filter(|r| r.out1.contains(LIVE_OUT))
            .map(|r| r.repeats)
            .sum();
        assert_eq!(live, 20);
    }

    #[test]
    fn position_compare_uses_reported_captures() {
        let (mut p, a, _b, _g) = part(SequencerCfg::default());
        let rec = MotorRecord {
            cs: "CS1,A".into(),
            acceleration_time: 0.4,
            ..MotorRecord::default()
        };
        let mut info = PartInfo::new();
        info.insert("pmac".into(), vec![Info::Motor(MotorInfo::from_record("x", "X", &rec).unwrap())]);
        info.insert(
            "enc".into(),
            vec![Info::PositionCapture {
                axis: "x".into(),
                capture: PositionCapture {
                    bus: 'A',
                    scale: 0.001,
                    offset: 0.0,
                },
            }],
        );
        let g = CompoundGenerator::new(vec![LineGenerator::new("x", "mm", 0.0, 0.5, 3, false).into()], 1.0);
        let params = ConfigureParams::new(g, vec!["x".into()]);
        p.configure(&ctx(), window(3), &params, &info).unwrap();
        let first = a.tables()[0].row(0).unwrap();
        assert_eq!(first.trigger, SeqTrigger::PosaGt);
        assert_eq!(first.position, -125);
    }

    #[test]
    fn position_compare_needs_a_capture() {
        let (mut p, _a, _b, _g) = part(SequencerCfg::default());
        let rec = MotorRecord {
            cs: "CS1,A".into(),
            ..MotorRecord::default()
        };
        let mut info = PartInfo::new();
        info.insert("pmac".into(), vec![Info::Motor(MotorInfo::from_record("x", "X", &rec).unwrap())]);
        let g = CompoundGenerator::new(vec![LineGenerator::new("x", "mm", 0.0, 0.5, 3, false).into()], 1.0);
        let params = ConfigureParams::new(g, vec!["x".into()]);
        assert!(p.configure(&ctx(), window(3), &params, &info).is_err());
    }

    #[test]
    fn reports_wired_captures() {
        let (p, ..) = part(SequencerCfg::default());
        let mut p = p.with_capture(
            "x",
            PositionCapture {
                bus: 'B',
                scale: 1.0,
                offset: 0.0,
            },
        );
        let infos = p.report_status(&ctx()).unwrap();
        assert_eq!(infos[0], Info::SequencerTrigger(RowTrigger::PositionCompare));
        assert!(matches!(&infos[1..], [Info::PositionCapture { axis, capture }] if axis == "x" && capture.bus == 'B'));
    }
}
