//! The part contract: lifecycle hooks a controller broadcasts to its parts,
//! and the infos parts hand back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::RowTrigger;
use crate::context::{HookResult, PartContext};
use crate::motor::MotorInfo;
use crate::params::{ConfigureParams, ConfigureParamsInfo, ParameterTweakInfo};
use crate::profile::TriggerMode;
use crate::seq_builder::PositionCapture;

/// Steps a configure or seek covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepWindow {
    pub completed_steps: usize,
    pub steps_to_do: usize,
    pub total_steps: usize,
}

impl StepWindow {
    pub fn end(&self) -> usize {
        self.completed_steps + self.steps_to_do
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Primary,
    Secondary,
    PositionSetpoint,
}

/// Information a part reports from a hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Info {
    /// A motor the reporting motion controller can scan.
    Motor(MotorInfo),
    /// An axis whose encoder reaches a sequencer position bus.
    PositionCapture { axis: String, capture: PositionCapture },
    /// A dataset this scan will write.
    Dataset { name: String, kind: DatasetKind, rank: usize },
    /// Turnaround constraints published by the controller.
    MinTurnaround { gap: f64, interval: f64 },
    /// A sequencer gating the detectors, starting rows on `RowTrigger`.
    SequencerTrigger(RowTrigger),
    /// A detector expecting one hardware trigger per point.
    DetectorTrigger,
}

/// Infos from the last report-status broadcast, by part name.
pub type PartInfo = BTreeMap<String, Vec<Info>>;

pub fn motor_infos(part_info: &PartInfo) -> impl Iterator<Item = &MotorInfo> {
    part_info.values().flatten().filter_map(|i| match i {
        Info::Motor(m) => Some(m),
        _ => None,
    })
}

pub fn position_captures(part_info: &PartInfo) -> impl Iterator<Item = (&str, &PositionCapture)> {
    part_info.values().flatten().filter_map(|i| match i {
        Info::PositionCapture { axis, capture } => Some((axis.as_str(), capture)),
        _ => None,
    })
}

/// Turnaround constraints, if any part published them.
pub fn min_turnaround(part_info: &PartInfo) -> Option<(f64, f64)> {
    part_info.values().flatten().find_map(|i| match i {
        Info::MinTurnaround { gap, interval } => Some((*gap, *interval)),
        _ => None,
    })
}

/// Outputs the motion controller's user programs drive for the parts present.
///
/// A sequencer owns the detector triggers when there is one, so only its row
/// trigger matters. Detectors on their own need a pulse per point.
pub fn trigger_mode(part_info: &PartInfo) -> TriggerMode {
    let mut sequencer = None;
    let mut detector = false;
    for info in part_info.values().flatten() {
        match info {
            Info::SequencerTrigger(row_trigger) => {
                let mode = TriggerMode::from(*row_trigger);
                if sequencer.is_none() || mode == TriggerMode::RowGate {
                    sequencer = Some(mode);
                }
            }
            Info::DetectorTrigger => detector = true,
            _ => {}
        }
    }
    match sequencer {
        Some(mode) => mode,
        None if detector => TriggerMode::EveryPoint,
        None => TriggerMode::None,
    }
}

/// A collaborator of the scan controller. Every hook defaults to doing
/// nothing; seek and post-run-armed default to a fresh configure.
#[allow(unused_variables)]
pub trait Part: Send {
    fn name(&self) -> &str;

    /// Parameters this part adds to the controller's configure contract.
    fn configure_params(&self) -> ConfigureParamsInfo {
        ConfigureParamsInfo::default()
    }

    fn validate(&mut self, ctx: &PartContext, params: &ConfigureParams, part_info: &PartInfo) -> HookResult<Vec<ParameterTweakInfo>> {
        Ok(Vec::new())
    }

    fn pre_configure(&mut self, ctx: &PartContext) -> HookResult<()> {
        Ok(())
    }

    fn report_status(&mut self, ctx: &PartContext) -> HookResult<Vec<Info>> {
        Ok(Vec::new())
    }

    fn configure(
        &mut self,
        ctx: &PartContext,
        window: StepWindow,
        params: &ConfigureParams,
        part_info: &PartInfo,
    ) -> HookResult<Vec<Info>> {
        Ok(Vec::new())
    }

    fn post_configure(&mut self, ctx: &PartContext, part_info: &PartInfo) -> HookResult<()> {
        Ok(())
    }

    fn pre_run(&mut self, ctx: &PartContext) -> HookResult<()> {
        Ok(())
    }

    fn run(&mut self, ctx: &PartContext) -> HookResult<()> {
        Ok(())
    }

    /// A run finished with more breakpoints to go; prepare for `window`.
    fn post_run_armed(
        &mut self,
        ctx: &PartContext,
        window: StepWindow,
        params: &ConfigureParams,
        part_info: &PartInfo,
    ) -> HookResult<()> {
        self.configure(ctx, window, params, part_info).map(drop)
    }

    fn post_run_ready(&mut self, ctx: &PartContext) -> HookResult<()> {
        Ok(())
    }

    /// Move to `window.completed_steps` after a pause or seek.
    fn seek(&mut self, ctx: &PartContext, window: StepWindow, params: &ConfigureParams, part_info: &PartInfo) -> HookResult<()> {
        self.configure(ctx, window, params, part_info).map(drop)
    }

    fn abort(&mut self, ctx: &PartContext) -> HookResult<()> {
        Ok(())
    }

    fn reset(&mut self, ctx: &PartContext) -> HookResult<()> {
        Ok(())
    }
}
