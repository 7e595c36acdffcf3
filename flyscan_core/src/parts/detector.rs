//! Part arming a hardware-triggered detector for each configured window.

use flyscan_traits::{Completion, Detector};
use serde_json::{Value, json};

use crate::context::{HookResult, PartContext};
use crate::error::ScanError;
use crate::exposure::{ExposureDeadtime, ExposureTweak};
use crate::hooks::{DatasetKind, Info, Part, PartInfo, StepWindow};
use crate::hw_error::hw_report;
use crate::params::{ConfigureParams, ConfigureParamsInfo, GENERATOR, ParamKind, ParamSchema, ParameterTweakInfo};

/// Table parameter shared by every detector part, one row per detector.
pub const DETECTORS: &str = "detectors";

pub struct DetectorPart {
    name: String,
    det: Box<dyn Detector>,
    armed: Option<Completion>,
}

impl DetectorPart {
    pub fn new(name: &str, det: Box<dyn Detector>) -> Self {
        Self {
            name: name.to_string(),
            det,
            armed: None,
        }
    }

    fn deadtime(&self) -> ExposureDeadtime {
        ExposureDeadtime::new(self.det.readout_time(), self.det.frequency_accuracy_ppm(), self.det.min_exposure())
    }

    fn row<'a>(&self, params: &'a ConfigureParams) -> Option<&'a Value> {
        params
            .extra
            .get(DETECTORS)?
            .as_array()?
            .iter()
            .find(|r| r.get("name").and_then(Value::as_str) == Some(self.name.as_str()))
    }

    /// Whether the detector takes part, and the requested exposure.
    fn settings(&self, params: &ConfigureParams) -> (bool, f64) {
        let row = self.row(params);
        let enable = row.and_then(|r| r.get("enable")).and_then(Value::as_bool).unwrap_or(true);
        let exposure = row.and_then(|r| r.get("exposure")).and_then(Value::as_f64).unwrap_or(0.0);
        (enable, exposure)
    }

    fn with_exposure(&self, params: &ConfigureParams, exposure: f64) -> Value {
        let mut rows = params
            .extra
            .get(DETECTORS)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        match rows
            .iter_mut()
            .find(|r| r.get("name").and_then(Value::as_str) == Some(self.name.as_str()))
        {
            Some(Value::Object(row)) => {
                row.insert("exposure".into(), json!(exposure));
            }
            _ => rows.push(json!({ "name": self.name, "enable": true, "exposure": exposure })),
        }
        Value::Array(rows)
    }
}

impl Part for DetectorPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn report_status(&mut self, _ctx: &PartContext) -> HookResult<Vec<Info>> {
        Ok(vec![Info::DetectorTrigger])
    }

    fn configure_params(&self) -> ConfigureParamsInfo {
        ConfigureParamsInfo::default().param(
            DETECTORS,
            ParamSchema::new(
                ParamKind::Table {
                    primary_keys: vec!["name".into()],
                },
                "Detectors to use and their exposures",
            ),
            Some(json!([{ "name": self.name, "enable": true, "exposure": 0.0 }])),
        )
    }

    fn validate(&mut self, _ctx: &PartContext, params: &ConfigureParams, _part_info: &PartInfo) -> HookResult<Vec<ParameterTweakInfo>> {
        let (enable, exposure) = self.settings(params);
        if !enable {
            return Ok(Vec::new());
        }
        let tweak = match self.deadtime().negotiate(params.generator.duration, exposure)? {
            None => return Ok(Vec::new()),
            Some(ExposureTweak::Duration(d)) => {
                tracing::debug!(part = %self.name, duration = d, "fixing point duration");
                ParameterTweakInfo::new(GENERATOR, params.generator.with_duration(d).to_value())
            }
            Some(ExposureTweak::Exposure(e)) => {
                tracing::debug!(part = %self.name, requested = exposure, exposure = e, "adjusting exposure");
                ParameterTweakInfo::new(DETECTORS, self.with_exposure(params, e))
            }
        };
        Ok(vec![tweak])
    }

    fn configure(&mut self, _ctx: &PartContext, window: StepWindow, params: &ConfigureParams, _part_info: &PartInfo) -> HookResult<Vec<Info>> {
        self.armed = None;
        let (enable, exposure) = self.settings(params);
        if !enable {
            return Ok(Vec::new());
        }
        let exposure = if exposure > 0.0 {
            exposure
        } else {
            self.deadtime().max_exposure(params.generator.duration)
        };
        self.det.set_exposure(exposure).map_err(hw_report)?;
        self.armed = Some(self.det.arm(window.steps_to_do).map_err(hw_report)?);
        tracing::info!(part = %self.name, exposure, frames = window.steps_to_do, "detector armed");
        Ok(vec![Info::Dataset {
            name: format!("{}.data", self.name),
            kind: DatasetKind::Primary,
            rank: params.generator.dimensions.len() + 2,
        }])
    }

    fn run(&mut self, ctx: &PartContext) -> HookResult<()> {
        let Some(armed) = self.armed.take() else {
            return Ok(());
        };
        ctx.wait_completion(&armed, None, "detector acquisition")
    }

    fn seek(&mut self, ctx: &PartContext, window: StepWindow, params: &ConfigureParams, part_info: &PartInfo) -> HookResult<()> {
        self.det.stop().map_err(hw_report)?;
        self.configure(ctx, window, params, part_info).map(drop)
    }

    fn abort(&mut self, _ctx: &PartContext) -> HookResult<()> {
        self.armed = None;
        self.det.stop().map_err(|e| ScanError::Hardware(format!("{}: stop failed: {e}", self.name)))?;
        Ok(())
    }

    fn reset(&mut self, ctx: &PartContext) -> HookResult<()> {
        self.abort(ctx)
    }
}
