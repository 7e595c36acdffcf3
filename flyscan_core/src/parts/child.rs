//! Part that drives a child scan controller as one of its parent's parts.

use crossbeam_channel as xch;

use crate::context::{ControlOutcome, HookResult, PartContext};
use crate::controller::{Controller, RunOutcome};
use crate::error::ScanError;
use crate::hooks::{Info, Part, PartInfo, StepWindow};
use crate::params::{AXES_TO_MOVE, BREAKPOINTS, ConfigureParams, ConfigureParamsInfo, GENERATOR, ParameterTweakInfo};
use crate::status::ScanState;

pub struct RunnableChildPart {
    name: String,
    child: Controller,
}

impl RunnableChildPart {
    pub fn new(name: &str, child: Controller) -> Self {
        Self {
            name: name.to_string(),
            child,
        }
    }

    /// The parent's parameters narrowed to what the child accepts.
    fn child_params(&self, params: &ConfigureParams) -> ConfigureParams {
        ConfigureParams {
            generator: params.generator.clone(),
            axes_to_move: params.axes_to_move.clone(),
            breakpoints: params.breakpoints.clone(),
            extra: self.child.contract().filter(&params.extra),
        }
    }

    /// Turn a child that stopped short into the matching hook outcome.
    fn check_child(&self) -> HookResult<()> {
        let status = self.child.status();
        match status.state {
            ScanState::Aborted | ScanState::Aborting => Err(ControlOutcome::Aborted),
            ScanState::Fault => Err(ScanError::State(format!(
                "child {} faulted: {}",
                self.child.mri(),
                status.error.unwrap_or_default()
            ))
            .into()),
            _ => Ok(()),
        }
    }
}

impl Part for RunnableChildPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure_params(&self) -> ConfigureParamsInfo {
        let contract = self.child.contract();
        let builtin = |name: &str| [GENERATOR, AXES_TO_MOVE, BREAKPOINTS].contains(&name);
        let mut info = ConfigureParamsInfo::default();
        for (name, schema) in contract.params.into_iter().filter(|(n, _)| !builtin(n.as_str())) {
            let default = contract.defaults.get(&name).cloned();
            if default.is_some() || contract.required.contains(&name) {
                info = info.param(&name, schema, default);
            }
        }
        info
    }

    fn validate(&mut self, _ctx: &PartContext, params: &ConfigureParams, _part_info: &PartInfo) -> HookResult<Vec<ParameterTweakInfo>> {
        let asked = self.child_params(params);
        let accepted = self.child.validate(asked.clone())?;
        let mut tweaks = Vec::new();
        if accepted.generator != asked.generator {
            tweaks.push(ParameterTweakInfo::new(GENERATOR, accepted.generator.to_value()));
        }
        for (name, value) in &accepted.extra {
            if params.extra.get(name) != Some(value) {
                tweaks.push(ParameterTweakInfo::new(name, value.clone()));
            }
        }
        if !tweaks.is_empty() {
            tracing::debug!(part = %self.name, child = %self.child.mri(), tweaks = tweaks.len(), "child tweaked parameters");
        }
        Ok(tweaks)
    }

    fn configure(&mut self, _ctx: &PartContext, window: StepWindow, params: &ConfigureParams, _part_info: &PartInfo) -> HookResult<Vec<Info>> {
        let state = self.child.state();
        if state != ScanState::Ready && state.resettable() {
            self.child.reset()?;
        }
        self.child.configure(self.child_params(params))?;
        self.check_child()?;
        if window.completed_steps > 0 {
            self.child.pause(window.completed_steps)?;
            self.check_child()?;
        }
        Ok(self.child.datasets())
    }

    fn run(&mut self, ctx: &PartContext) -> HookResult<()> {
        let child = &self.child;
        let paused = child.state() == ScanState::Paused;
        let statuses = child.subscribe();
        let outcome = std::thread::scope(|s| {
            let (done_tx, done_rx) = xch::bounded(1);
            s.spawn(move || {
                let r = if paused { child.resume() } else { child.run() };
                let _ = done_tx.send(r);
            });
            let signal = ctx.abort_token().signal();
            loop {
                xch::select! {
                    recv(statuses) -> st => if let Ok(st) = st {
                        ctx.report_progress(st.completed_steps);
                    },
                    recv(done_rx) -> r => {
                        return r.map_err(|_| ControlOutcome::from(ScanError::State("child run thread vanished".into())));
                    },
                    recv(signal) -> _ => {
                        tracing::info!(part = %self.name, child = %child.mri(), "aborting child");
                        if let Err(e) = child.abort() {
                            tracing::warn!(part = %self.name, error = %e, "child abort failed");
                        }
                        let _ = done_rx.recv();
                        return Err(ControlOutcome::Aborted);
                    },
                }
            }
        })?;
        match outcome? {
            RunOutcome::Armed | RunOutcome::Finished => Ok(()),
            RunOutcome::Aborted => Err(ControlOutcome::Aborted),
            RunOutcome::Paused => Err(ScanError::State(format!("child {} paused itself", child.mri())).into()),
        }
    }

    /// The child re-arms itself for its next segment at the end of a run.
    fn post_run_armed(&mut self, _ctx: &PartContext, _window: StepWindow, _params: &ConfigureParams, _part_info: &PartInfo) -> HookResult<()> {
        Ok(())
    }

    fn seek(&mut self, _ctx: &PartContext, window: StepWindow, _params: &ConfigureParams, _part_info: &PartInfo) -> HookResult<()> {
        self.child.pause(window.completed_steps)?;
        self.check_child()
    }

    fn abort(&mut self, _ctx: &PartContext) -> HookResult<()> {
        if self.child.state().abortable() {
            self.child.abort()?;
        }
        Ok(())
    }

    fn reset(&mut self, _ctx: &PartContext) -> HookResult<()> {
        if self.child.state().resettable() {
            self.child.reset()?;
        }
        Ok(())
    }
}
