//! Scan controller: the state machine that drives parts through validate,
//! configure, run, pause and abort.
//!
//! Operations block the calling thread. The controller lock (`parts`) is held
//! for the whole of an operation; `abort` and `pause` may be called from
//! another thread while `run` holds it, and interrupt it through the shared
//! [`AbortToken`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel as xch;
use serde::{Deserialize, Serialize};

use crate::config::ControllerCfg;
use crate::context::{AbortToken, ControlOutcome, HookResult, PartContext, Progress};
use crate::error::{Report, Result, ScanError};
use crate::generator::CompoundGenerator;
use crate::hooks::{Info, Part, PartInfo, StepWindow};
use crate::params::{ConfigureContract, ConfigureParams};
use crate::status::{ScanState, ScanStatus};

/// Part-info key under which the controller publishes its own infos.
pub const CONTROLLER_INFO: &str = "controller";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// How a call to `run` or `resume` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// One breakpoint segment done; call `run` again for the next.
    Armed,
    Finished,
    Paused,
    Aborted,
}

/// Controller attributes that shape every scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Axes that may move in one scan; empty allows any.
    pub simultaneous_axes: Vec<String>,
    /// Shortest turnaround between rows, seconds.
    pub min_turnaround: f64,
    /// Shortest interval between trajectory samples, seconds.
    pub min_interval: f64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            simultaneous_axes: Vec::new(),
            min_turnaround: 0.0,
            min_interval: 0.002,
        }
    }
}

/// Split `generator` into the step counts of successive runs.
///
/// Without breakpoints each run covers the innermost dimensions that
/// `axes_to_move` spans. Breakpoints are repeated to cover the scan and must
/// divide it exactly.
pub fn steps_per_run(generator: &CompoundGenerator, axes_to_move: &[String], breakpoints: &[usize]) -> Result<Vec<usize>> {
    let size = generator.size();
    if size == 0 {
        return Ok(vec![0]);
    }
    let mut remaining: BTreeSet<&str> = axes_to_move.iter().map(String::as_str).collect();
    let mut steps = 1;
    for dim in generator.dimensions.iter().rev() {
        let axes = dim.axes();
        if !axes.is_empty() && remaining.is_empty() {
            break;
        }
        for axis in &axes {
            if !remaining.remove(axis.as_str()) {
                return Err(ScanError::Validation(format!(
                    "generator axis {axis} is not in axesToMove {axes_to_move:?}"
                ))
                .into());
            }
        }
        steps *= dim.size();
    }
    if breakpoints.is_empty() {
        return Ok(vec![steps; size / steps.max(1)]);
    }
    let total: usize = breakpoints.iter().sum();
    if breakpoints.contains(&0) || total == 0 || size % total != 0 {
        return Err(ScanError::Breakpoints {
            breakpoints: breakpoints.to_vec(),
            size,
        }
        .into());
    }
    Ok(breakpoints
        .iter()
        .copied()
        .cycle()
        .take(breakpoints.len() * (size / total))
        .collect())
}

fn outcome_report(outcome: ControlOutcome) -> Report {
    match outcome {
        ControlOutcome::Aborted => ScanError::State("operation aborted".into()).into(),
        ControlOutcome::Fault(r) => r,
    }
}

/// Call `f` on every part concurrently, forwarding progress to `on_progress`
/// on the calling thread until every part has returned.
fn broadcast_with_progress<T, F, P>(
    parts: &mut [Box<dyn Part>],
    token: &AbortToken,
    timeout: Duration,
    f: F,
    mut on_progress: P,
) -> HookResult<Vec<(String, T)>>
where
    T: Send,
    F: Fn(&mut dyn Part, &PartContext) -> HookResult<T> + Sync,
    P: FnMut(Progress),
{
    let results = std::thread::scope(|s| {
        let (tx, rx) = xch::unbounded();
        let f = &f;
        let handles: Vec<_> = parts
            .iter_mut()
            .map(|part| {
                let name = part.name().to_string();
                let ctx = PartContext::new(&name, token.clone(), timeout, Some(tx.clone()));
                (name, s.spawn(move || f(part.as_mut(), &ctx)))
            })
            .collect();
        drop(tx);
        for p in rx.iter() {
            on_progress(p);
        }
        handles.into_iter().map(|(name, h)| (name, h.join())).collect::<Vec<_>>()
    });

    let mut out = Vec::with_capacity(results.len());
    let mut aborted = false;
    let mut fault: Option<Report> = None;
    for (name, r) in results {
        match r {
            Ok(Ok(v)) => out.push((name, v)),
            Ok(Err(ControlOutcome::Aborted)) => aborted = true,
            Ok(Err(ControlOutcome::Fault(e))) => {
                if token.is_aborted() {
                    tracing::warn!(part = %name, error = %e, "part failed while aborting");
                } else if fault.is_none() {
                    fault = Some(e.wrap_err(format!("part {name}")));
                }
            }
            Err(_) => {
                if fault.is_none() {
                    fault = Some(ScanError::State(format!("part {name} panicked")).into());
                }
            }
        }
    }
    if token.is_aborted() {
        return Err(ControlOutcome::Aborted);
    }
    if let Some(e) = fault {
        return Err(ControlOutcome::Fault(e));
    }
    if aborted {
        return Err(ControlOutcome::Aborted);
    }
    Ok(out)
}

fn broadcast<T, F>(parts: &mut [Box<dyn Part>], token: &AbortToken, timeout: Duration, f: F) -> HookResult<Vec<(String, T)>>
where
    T: Send,
    F: Fn(&mut dyn Part, &PartContext) -> HookResult<T> + Sync,
{
    broadcast_with_progress(parts, token, timeout, f, |_| {})
}

#[derive(Debug, Clone)]
struct RunPlan {
    params: ConfigureParams,
    part_info: PartInfo,
    steps_per_run: Vec<usize>,
    segment: usize,
}

impl RunPlan {
    /// Segment containing `step` and the steps of it already done.
    fn locate(&self, step: usize) -> (usize, usize) {
        let mut start = 0;
        for (i, &n) in self.steps_per_run.iter().enumerate() {
            if step < start + n {
                return (i, step - start);
            }
            start += n;
        }
        let last = self.steps_per_run.len().saturating_sub(1);
        (last, self.steps_per_run.get(last).copied().unwrap_or(0))
    }
}

struct Shared {
    status: ScanStatus,
    busy: usize,
    token: AbortToken,
    subscribers: Vec<xch::Sender<ScanStatus>>,
    contract: ConfigureContract,
    settings: ScanSettings,
    datasets: Vec<Info>,
    plan: Option<RunPlan>,
}

struct Inner {
    mri: String,
    cfg: ControllerCfg,
    parts: Mutex<Vec<Box<dyn Part>>>,
    shared: Mutex<Shared>,
    changed: Condvar,
}

/// Marks an operation in flight; abort waits for every guard to drop.
struct BusyGuard<'a>(&'a Inner);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        lock(&self.0.shared).busy -= 1;
        self.0.changed.notify_all();
    }
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    fn begin(&self) -> (BusyGuard<'_>, AbortToken) {
        let mut s = self.shared();
        s.busy += 1;
        (BusyGuard(self), s.token.clone())
    }

    fn publish(s: &mut Shared) {
        let status = s.status.clone();
        s.subscribers.retain(|tx| tx.send(status.clone()).is_ok());
    }

    fn state(&self) -> ScanState {
        self.shared().status.state
    }

    /// Move to `to` if the current state allows it.
    fn transition(&self, to: ScanState) -> bool {
        let mut s = self.shared();
        let from = s.status.state;
        if !from.can_transition(to) {
            tracing::debug!(mri = %self.mri, %from, %to, "transition refused");
            return false;
        }
        s.status.state = to;
        Self::publish(&mut s);
        drop(s);
        self.changed.notify_all();
        tracing::info!(mri = %self.mri, %from, %to, "state");
        true
    }

    fn require(&self, to: ScanState, op: &str) -> Result<()> {
        if self.transition(to) {
            Ok(())
        } else {
            Err(ScanError::State(format!("cannot {op} while {}", self.state())).into())
        }
    }

    fn fault(&self, report: &Report) {
        let mut s = self.shared();
        s.status.state = ScanState::Fault;
        s.status.error = Some(format!("{report:#}"));
        Self::publish(&mut s);
        drop(s);
        self.changed.notify_all();
        tracing::error!(mri = %self.mri, error = %report, "fault");
    }

    /// Surface an operation failure: aborts are absorbed, faults are recorded.
    fn settle<T>(&self, r: HookResult<T>, aborted: T) -> Result<T> {
        match r {
            Ok(v) => Ok(v),
            Err(ControlOutcome::Aborted) => {
                tracing::info!(mri = %self.mri, state = %self.state(), "operation interrupted");
                Ok(aborted)
            }
            Err(ControlOutcome::Fault(e)) => {
                self.fault(&e);
                Err(e)
            }
        }
    }

    fn set_completed(&self, steps: usize, monotone: bool) {
        let mut s = self.shared();
        let steps = if monotone { steps.max(s.status.completed_steps) } else { steps };
        if steps != s.status.completed_steps {
            s.status.completed_steps = steps;
            Self::publish(&mut s);
        }
    }

    fn wait_quiescent(&self, timeout: Duration) -> bool {
        let s = self.shared();
        let (_s, res) = self
            .changed
            .wait_timeout_while(s, timeout, |s| s.busy > 0)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !res.timed_out()
    }

    fn fresh_token(&self) {
        self.shared().token = AbortToken::new();
    }

    fn timeout(&self) -> Duration {
        self.cfg.default_timeout
    }

    fn part_info(&self, parts: &mut [Box<dyn Part>], token: &AbortToken) -> HookResult<PartInfo> {
        let mut part_info: PartInfo = broadcast(parts, token, self.timeout(), |p, ctx| p.report_status(ctx))?
            .into_iter()
            .collect();
        let settings = self.shared().settings.clone();
        part_info.insert(
            CONTROLLER_INFO.to_string(),
            vec![Info::MinTurnaround {
                gap: settings.min_turnaround,
                interval: settings.min_interval,
            }],
        );
        Ok(part_info)
    }

    fn validate_locked(&self, parts: &mut [Box<dyn Part>], params: ConfigureParams, token: &AbortToken) -> HookResult<ConfigureParams> {
        let (contract, settings) = {
            let s = self.shared();
            (s.contract.clone(), s.settings.clone())
        };
        let mut params = params;
        contract.complete(&mut params)?;
        params.generator.prepare()?;
        if !settings.simultaneous_axes.is_empty()
            && let Some(axis) = params.axes_to_move.iter().find(|a| !settings.simultaneous_axes.contains(a))
        {
            return Err(ScanError::Validation(format!(
                "{axis} is not one of the simultaneous axes {:?}",
                settings.simultaneous_axes
            ))
            .into());
        }
        steps_per_run(&params.generator, &params.axes_to_move, &params.breakpoints)?;
        let part_info = self.part_info(parts, token)?;

        let mut last = Vec::new();
        for iteration in 0..self.cfg.tweak_iterations {
            let tweaks: Vec<_> = broadcast(parts, token, self.timeout(), |p, ctx| p.validate(ctx, &params, &part_info))?
                .into_iter()
                .flat_map(|(_, t)| t)
                .collect();
            if tweaks.is_empty() {
                tracing::debug!(mri = %self.mri, iteration, "validate converged");
                return Ok(params);
            }
            last.clear();
            for t in tweaks {
                tracing::debug!(mri = %self.mri, iteration, parameter = %t.parameter, value = %t.value, "tweak");
                params.set(&t.parameter, t.value)?;
                last.push(t.parameter);
            }
            params.generator.prepare()?;
        }
        Err(ScanError::TweakLoopExhausted {
            iterations: self.cfg.tweak_iterations,
            detail: format!("still tweaking {last:?}"),
        }
        .into())
    }

    fn configure_locked(&self, parts: &mut [Box<dyn Part>], params: ConfigureParams, token: &AbortToken) -> HookResult<()> {
        let params = self.validate_locked(parts, params, token)?;
        let runs = steps_per_run(&params.generator, &params.axes_to_move, &params.breakpoints)?;
        broadcast(parts, token, self.timeout(), |p, ctx| p.pre_configure(ctx))?;
        let part_info = self.part_info(parts, token)?;
        let window = StepWindow {
            completed_steps: 0,
            steps_to_do: runs[0],
            total_steps: params.generator.size(),
        };
        let infos = broadcast(parts, token, self.timeout(), |p, ctx| p.configure(ctx, window, &params, &part_info))?;
        broadcast(parts, token, self.timeout(), |p, ctx| p.post_configure(ctx, &part_info))?;

        let mut s = self.shared();
        s.datasets = infos
            .into_iter()
            .flat_map(|(_, i)| i)
            .filter(|i| matches!(i, Info::Dataset { .. }))
            .collect();
        s.status.completed_steps = 0;
        s.status.configured_steps = window.end();
        s.status.total_steps = window.total_steps;
        s.plan = Some(RunPlan {
            params,
            part_info,
            steps_per_run: runs,
            segment: 0,
        });
        Self::publish(&mut s);
        Ok(())
    }

    fn interrupted(&self) -> RunOutcome {
        match self.state() {
            ScanState::Seeking | ScanState::Paused => RunOutcome::Paused,
            _ => RunOutcome::Aborted,
        }
    }

    fn run_locked(&self, parts: &mut [Box<dyn Part>], token: &AbortToken) -> HookResult<RunOutcome> {
        let mut plan = self
            .shared()
            .plan
            .clone()
            .ok_or_else(|| ScanError::State("run before configure".into()))?;
        broadcast(parts, token, self.timeout(), |p, ctx| p.pre_run(ctx))?;
        let mut reported = BTreeMap::new();
        broadcast_with_progress(
            parts,
            token,
            self.timeout(),
            |p, ctx| p.run(ctx),
            |progress| {
                reported.insert(progress.part, progress.steps);
                if let Some(&min) = reported.values().min() {
                    self.set_completed(min, true);
                }
            },
        )?;

        let configured = self.shared().status.configured_steps;
        self.set_completed(configured, true);
        if !self.transition(ScanState::PostRun) {
            return Ok(self.interrupted());
        }
        if plan.segment + 1 < plan.steps_per_run.len() {
            plan.segment += 1;
            let window = StepWindow {
                completed_steps: configured,
                steps_to_do: plan.steps_per_run[plan.segment],
                total_steps: plan.params.generator.size(),
            };
            broadcast(parts, token, self.timeout(), |p, ctx| {
                p.post_run_armed(ctx, window, &plan.params, &plan.part_info)
            })?;
            {
                let mut s = self.shared();
                s.status.configured_steps = window.end();
                if let Some(stored) = &mut s.plan {
                    stored.segment = plan.segment;
                }
                Self::publish(&mut s);
            }
            return Ok(if self.transition(ScanState::Armed) { RunOutcome::Armed } else { self.interrupted() });
        }
        broadcast(parts, token, self.timeout(), |p, ctx| p.post_run_ready(ctx))?;
        Ok(if self.transition(ScanState::Finished) { RunOutcome::Finished } else { self.interrupted() })
    }

    fn seek_locked(&self, parts: &mut [Box<dyn Part>], last_good_step: usize, token: &AbortToken) -> HookResult<()> {
        let mut plan = self
            .shared()
            .plan
            .clone()
            .ok_or_else(|| ScanError::State("pause before configure".into()))?;
        let total = plan.params.generator.size();
        let step = last_good_step.min(total.saturating_sub(1));
        let (segment, in_run) = plan.locate(step);
        plan.segment = segment;
        let window = StepWindow {
            completed_steps: step,
            steps_to_do: plan.steps_per_run.get(segment).copied().unwrap_or(0).saturating_sub(in_run),
            total_steps: total,
        };
        tracing::info!(mri = %self.mri, step, segment, steps_to_do = window.steps_to_do, "seek");
        broadcast(parts, token, self.timeout(), |p, ctx| p.seek(ctx, window, &plan.params, &plan.part_info))?;
        self.set_completed(step, false);
        let mut s = self.shared();
        s.status.configured_steps = window.end();
        s.plan = Some(plan);
        Self::publish(&mut s);
        Ok(())
    }
}

/// Handle to a scan controller. Clones share the same controller.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("mri", &self.inner.mri)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(cfg: ControllerCfg, parts: Vec<Box<dyn Part>>) -> Self {
        let contract = ConfigureContract::aggregate(parts.iter().map(|p| p.configure_params()).collect::<Vec<_>>().iter());
        Self {
            inner: Arc::new(Inner {
                mri: cfg.mri.clone(),
                cfg,
                parts: Mutex::new(parts),
                shared: Mutex::new(Shared {
                    status: ScanStatus::default(),
                    busy: 0,
                    token: AbortToken::new(),
                    subscribers: Vec::new(),
                    contract,
                    settings: ScanSettings::default(),
                    datasets: Vec::new(),
                    plan: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn mri(&self) -> &str {
        &self.inner.mri
    }

    /// Register another part and rebuild the configure contract.
    pub fn add_part(&self, part: Box<dyn Part>) {
        let mut parts = lock(&self.inner.parts);
        parts.push(part);
        let infos: Vec<_> = parts.iter().map(|p| p.configure_params()).collect();
        self.inner.shared().contract = ConfigureContract::aggregate(&infos);
    }

    pub fn status(&self) -> ScanStatus {
        self.inner.shared().status.clone()
    }

    pub fn state(&self) -> ScanState {
        self.inner.state()
    }

    /// Receive a snapshot after every state or progress change.
    pub fn subscribe(&self) -> xch::Receiver<ScanStatus> {
        let (tx, rx) = xch::unbounded();
        let mut s = self.inner.shared();
        let _ = tx.send(s.status.clone());
        s.subscribers.push(tx);
        rx
    }

    pub fn contract(&self) -> ConfigureContract {
        self.inner.shared().contract.clone()
    }

    pub fn settings(&self) -> ScanSettings {
        self.inner.shared().settings.clone()
    }

    pub fn set_settings(&self, settings: ScanSettings) {
        self.inner.shared().settings = settings;
    }

    /// Dataset infos reported by the last configure.
    pub fn datasets(&self) -> Vec<Info> {
        self.inner.shared().datasets.clone()
    }

    /// Run the tweak loop and return the parameters every part accepts.
    pub fn validate(&self, params: ConfigureParams) -> Result<ConfigureParams> {
        let (_busy, token) = self.inner.begin();
        let mut parts = lock(&self.inner.parts);
        self.inner.validate_locked(&mut parts, params, &token).map_err(outcome_report)
    }

    pub fn configure(&self, params: ConfigureParams) -> Result<()> {
        let (_busy, token) = self.inner.begin();
        let mut parts = lock(&self.inner.parts);
        self.inner.require(ScanState::Configuring, "configure")?;
        let r = self.inner.configure_locked(&mut parts, params, &token);
        if self.inner.settle(r.map(|()| true), false)? {
            self.inner.transition(ScanState::Armed);
        }
        Ok(())
    }

    /// Run the configured segment. Blocks until it ends or is interrupted.
    pub fn run(&self) -> Result<RunOutcome> {
        if self.state() != ScanState::Armed {
            return Err(ScanError::State(format!("cannot run while {}", self.state())).into());
        }
        self.run_from_armed_or_paused()
    }

    /// Continue a paused scan.
    pub fn resume(&self) -> Result<RunOutcome> {
        if self.state() != ScanState::Paused {
            return Err(ScanError::State(format!("cannot resume while {}", self.state())).into());
        }
        self.run_from_armed_or_paused()
    }

    fn run_from_armed_or_paused(&self) -> Result<RunOutcome> {
        let (_busy, token) = self.inner.begin();
        let mut parts = lock(&self.inner.parts);
        self.inner.require(ScanState::Running, "run")?;
        let r = self.inner.run_locked(&mut parts, &token);
        let aborted = self.inner.interrupted();
        self.inner.settle(r, aborted)
    }

    /// Go back to `last_good_step`. A running scan ends up paused, an armed or
    /// finished one armed.
    pub fn pause(&self, last_good_step: usize) -> Result<()> {
        let from = self.state();
        if !matches!(
            from,
            ScanState::Running | ScanState::Armed | ScanState::Finished | ScanState::Paused
        ) {
            return Err(ScanError::State(format!("cannot pause while {from}")).into());
        }
        self.inner.require(ScanState::Seeking, "pause")?;
        if from == ScanState::Running {
            self.inner.shared().token.abort();
            if !self.inner.wait_quiescent(self.inner.timeout()) {
                let e: Report = ScanError::Timeout("run to stop for pause".into()).into();
                self.inner.fault(&e);
                return Err(e);
            }
            self.inner.fresh_token();
        }
        let (_busy, token) = self.inner.begin();
        let mut parts = lock(&self.inner.parts);
        let r = self.inner.seek_locked(&mut parts, last_good_step, &token);
        if self.inner.settle(r.map(|()| true), false)? {
            let to = if matches!(from, ScanState::Running | ScanState::Paused) {
                ScanState::Paused
            } else {
                ScanState::Armed
            };
            self.inner.transition(to);
        }
        Ok(())
    }

    /// Stop whatever is in progress and run every part's abort hook.
    pub fn abort(&self) -> Result<()> {
        {
            let s = self.inner.shared();
            if !s.status.state.abortable() {
                return Err(ScanError::State(format!("cannot abort while {}", s.status.state)).into());
            }
            s.token.abort();
        }
        self.inner.require(ScanState::Aborting, "abort")?;
        if !self.inner.wait_quiescent(self.inner.timeout()) {
            let e: Report = ScanError::Timeout("parts to stop after abort".into()).into();
            self.inner.fault(&e);
            return Err(e);
        }
        self.inner.fresh_token();
        let (_busy, token) = self.inner.begin();
        let mut parts = lock(&self.inner.parts);
        let r = broadcast(&mut parts, &token, self.inner.timeout(), |p, ctx| p.abort(ctx));
        if self.inner.settle(r.map(|_| true), false)? {
            self.inner.transition(ScanState::Aborted);
        }
        Ok(())
    }

    /// Clear a fault or finished scan and return to READY.
    pub fn reset(&self) -> Result<()> {
        self.inner.require(ScanState::Resetting, "reset")?;
        self.inner.fresh_token();
        let (_busy, token) = self.inner.begin();
        let mut parts = lock(&self.inner.parts);
        let r = broadcast(&mut parts, &token, self.inner.timeout(), |p, ctx| p.reset(ctx));
        if self.inner.settle(r.map(|_| true), false)? {
            {
                let mut s = self.inner.shared();
                s.plan = None;
                s.datasets.clear();
                s.status = ScanStatus::default();
                s.status.state = ScanState::Resetting;
            }
            self.inner.transition(ScanState::Ready);
        }
        Ok(())
    }

    /// Stop everything and refuse further operations until reset.
    pub fn disable(&self) -> Result<()> {
        self.inner.shared().token.abort();
        self.inner.require(ScanState::Disabling, "disable")?;
        if !self.inner.wait_quiescent(self.inner.timeout()) {
            let e: Report = ScanError::Timeout("parts to stop after disable".into()).into();
            self.inner.fault(&e);
            return Err(e);
        }
        self.inner.fresh_token();
        self.inner.transition(ScanState::Disabled);
        Ok(())
    }
}
