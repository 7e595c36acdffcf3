//! Recording mocks of the collaborator traits.
//!
//! Every mock is a cheap `Clone` handle over shared state so a test can keep
//! one handle for assertions while the part under test owns another.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel as xch;
use flyscan_traits::{
    Completion, Detector, Gate, HwResult, LayoutRow, MotionController, MotorRecord, ProfileEvent,
    ProfileWrite, Receiver, SeqTable, Sequencer, VelocityMode,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn done() -> Completion {
    let (tx, rx) = xch::bounded(1);
    let _ = tx.send(Ok(()));
    rx
}

// ── Motion controller ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PmacCall {
    WriteProfile {
        cs_port: Option<String>,
        profile: ProfileWrite,
    },
    ExecuteProfile,
    AbortProfile,
    MoveCs {
        cs_port: String,
        demands: BTreeMap<char, f64>,
        move_time: f64,
    },
}

#[derive(Debug)]
struct PmacState {
    i10: u32,
    layout: Vec<LayoutRow>,
    motors: BTreeMap<String, MotorRecord>,
    calls: Vec<PmacCall>,
    loaded: usize,
    last_mode: Option<VelocityMode>,
    executing: bool,
    events: Option<xch::Sender<ProfileEvent>>,
    auto_complete: bool,
    fail_writes: Option<String>,
}

/// Motion controller that records calls. With `auto_complete` (the default)
/// an executing profile reports every loaded point as scanned straight away
/// and finishes once a chunk ending in a zero-velocity sample is loaded.
#[derive(Debug, Clone)]
pub struct MockMotionController {
    state: Arc<Mutex<PmacState>>,
}

impl Default for MockMotionController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMotionController {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PmacState {
                i10: 1_705_244,
                layout: Vec::new(),
                motors: BTreeMap::new(),
                calls: Vec::new(),
                loaded: 0,
                last_mode: None,
                executing: false,
                events: None,
                auto_complete: true,
                fail_writes: None,
            })),
        }
    }

    #[must_use]
    pub fn with_motor(self, name: &str, mri: &str, rec: MotorRecord) -> Self {
        {
            let mut s = lock(&self.state);
            s.layout.push(LayoutRow {
                name: name.to_string(),
                mri: mri.to_string(),
            });
            s.motors.insert(mri.to_string(), rec);
        }
        self
    }

    #[must_use]
    pub fn with_i10(self, i10: u32) -> Self {
        lock(&self.state).i10 = i10;
        self
    }

    /// Leave progress to the test (`emit`) instead of completing at once.
    #[must_use]
    pub fn manual(self) -> Self {
        lock(&self.state).auto_complete = false;
        self
    }

    pub fn fail_writes(&self, msg: &str) {
        lock(&self.state).fail_writes = Some(msg.to_string());
    }

    /// Push a progress event to the running profile, if any.
    pub fn emit(&self, ev: ProfileEvent) -> bool {
        lock(&self.state).events.as_ref().is_some_and(|tx| tx.send(ev).is_ok())
    }

    pub fn calls(&self) -> Vec<PmacCall> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    /// Every profile write since (and including) the last fresh one, merged.
    pub fn current_profile(&self) -> ProfileWrite {
        let calls = self.calls();
        let start = calls
            .iter()
            .rposition(|c| matches!(c, PmacCall::WriteProfile { cs_port: Some(_), .. }))
            .unwrap_or(0);
        let mut merged = ProfileWrite::default();
        for c in &calls[start..] {
            if let PmacCall::WriteProfile { profile, .. } = c {
                merged.time_array.extend(&profile.time_array);
                merged.velocity_mode.extend(&profile.velocity_mode);
                merged.user_programs.extend(&profile.user_programs);
                for (k, v) in &profile.positions {
                    merged.positions.entry(*k).or_default().extend(v);
                }
            }
        }
        merged
    }

    pub fn count(&self, pred: impl Fn(&PmacCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| pred(c)).count()
    }

    fn progress(s: &mut PmacState) {
        if !(s.auto_complete && s.executing) {
            return;
        }
        if let Some(tx) = &s.events {
            let _ = tx.send(ProfileEvent::PointsScanned(s.loaded));
            if s.last_mode == Some(VelocityMode::ZeroVelocity) {
                let _ = tx.send(ProfileEvent::Finished);
                s.executing = false;
            }
        }
    }
}

impl MotionController for MockMotionController {
    fn i10(&self) -> HwResult<u32> {
        Ok(lock(&self.state).i10)
    }

    fn layout(&self) -> HwResult<Vec<LayoutRow>> {
        Ok(lock(&self.state).layout.clone())
    }

    fn motor(&self, mri: &str) -> HwResult<MotorRecord> {
        lock(&self.state)
            .motors
            .get(mri)
            .cloned()
            .ok_or_else(|| format!("no motor {mri}").into())
    }

    fn write_profile(&mut self, cs_port: Option<&str>, profile: &ProfileWrite) -> HwResult<()> {
        let mut s = lock(&self.state);
        if let Some(msg) = &s.fail_writes {
            return Err(msg.clone().into());
        }
        s.calls.push(PmacCall::WriteProfile {
            cs_port: cs_port.map(str::to_string),
            profile: profile.clone(),
        });
        if cs_port.is_some() {
            s.loaded = 0;
            s.executing = false;
        }
        s.loaded += profile.len();
        s.last_mode = profile.velocity_mode.last().copied();
        Self::progress(&mut s);
        Ok(())
    }

    fn execute_profile(&mut self) -> HwResult<Receiver<ProfileEvent>> {
        let mut s = lock(&self.state);
        s.calls.push(PmacCall::ExecuteProfile);
        let (tx, rx) = xch::unbounded();
        s.events = Some(tx);
        s.executing = true;
        Self::progress(&mut s);
        Ok(rx)
    }

    fn abort_profile(&mut self) -> HwResult<()> {
        let mut s = lock(&self.state);
        s.calls.push(PmacCall::AbortProfile);
        s.executing = false;
        if let Some(tx) = s.events.take() {
            let _ = tx.send(ProfileEvent::Failed("aborted".to_string()));
        }
        Ok(())
    }

    fn move_cs(&mut self, cs_port: &str, demands: &BTreeMap<char, f64>, move_time: f64) -> HwResult<Completion> {
        lock(&self.state).calls.push(PmacCall::MoveCs {
            cs_port: cs_port.to_string(),
            demands: demands.clone(),
            move_time,
        });
        Ok(done())
    }
}

// ── Sequencer ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SeqState {
    tables: Vec<SeqTable>,
    repeats: Option<u32>,
    active: bool,
    subscribers: Vec<xch::Sender<bool>>,
    unsubscribed: usize,
}

/// Sequencer table whose `active` flag is driven by the test.
#[derive(Debug, Clone, Default)]
pub struct MockSequencer {
    state: Arc<Mutex<SeqState>>,
}

impl MockSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every table written, oldest first.
    pub fn tables(&self) -> Vec<SeqTable> {
        lock(&self.state).tables.clone()
    }

    pub fn repeats(&self) -> Option<u32> {
        lock(&self.state).repeats
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    pub fn unsubscribe_count(&self) -> usize {
        lock(&self.state).unsubscribed
    }

    pub fn set_active(&self, active: bool) {
        let mut s = lock(&self.state);
        s.active = active;
        s.subscribers.retain(|tx| tx.send(active).is_ok());
    }
}

impl Sequencer for MockSequencer {
    fn write_table(&mut self, table: &SeqTable) -> HwResult<()> {
        lock(&self.state).tables.push(table.clone());
        Ok(())
    }

    fn set_repeats(&mut self, repeats: u32) -> HwResult<()> {
        lock(&self.state).repeats = Some(repeats);
        Ok(())
    }

    fn subscribe_active(&mut self) -> HwResult<Receiver<bool>> {
        let mut s = lock(&self.state);
        let (tx, rx) = xch::unbounded();
        let _ = tx.send(s.active);
        s.subscribers.push(tx);
        Ok(rx)
    }

    fn unsubscribe_all(&mut self) {
        let mut s = lock(&self.state);
        s.subscribers.clear();
        s.unsubscribed += 1;
    }
}

// ── Gate ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MockGate {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl MockGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }
}

impl Gate for MockGate {
    fn force_set(&mut self) -> HwResult<()> {
        lock(&self.calls).push("force_set");
        Ok(())
    }

    fn force_reset(&mut self) -> HwResult<()> {
        lock(&self.calls).push("force_reset");
        Ok(())
    }
}

// ── Detector ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct DetState {
    exposures: Vec<f64>,
    armed: Vec<usize>,
    stops: usize,
}

#[derive(Debug, Clone)]
pub struct MockDetector {
    pub readout_time: f64,
    pub frequency_accuracy_ppm: f64,
    pub min_exposure: f64,
    state: Arc<Mutex<DetState>>,
}

impl MockDetector {
    pub fn new(readout_time: f64, frequency_accuracy_ppm: f64) -> Self {
        Self {
            readout_time,
            frequency_accuracy_ppm,
            min_exposure: 0.0,
            state: Arc::default(),
        }
    }

    pub fn exposures(&self) -> Vec<f64> {
        lock(&self.state).exposures.clone()
    }

    pub fn armed(&self) -> Vec<usize> {
        lock(&self.state).armed.clone()
    }

    pub fn stops(&self) -> usize {
        lock(&self.state).stops
    }
}

impl Detector for MockDetector {
    fn readout_time(&self) -> f64 {
        self.readout_time
    }

    fn frequency_accuracy_ppm(&self) -> f64 {
        self.frequency_accuracy_ppm
    }

    fn min_exposure(&self) -> f64 {
        self.min_exposure
    }

    fn set_exposure(&mut self, exposure: f64) -> HwResult<()> {
        lock(&self.state).exposures.push(exposure);
        Ok(())
    }

    fn arm(&mut self, frames: usize) -> HwResult<Completion> {
        lock(&self.state).armed.push(frames);
        Ok(done())
    }

    fn stop(&mut self) -> HwResult<()> {
        lock(&self.state).stops += 1;
        Ok(())
    }
}
