//! Simulated motion controller executing profiles on a thread in scaled time.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel as xch;
use flyscan_traits::{
    Clock, Completion, HwResult, LayoutRow, MotionController, MotorRecord, ProfileEvent, ProfileWrite, Receiver,
    VelocityMode,
};

use crate::error::HwError;
use crate::util::{scaled, wait_while_with_timeout};

/// How long an executing profile waits for more samples before failing.
const UNDERRUN_TIMEOUT: Duration = Duration::from_secs(2);
const PROFILE_TICK_S: f64 = 1e-6;

#[derive(Debug, Clone)]
struct Sample {
    ticks: u32,
    mode: VelocityMode,
    positions: BTreeMap<char, f64>,
}

#[derive(Debug, Default)]
struct State {
    i10: u32,
    layout: Vec<LayoutRow>,
    motors: BTreeMap<String, MotorRecord>,
    cs_port: Option<String>,
    samples: Vec<Sample>,
    /// Bumped by every fresh profile and abort; stale executors stop.
    generation: u64,
    running: bool,
}

impl State {
    fn cs_of(rec: &MotorRecord) -> Option<(&str, char)> {
        let (port, axis) = rec.cs.split_once(',')?;
        Some((port.trim(), axis.trim().chars().next()?.to_ascii_uppercase()))
    }

    fn has_port(&self, cs_port: &str) -> bool {
        self.motors.values().any(|m| Self::cs_of(m).is_some_and(|(p, _)| p == cs_port))
    }

    fn set_positions(&mut self, cs_port: &str, positions: &BTreeMap<char, f64>) {
        for rec in self.motors.values_mut() {
            if let Some((port, letter)) = Self::cs_of(rec)
                && port == cs_port
                && let Some(p) = positions.get(&letter)
            {
                rec.readback = *p;
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    more: Condvar,
    clock: Arc<dyn Clock + Send + Sync>,
    time_scale: f64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Motion controller simulator. Clones share one controller.
#[derive(Clone)]
pub struct SimMotionController {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SimMotionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.shared.lock();
        f.debug_struct("SimMotionController")
            .field("motors", &s.layout.len())
            .field("samples", &s.samples.len())
            .field("running", &s.running)
            .finish_non_exhaustive()
    }
}

impl SimMotionController {
    pub fn new(clock: Arc<dyn Clock + Send + Sync>, time_scale: f64) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    i10: 1_705_244,
                    ..State::default()
                }),
                more: Condvar::new(),
                clock,
                time_scale,
            }),
        }
    }

    #[must_use]
    pub fn with_i10(self, i10: u32) -> Self {
        self.shared.lock().i10 = i10;
        self
    }

    #[must_use]
    pub fn with_motor(self, name: &str, mri: &str, rec: MotorRecord) -> Self {
        {
            let mut s = self.shared.lock();
            s.layout.push(LayoutRow {
                name: name.to_string(),
                mri: mri.to_string(),
            });
            s.motors.insert(mri.to_string(), rec);
        }
        self
    }

    /// Current position of the motor named `name` in the layout.
    pub fn readback(&self, name: &str) -> Option<f64> {
        let s = self.shared.lock();
        let row = s.layout.iter().find(|r| r.name == name)?;
        s.motors.get(&row.mri).map(|m| m.readback)
    }

    pub fn samples_loaded(&self) -> usize {
        self.shared.lock().samples.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    fn execute(shared: &Shared, generation: u64, events: &xch::Sender<ProfileEvent>) {
        let mut scanned = 0;
        loop {
            let guard = shared.lock();
            let guard = match wait_while_with_timeout(
                &shared.more,
                guard,
                |s| s.generation != generation || s.samples.len() > scanned,
                UNDERRUN_TIMEOUT,
                "profile samples",
            ) {
                Ok(g) => g,
                Err(e) => {
                    shared.lock().running = false;
                    tracing::warn!(scanned, error = %e, "profile underrun");
                    let _ = events.send(ProfileEvent::Failed(format!("underrun after {scanned} samples")));
                    return;
                }
            };
            if guard.generation != generation {
                let _ = events.send(ProfileEvent::Failed("profile aborted".to_string()));
                return;
            }
            let sample = guard.samples[scanned].clone();
            drop(guard);

            shared
                .clock
                .sleep(scaled(f64::from(sample.ticks) * PROFILE_TICK_S, shared.time_scale));

            let mut s = shared.lock();
            if s.generation != generation {
                let _ = events.send(ProfileEvent::Failed("profile aborted".to_string()));
                return;
            }
            if let Some(cs) = s.cs_port.clone() {
                s.set_positions(&cs, &sample.positions);
            }
            scanned += 1;
            let done = sample.mode == VelocityMode::ZeroVelocity && scanned == s.samples.len();
            if done {
                s.running = false;
            }
            drop(s);
            let _ = events.send(ProfileEvent::PointsScanned(scanned));
            tracing::trace!(scanned, "profile sample executed");
            if done {
                let _ = events.send(ProfileEvent::Finished);
                return;
            }
        }
    }
}

impl MotionController for SimMotionController {
    fn i10(&self) -> HwResult<u32> {
        Ok(self.shared.lock().i10)
    }

    fn layout(&self) -> HwResult<Vec<LayoutRow>> {
        Ok(self.shared.lock().layout.clone())
    }

    fn motor(&self, mri: &str) -> HwResult<MotorRecord> {
        self.shared
            .lock()
            .motors
            .get(mri)
            .cloned()
            .ok_or_else(|| HwError::Rejected(format!("no motor record {mri}")).into())
    }

    fn write_profile(&mut self, cs_port: Option<&str>, profile: &ProfileWrite) -> HwResult<()> {
        let n = profile.len();
        if profile.velocity_mode.len() != n
            || profile.user_programs.len() != n
            || profile.positions.values().any(|v| v.len() != n)
        {
            return Err(HwError::Rejected("profile arrays differ in length".into()).into());
        }
        let mut s = self.shared.lock();
        match cs_port {
            Some(cs) => {
                if s.running {
                    return Err(HwError::Rejected("cannot start a new profile while one runs".into()).into());
                }
                if !s.has_port(cs) {
                    return Err(HwError::Rejected(format!("no motors in coordinate system {cs}")).into());
                }
                s.cs_port = Some(cs.to_string());
                s.samples.clear();
                s.generation += 1;
            }
            None if s.cs_port.is_none() => {
                return Err(HwError::Rejected("append before any profile was started".into()).into());
            }
            None => {}
        }
        for i in 0..n {
            s.samples.push(Sample {
                ticks: profile.time_array[i],
                mode: profile.velocity_mode[i],
                positions: profile.positions.iter().map(|(k, v)| (*k, v[i])).collect(),
            });
        }
        tracing::debug!(samples = n, total = s.samples.len(), "profile written");
        drop(s);
        self.shared.more.notify_all();
        Ok(())
    }

    fn execute_profile(&mut self) -> HwResult<Receiver<ProfileEvent>> {
        let generation = {
            let mut s = self.shared.lock();
            if s.samples.is_empty() || s.cs_port.is_none() {
                return Err(HwError::NotArmed.into());
            }
            if s.running {
                return Err(HwError::Rejected("profile already running".into()).into());
            }
            s.running = true;
            s.generation
        };
        let (tx, rx) = xch::unbounded();
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("sim-profile".into())
            .spawn(move || Self::execute(&shared, generation, &tx))
            .map_err(HwError::from)?;
        Ok(rx)
    }

    fn abort_profile(&mut self) -> HwResult<()> {
        {
            let mut s = self.shared.lock();
            s.generation += 1;
            s.running = false;
        }
        self.shared.more.notify_all();
        tracing::info!("profile aborted");
        Ok(())
    }

    fn move_cs(&mut self, cs_port: &str, demands: &BTreeMap<char, f64>, move_time: f64) -> HwResult<Completion> {
        {
            let s = self.shared.lock();
            for (letter, demand) in demands {
                let Some(rec) = s
                    .motors
                    .values()
                    .find(|m| State::cs_of(m) == Some((cs_port, *letter)))
                else {
                    return Err(HwError::Rejected(format!("no axis {letter} in {cs_port}")).into());
                };
                let limited = rec.user_low_limit != 0.0 || rec.user_high_limit != 0.0;
                if limited && !(rec.user_low_limit..=rec.user_high_limit).contains(demand) {
                    return Err(HwError::Rejected(format!("{cs_port},{letter} demand {demand} outside soft limits")).into());
                }
            }
        }
        let (tx, rx) = xch::bounded(1);
        let shared = Arc::clone(&self.shared);
        let cs = cs_port.to_string();
        let demands = demands.clone();
        std::thread::Builder::new()
            .name("sim-move".into())
            .spawn(move || {
                shared.clock.sleep(scaled(move_time, shared.time_scale));
                shared.lock().set_positions(&cs, &demands);
                let _ = tx.send(Ok(()));
            })
            .map_err(HwError::from)?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flyscan_traits::UserProgram;
    use flyscan_traits::clock::test_clock::TestClock;

    fn sim() -> SimMotionController {
        let rec = |cs: &str| MotorRecord {
            cs: cs.to_string(),
            ..MotorRecord::default()
        };
        SimMotionController::new(Arc::new(TestClock::new()), 1.0)
            .with_motor("x", "BL:X", rec("CS1,A"))
            .with_motor("y", "BL:Y", rec("CS1,B"))
    }

    fn chunk(xs: &[f64], last: VelocityMode) -> ProfileWrite {
        let n = xs.len();
        let mut modes = vec![VelocityMode::AveragePrevToNext; n];
        modes[n - 1] = last;
        ProfileWrite {
            time_array: vec![1000; n],
            velocity_mode: modes,
            user_programs: vec![UserProgram::Live; n],
            positions: BTreeMap::from([('A', xs.to_vec())]),
        }
    }

    #[test]
    fn executes_appended_chunks_to_the_end() {
        let mut p = sim();
        p.write_profile(Some("CS1"), &chunk(&[0.0, 0.1], VelocityMode::AveragePrevToNext))
            .unwrap();
        let rx = p.execute_profile().unwrap();
        p.write_profile(None, &chunk(&[0.2, 0.3], VelocityMode::ZeroVelocity)).unwrap();
        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events.last(), Some(&ProfileEvent::Finished));
        assert!(events.contains(&ProfileEvent::PointsScanned(4)));
        assert!((p.readback("x").unwrap() - 0.3).abs() < 1e-12);
        assert!(!p.is_running());
    }

    #[test]
    fn rejects_ragged_arrays_and_unknown_cs() {
        let mut p = sim();
        let mut bad = chunk(&[0.0, 0.1], VelocityMode::ZeroVelocity);
        bad.user_programs.pop();
        assert!(p.write_profile(Some("CS1"), &bad).is_err());
        assert!(p.write_profile(Some("CS9"), &chunk(&[0.0], VelocityMode::ZeroVelocity)).is_err());
        assert!(p.write_profile(None, &chunk(&[0.0], VelocityMode::ZeroVelocity)).is_err());
    }

    #[test]
    fn execute_needs_a_profile() {
        let mut p = sim();
        let err = p.execute_profile().unwrap_err();
        assert!(matches!(err.downcast_ref::<HwError>(), Some(HwError::NotArmed)));
    }

    #[test]
    fn move_updates_readbacks() {
        let mut p = sim();
        let done = p.move_cs("CS1", &BTreeMap::from([('A', 1.5), ('B', -2.0)]), 0.5).unwrap();
        assert_eq!(done.recv().unwrap(), Ok(()));
        assert_eq!(p.readback("x"), Some(1.5));
        assert_eq!(p.readback("y"), Some(-2.0));
        assert!(p.move_cs("CS1", &BTreeMap::from([('C', 1.0)]), 0.1).is_err());
    }

    #[test]
    fn abort_stops_execution() {
        let mut p = sim();
        p.write_profile(Some("CS1"), &chunk(&[0.0, 0.1], VelocityMode::AveragePrevToNext))
            .unwrap();
        let rx = p.execute_profile().unwrap();
        p.abort_profile().unwrap();
        let last = rx.iter().last();
        assert_eq!(last, Some(ProfileEvent::Failed("profile aborted".into())));
    }
}
