//! Simulated pair of sequencer tables behind one gate.
//!
//! Setting the gate starts an engine thread that plays table A, then B, then
//! A again, each for its row durations in scaled time. A table must be
//! rewritten after it drops `active` before the engine plays it again; if it
//! is not, the engine idles. Row triggers are not simulated: every row
//! starts immediately.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel as xch;
use flyscan_traits::{Clock, Gate, HwResult, OutputBits, Receiver, SeqTable, Sequencer};

use crate::error::HwError;
use crate::util::{scaled, wait_while_with_timeout};

const SEQ_TICK_S: f64 = 8e-9;
/// How long the engine waits for the next table before going idle.
const RELOAD_TIMEOUT: Duration = Duration::from_secs(1);
/// Output bit wired to the detector trigger.
const LIVE_OUT: OutputBits = OutputBits::A;

#[derive(Debug, Default)]
struct Table {
    loaded: Option<SeqTable>,
    repeats: u32,
    active: bool,
    subscribers: Vec<xch::Sender<bool>>,
}

impl Table {
    fn set_active(&mut self, active: bool) {
        self.active = active;
        self.subscribers.retain(|tx| tx.send(active).is_ok());
    }
}

#[derive(Debug, Default)]
struct State {
    tables: [Table; 2],
    enabled: bool,
    /// Bumped on every gate edge; a stale engine stops.
    generation: u64,
    live_pulses: u64,
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    clock: Arc<dyn Clock + Send + Sync>,
    time_scale: f64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn engine(&self, generation: u64) {
        let mut current = 0;
        loop {
            let guard = self.lock();
            let waited = wait_while_with_timeout(
                &self.changed,
                guard,
                |s| s.generation != generation || s.tables[current].loaded.is_some(),
                RELOAD_TIMEOUT,
                "sequencer table",
            );
            let mut s = match waited {
                Ok(s) if s.generation == generation => s,
                Ok(_) => return,
                Err(e) => {
                    tracing::debug!(table = current, error = %e, "no table loaded, sequencer idle");
                    return;
                }
            };
            let Some(table) = s.tables[current].loaded.take() else {
                return;
            };
            let repeats = s.tables[current].repeats.max(1);
            s.tables[current].set_active(true);
            drop(s);

            let (ticks, pulses, forever) = summarize(&table);
            tracing::debug!(table = current, rows = table.len(), ticks, forever, "sequencer table playing");
            self.clock
                .sleep(scaled(ticks as f64 * SEQ_TICK_S * f64::from(repeats), self.time_scale));

            let mut s = self.lock();
            if s.generation != generation {
                return;
            }
            s.live_pulses += pulses * u64::from(repeats);
            if forever {
                // Holds the last row until the gate is reset.
                return;
            }
            s.tables[current].set_active(false);
            drop(s);
            self.changed.notify_all();
            current ^= 1;
        }
    }
}

/// Total ticks, live pulses and whether a row loops until disabled.
fn summarize(table: &SeqTable) -> (u64, u64, bool) {
    let mut ticks = 0;
    let mut pulses = 0;
    let mut forever = false;
    for row in table.rows() {
        if row.repeats == 0 {
            forever = true;
            ticks += row.ticks();
            continue;
        }
        ticks += row.ticks() * u64::from(row.repeats);
        if row.out1.contains(LIVE_OUT) {
            pulses += u64::from(row.repeats);
        }
    }
    (ticks, pulses, forever)
}

/// One table of a simulated pair.
#[derive(Clone)]
pub struct SimSequencer {
    shared: Arc<Shared>,
    index: usize,
}

/// Gate of a simulated pair.
#[derive(Clone)]
pub struct SimGate {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SimSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimSequencer").field("index", &self.index).finish_non_exhaustive()
    }
}

impl std::fmt::Debug for SimGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimGate").field("enabled", &self.is_enabled()).finish_non_exhaustive()
    }
}

/// Tables A and B plus the gate enabling them, sharing one engine.
pub fn sim_sequencer_pair(clock: Arc<dyn Clock + Send + Sync>, time_scale: f64) -> (SimSequencer, SimSequencer, SimGate) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::default()),
        changed: Condvar::new(),
        clock,
        time_scale,
    });
    (
        SimSequencer {
            shared: Arc::clone(&shared),
            index: 0,
        },
        SimSequencer {
            shared: Arc::clone(&shared),
            index: 1,
        },
        SimGate { shared },
    )
}

impl SimSequencer {
    pub fn is_active(&self) -> bool {
        self.shared.lock().tables[self.index].active
    }
}

impl SimGate {
    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    /// Detector triggers emitted since the gate was last set.
    pub fn live_pulses(&self) -> u64 {
        self.shared.lock().live_pulses
    }
}

impl Sequencer for SimSequencer {
    fn write_table(&mut self, table: &SeqTable) -> HwResult<()> {
        let mut s = self.shared.lock();
        let t = &mut s.tables[self.index];
        if t.active {
            return Err(HwError::Rejected("table is executing".into()).into());
        }
        t.loaded = Some(table.clone());
        drop(s);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn set_repeats(&mut self, repeats: u32) -> HwResult<()> {
        self.shared.lock().tables[self.index].repeats = repeats;
        Ok(())
    }

    fn subscribe_active(&mut self) -> HwResult<Receiver<bool>> {
        let mut s = self.shared.lock();
        let t = &mut s.tables[self.index];
        let (tx, rx) = xch::unbounded();
        let _ = tx.send(t.active);
        t.subscribers.push(tx);
        Ok(rx)
    }

    fn unsubscribe_all(&mut self) {
        self.shared.lock().tables[self.index].subscribers.clear();
    }
}

impl Gate for SimGate {
    fn force_set(&mut self) -> HwResult<()> {
        let generation = {
            let mut s = self.shared.lock();
            if s.enabled {
                return Ok(());
            }
            s.enabled = true;
            s.generation += 1;
            s.live_pulses = 0;
            s.generation
        };
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("sim-seq".into())
            .spawn(move || shared.engine(generation))
            .map_err(HwError::from)?;
        tracing::debug!("gate set");
        Ok(())
    }

    fn force_reset(&mut self) -> HwResult<()> {
        {
            let mut s = self.shared.lock();
            s.enabled = false;
            s.generation += 1;
            for t in &mut s.tables {
                if t.active {
                    t.set_active(false);
                }
            }
        }
        self.shared.changed.notify_all();
        tracing::debug!("gate reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flyscan_traits::clock::test_clock::TestClock;
    use flyscan_traits::{SeqRow, SeqTrigger};

    fn row(repeats: u32, live: bool) -> SeqRow {
        SeqRow {
            repeats,
            trigger: SeqTrigger::Immediate,
            position: 0,
            time1: 125,
            out1: if live { OutputBits::A } else { OutputBits::NONE },
            time2: 125,
            out2: OutputBits::NONE,
        }
    }

    #[test]
    fn summary_counts_live_rows_and_loops() {
        let t = SeqTable::from_rows(&[row(3, true), row(1, false), row(0, false)]);
        assert_eq!(summarize(&t), (250 * 5, 3, true));
    }

    #[test]
    fn plays_tables_alternately() {
        let clock = TestClock::new();
        let (mut a, mut b, mut gate) = sim_sequencer_pair(Arc::new(clock.clone()), 1.0);
        a.write_table(&SeqTable::from_rows(&[row(4, true)])).unwrap();
        b.write_table(&SeqTable::from_rows(&[row(2, true)])).unwrap();
        let rx_a = a.subscribe_active().unwrap();
        let rx_b = b.subscribe_active().unwrap();
        gate.force_set().unwrap();
        let seen_a: Vec<bool> = rx_a.iter().take(3).collect();
        assert_eq!(seen_a, vec![false, true, false]);
        let seen_b: Vec<bool> = rx_b.iter().take(3).collect();
        assert_eq!(seen_b, vec![false, true, false]);
        assert_eq!(gate.live_pulses(), 6);
        assert!((clock.elapsed().as_secs_f64() - 12e-6).abs() < 1e-9);
    }

    #[test]
    fn rejects_writes_to_the_playing_table() {
        let (mut a, _b, mut gate) = sim_sequencer_pair(Arc::new(TestClock::new()), 1.0);
        a.write_table(&SeqTable::from_rows(&[row(1, true), row(0, false)])).unwrap();
        let rx = a.subscribe_active().unwrap();
        gate.force_set().unwrap();
        assert_eq!(rx.iter().take(2).last(), Some(true));
        assert!(a.write_table(&SeqTable::default()).is_err());
        gate.force_reset().unwrap();
        assert_eq!(rx.recv().unwrap(), false);
        assert!(!a.is_active());
    }
}
