//! Two sequencer tables filled alternately from a lazy row stream.
//!
//! While one table executes the other is refilled; the hardware switches
//! tables when the executing one drops its `active` flag.

use std::iter::Peekable;

use flyscan_traits::{Receiver, Sequencer};

use crate::config::SequencerCfg;
use crate::error::Result;
use crate::hw_error::hw_report;
use crate::seq_rows::SequencerRows;

type RowStream = Box<dyn Iterator<Item = Result<SequencerRows>> + Send>;

const NAMES: [&str; 2] = ["A", "B"];

pub struct DoubleBuffer {
    tables: [Box<dyn Sequencer>; 2],
    cfg: SequencerCfg,
    stream: Option<Peekable<RowStream>>,
    pending: SequencerRows,
    active: [bool; 2],
    subscribed: bool,
    finished: bool,
    loaded: usize,
}

impl std::fmt::Debug for DoubleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleBuffer")
            .field("pending", &self.pending.len())
            .field("active", &self.active)
            .field("finished", &self.finished)
            .field("loaded", &self.loaded)
            .finish_non_exhaustive()
    }
}

impl DoubleBuffer {
    pub fn new(table_a: Box<dyn Sequencer>, table_b: Box<dyn Sequencer>, cfg: SequencerCfg) -> Self {
        Self {
            tables: [table_a, table_b],
            cfg,
            stream: None,
            pending: SequencerRows::new(),
            active: [false; 2],
            subscribed: false,
            finished: false,
            loaded: 0,
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Chunks written to either table since the last configure.
    pub fn chunks_loaded(&self) -> usize {
        self.loaded
    }

    /// Reset, then load the first two chunks of `rows` into tables A and B.
    pub fn configure(&mut self, rows: impl Iterator<Item = Result<SequencerRows>> + Send + 'static) -> Result<()> {
        self.clean_up();
        self.finished = false;
        self.loaded = 0;
        self.pending = SequencerRows::new();
        self.active = [false; 2];
        let stream: RowStream = Box::new(rows);
        self.stream = Some(stream.peekable());

        for table in &mut self.tables {
            table.set_repeats(1).map_err(hw_report)?;
        }
        match self.next_chunk()? {
            Some(chunk) => self.load(0, &chunk)?,
            None => {
                self.finished = true;
                return Ok(());
            }
        }
        match self.next_chunk()? {
            Some(chunk) => self.load(1, &chunk)?,
            None => self.finished = true,
        }
        tracing::info!(finished = self.finished, "sequencer tables configured");
        Ok(())
    }

    /// Subscribe to both tables' `active` flags. Deliver every value received
    /// to [`handle_active`](Self::handle_active).
    pub fn run(&mut self) -> Result<[Receiver<bool>; 2]> {
        let a = self.tables[0].subscribe_active().map_err(hw_report)?;
        let b = self.tables[1].subscribe_active().map_err(hw_report)?;
        self.subscribed = true;
        Ok([a, b])
    }

    /// React to table `index` reporting `active`. Returns whether the buffer
    /// has finished.
    pub fn handle_active(&mut self, index: usize, active: bool) -> Result<bool> {
        let Some(was) = self.active.get_mut(index) else {
            return Ok(self.finished);
        };
        let fell = *was && !active;
        *was = active;
        if !fell || self.finished {
            return Ok(self.finished);
        }
        match self.next_chunk()? {
            Some(chunk) => self.load(index, &chunk)?,
            None => {
                tracing::info!(table = NAMES[index], "row stream exhausted");
                self.clean_up();
                self.finished = true;
            }
        }
        Ok(self.finished)
    }

    /// Drop subscriptions and the row stream. Safe to repeat.
    pub fn clean_up(&mut self) {
        if self.subscribed {
            for table in &mut self.tables {
                table.unsubscribe_all();
            }
            self.subscribed = false;
        }
        self.stream = None;
        self.pending = SequencerRows::new();
    }

    fn load(&mut self, index: usize, chunk: &SequencerRows) -> Result<()> {
        tracing::info!(table = NAMES[index], rows = chunk.len(), duration = chunk.duration(), "loading sequencer table");
        self.tables[index].write_table(&chunk.to_table()).map_err(hw_report)?;
        self.loaded += 1;
        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<SequencerRows>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        while !(self.pending.duration() > self.cfg.min_table_duration || self.pending.len() > self.cfg.table_rows) {
            match stream.next() {
                Some(rows) => self.pending.extend(rows?),
                None => break,
            }
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        if stream.peek().is_none() && self.pending.len() <= self.cfg.table_rows {
            // last chunk, no switch follows it
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        let mut chunk = self.pending.split(self.cfg.table_rows);
        chunk.trim_last();
        tracing::debug!(rows = chunk.len(), remaining = self.pending.len(), "split sequencer chunk");
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockSequencer;
    use std::collections::BTreeMap;

    use crate::config::RowTrigger;
    use crate::generator::{CompoundGenerator, StaticPointGenerator};
    use crate::motor::AxisMapping;
    use crate::seq_builder::{SeqRowGenerator, half_ticks};
    use crate::seq_rows::{LAST_PULSE, MIN_PULSE, SEQ_TABLE_SWITCH_DELAY};
    use flyscan_traits::SeqTrigger;
    use rstest::rstest;

    const ROWS: usize = 100;

    fn cfg() -> SequencerCfg {
        SequencerCfg {
            table_rows: ROWS,
            ..SequencerCfg::default()
        }
    }

    fn stream(n: usize, half: u32) -> SequencerRows {
        let mut r = SequencerRows::new();
        for _ in 0..n {
            r.add_seq_entry(1, SeqTrigger::Immediate, 0, half, true, false, 0);
        }
        r
    }

    fn buffer() -> (DoubleBuffer, MockSequencer, MockSequencer) {
        let (a, b) = (MockSequencer::new(), MockSequencer::new());
        let db = DoubleBuffer::new(Box::new(a.clone()), Box::new(b.clone()), cfg());
        (db, a, b)
    }

    #[test]
    fn three_chunks_alternate_tables() {
        // 250 rows totalling 40 s
        let half = (40.0 / 250.0 / 2.0 / crate::util::SEQ_TICK_S) as u32;
        let (mut db, a, b) = buffer();
        db.configure(std::iter::once(Ok(stream(250, half)))).unwrap();
        assert!(!db.finished());
        let (ta, tb) = (a.tables()[0].clone(), b.tables()[0].clone());
        assert_eq!(ta.len(), ROWS);
        assert_eq!(tb.len(), ROWS);
        assert_eq!(ta.row(ROWS - 1).unwrap().time2, half - SEQ_TABLE_SWITCH_DELAY);
        assert_eq!(tb.row(ROWS - 1).unwrap().time2, half - SEQ_TABLE_SWITCH_DELAY);
        assert_eq!(a.repeats(), Some(1));

        let [_ra, _rb] = db.run().unwrap();
        assert!(!db.handle_active(0, true).unwrap());
        assert!(!db.handle_active(0, false).unwrap());
        let reload = a.tables()[1].clone();
        assert_eq!(reload.len(), 50);
        assert_eq!(reload.row(49).unwrap().time2, half);

        assert!(!db.handle_active(1, true).unwrap());
        assert!(db.handle_active(1, false).unwrap());
        assert_eq!(b.tables().len(), 1);
        assert_eq!(a.unsubscribe_count(), 1);
        assert_eq!(b.unsubscribe_count(), 1);

        db.clean_up();
        db.clean_up();
        assert_eq!(a.unsubscribe_count(), 1);
        assert!(db.handle_active(0, false).unwrap());
        assert_eq!(a.tables().len(), 2);
    }

    #[test]
    fn single_chunk_finishes_at_configure() {
        let (mut db, a, b) = buffer();
        db.configure(vec![Ok(stream(3, MIN_PULSE)), Ok(stream(2, MIN_PULSE))].into_iter()).unwrap();
        assert!(db.finished());
        assert_eq!(a.tables()[0].len(), 5);
        assert_eq!(a.tables()[0].row(4).unwrap().time2, MIN_PULSE);
        assert!(b.tables().is_empty());
    }

    #[test]
    fn long_duration_triggers_split_below_capacity() {
        // each row 10 s, so two rows exceed the table duration
        let half = (5.0 / crate::util::SEQ_TICK_S) as u32;
        let (mut db, a, b) = buffer();
        db.configure((0..5).map(move |_| Ok(stream(1, half)))).unwrap();
        assert_eq!(a.tables()[0].len(), 2);
        assert_eq!(b.tables()[0].len(), 2);
        assert_eq!(db.chunks_loaded(), 2);
    }

    #[test]
    fn repeats_are_peeled_at_capacity() {
        let mut big = SequencerRows::new();
        big.add_seq_entry(50, SeqTrigger::Immediate, 0, MIN_PULSE, true, false, 0);
        let (mut db, a, _b) = buffer();
        db.configure((0..ROWS + 1).map(move |_| Ok(big.clone()))).unwrap();
        let t = a.tables()[0].clone();
        assert_eq!(t.len(), ROWS);
        assert_eq!(t.row(ROWS - 1).unwrap().repeats, 1);
        assert_eq!(t.row(ROWS - 2).unwrap().repeats, 50);
    }

    #[rstest]
    #[case(500, 0.01, 7)]
    #[case(120, 0.2, 3)]
    #[case(1000, 0.001, 1)]
    fn software_timed_tables_add_up_to_the_scan(#[case] points: usize, #[case] duration: f64, #[case] max_repeats: u32) {
        let g = CompoundGenerator::new(vec![StaticPointGenerator::new(points).into()], duration);
        let rows =
            SeqRowGenerator::new(g, AxisMapping::new(), BTreeMap::new(), RowTrigger::None, max_repeats, 16, 0, points)
                .unwrap();
        let cfg = SequencerCfg {
            table_rows: 10,
            min_table_duration: 0.05,
            ..SequencerCfg::default()
        };
        let (a, b) = (MockSequencer::new(), MockSequencer::new());
        let mut db = DoubleBuffer::new(Box::new(a.clone()), Box::new(b.clone()), cfg);
        db.configure(rows).unwrap();
        let [_ra, _rb] = db.run().unwrap();
        let mut index = 0;
        let mut finished = db.finished();
        for _ in 0..10_000 {
            if finished {
                break;
            }
            db.handle_active(index, true).unwrap();
            finished = db.handle_active(index, false).unwrap();
            index ^= 1;
        }
        assert!(finished);

        let tables: Vec<_> = a.tables().into_iter().chain(b.tables()).collect();
        assert!(tables.len() > 2);
        let ticks: u64 = tables
            .iter()
            .flat_map(|t| t.rows().collect::<Vec<_>>())
            .filter(|r| r.repeats > 0)
            .map(|r| u64::from(r.repeats) * (u64::from(r.time1) + u64::from(r.time2)))
            .sum();
        // every table but the last loses the switch latency
        let trimmed = (tables.len() as u64 - 1) * u64::from(SEQ_TABLE_SWITCH_DELAY);
        let scan = points as u64 * 2 * u64::from(half_ticks(duration));
        assert_eq!(ticks + trimmed, scan + 2 * u64::from(LAST_PULSE));
        let seconds = (ticks + trimmed - 2 * u64::from(LAST_PULSE)) as f64 * crate::util::SEQ_TICK_S;
        assert!((seconds - points as f64 * duration).abs() < 1e-6, "{seconds}");
    }
}
