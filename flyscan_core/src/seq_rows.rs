//! Accumulator of sequencer rows with table splitting.

use flyscan_traits::{OutputBits, SeqRow, SeqTable, SeqTrigger};

use crate::util::SEQ_TICK_S;

/// Shortest phase the sequencer honours, in ticks (10 us).
pub const MIN_PULSE: u32 = 1250;
/// Duration of the final dead pulse, in ticks (1 s).
pub const LAST_PULSE: u32 = 125_000_000;
/// Ticks the hardware loses switching from one table to the other.
pub const SEQ_TABLE_SWITCH_DELAY: u32 = 6;

/// Output carrying the live (exposure) gate.
pub const LIVE_OUT: OutputBits = OutputBits::A;
/// Output carrying the dead (readout) gate.
pub const DEAD_OUT: OutputBits = OutputBits::B;

/// Ordered rows plus their total duration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequencerRows {
    rows: Vec<SeqRow>,
    ticks: u64,
}

fn row_ticks(r: &SeqRow) -> u64 {
    u64::from(r.repeats.max(1)) * r.ticks()
}

impl SequencerRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<SeqRow>) -> Self {
        let ticks = rows.iter().map(row_ticks).sum();
        Self { rows, ticks }
    }

    /// Append a row whose first phase lasts `half_duration` with the live and
    /// dead outputs as given, and whose second phase lasts `half_duration - trim`
    /// with every output low.
    #[allow(clippy::too_many_arguments)]
    pub fn add_seq_entry(
        &mut self,
        count: u32,
        trigger: SeqTrigger,
        position: i32,
        half_duration: u32,
        live: bool,
        dead: bool,
        trim: u32,
    ) {
        let out1 = OutputBits::NONE.with(LIVE_OUT, live).with(DEAD_OUT, dead);
        self.push(SeqRow {
            repeats: count,
            trigger,
            position,
            time1: half_duration,
            out1,
            time2: half_duration.saturating_sub(trim),
            out2: OutputBits::NONE,
        });
    }

    pub fn push(&mut self, row: SeqRow) {
        self.ticks += row_ticks(&row);
        self.rows.push(row);
    }

    pub fn extend(&mut self, other: Self) {
        self.ticks += other.ticks;
        self.rows.extend(other.rows);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[SeqRow] {
        &self.rows
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Seconds these rows take to execute (a looping row counts once).
    pub fn duration(&self) -> f64 {
        self.ticks as f64 * SEQ_TICK_S
    }

    /// Split off a chunk of at most `n` rows whose last row runs once; the rest
    /// stays in `self`. A multi-repeat row at the cut is divided so that a
    /// single repeat ends the chunk.
    pub fn split(&mut self, n: usize) -> Self {
        let n = n.max(1);
        let mut rest = if self.rows.len() > n { self.rows.split_off(n) } else { Vec::new() };
        if let Some(last) = self.rows.last().copied()
            && last.repeats > 1
        {
            let peeled = SeqRow {
                repeats: last.repeats - 1,
                ..last
            };
            let single = SeqRow { repeats: 1, ..last };
            let idx = self.rows.len() - 1;
            if self.rows.len() < n {
                self.rows[idx] = peeled;
                self.rows.push(single);
            } else {
                self.rows[idx] = single;
                rest.insert(0, peeled);
            }
        }
        let chunk = Self::from_rows(std::mem::take(&mut self.rows));
        *self = Self::from_rows(rest);
        chunk
    }

    /// Shorten the second phase of the last row by the table switch latency.
    pub fn trim_last(&mut self) {
        if let Some(last) = self.rows.last_mut() {
            let old = last.time2;
            last.time2 = old.saturating_sub(SEQ_TABLE_SWITCH_DELAY);
            self.ticks -= u64::from(old - last.time2) * u64::from(last.repeats.max(1));
        }
    }

    pub fn to_table(&self) -> SeqTable {
        SeqTable::from_rows(&self.rows)
    }
}
