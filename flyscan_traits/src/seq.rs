//! Sequencer table rows and their struct-of-arrays table form.

use serde::{Deserialize, Serialize};

/// Condition a sequencer row waits for before its first phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeqTrigger {
    Immediate,
    BitA0,
    BitA1,
    BitB0,
    BitB1,
    BitC0,
    BitC1,
    PosaGt,
    PosaLt,
    PosbGt,
    PosbLt,
    PoscGt,
    PoscLt,
}

impl SeqTrigger {
    /// Position-compare trigger on capture bus `bus` (`'A'..='C'`).
    pub fn position(bus: char, increasing: bool) -> Option<Self> {
        Some(match (bus, increasing) {
            ('A', true) => Self::PosaGt,
            ('A', false) => Self::PosaLt,
            ('B', true) => Self::PosbGt,
            ('B', false) => Self::PosbLt,
            ('C', true) => Self::PoscGt,
            ('C', false) => Self::PoscLt,
            _ => return None,
        })
    }

    pub fn is_position_compare(self) -> bool {
        matches!(
            self,
            Self::PosaGt | Self::PosaLt | Self::PosbGt | Self::PosbLt | Self::PoscGt | Self::PoscLt
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Immediate => "IMMEDIATE",
            Self::BitA0 => "BITA=0",
            Self::BitA1 => "BITA=1",
            Self::BitB0 => "BITB=0",
            Self::BitB1 => "BITB=1",
            Self::BitC0 => "BITC=0",
            Self::BitC1 => "BITC=1",
            Self::PosaGt => "POSA>=POSITION",
            Self::PosaLt => "POSA<=POSITION",
            Self::PosbGt => "POSB>=POSITION",
            Self::PosbLt => "POSB<=POSITION",
            Self::PoscGt => "POSC>=POSITION",
            Self::PoscLt => "POSC<=POSITION",
        }
    }
}

/// Output bits `outa..outf` for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OutputBits(u8);

impl OutputBits {
    pub const NONE: Self = Self(0);
    pub const A: Self = Self(1);
    pub const B: Self = Self(1 << 1);
    pub const C: Self = Self(1 << 2);
    pub const D: Self = Self(1 << 3);
    pub const E: Self = Self(1 << 4);
    pub const F: Self = Self(1 << 5);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[must_use]
    pub fn with(self, other: Self, on: bool) -> Self {
        if on { Self(self.0 | other.0) } else { Self(self.0 & !other.0) }
    }
}

impl std::ops::BitOr for OutputBits {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One sequencer row: repeat count, trigger, compare position and two phases.
/// `repeats == 0` loops forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRow {
    pub repeats: u32,
    pub trigger: SeqTrigger,
    pub position: i32,
    pub time1: u32,
    pub out1: OutputBits,
    pub time2: u32,
    pub out2: OutputBits,
}

impl SeqRow {
    /// Ticks one execution of this row takes (ignoring the trigger wait).
    pub fn ticks(&self) -> u64 {
        u64::from(self.time1) + u64::from(self.time2)
    }
}

/// Sequencer table, struct-of-arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeqTable {
    pub repeats: Vec<u32>,
    pub trigger: Vec<SeqTrigger>,
    pub position: Vec<i32>,
    pub time1: Vec<u32>,
    pub out1: Vec<OutputBits>,
    pub time2: Vec<u32>,
    pub out2: Vec<OutputBits>,
}

impl SeqTable {
    pub fn from_rows(rows: &[SeqRow]) -> Self {
        let mut t = Self::default();
        for r in rows {
            t.push(*r);
        }
        t
    }

    pub fn push(&mut self, r: SeqRow) {
        self.repeats.push(r.repeats);
        self.trigger.push(r.trigger);
        self.position.push(r.position);
        self.time1.push(r.time1);
        self.out1.push(r.out1);
        self.time2.push(r.time2);
        self.out2.push(r.out2);
    }

    pub fn len(&self) -> usize {
        self.repeats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repeats.is_empty()
    }

    pub fn row(&self, i: usize) -> Option<SeqRow> {
        if i >= self.len() {
            return None;
        }
        Some(SeqRow {
            repeats: self.repeats[i],
            trigger: self.trigger[i],
            position: self.position[i],
            time1: self.time1[i],
            out1: self.out1[i],
            time2: self.time2[i],
            out2: self.out2[i],
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = SeqRow> + '_ {
        (0..self.len()).filter_map(|i| self.row(i))
    }
}
