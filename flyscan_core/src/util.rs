//! Common time and tick helpers.

/// Motion controller profile tick in seconds (1 us).
pub const PROFILE_TICK_S: f64 = 1e-6;
/// Sequencer clock tick in seconds (8 ns).
pub const SEQ_TICK_S: f64 = 8e-9;
/// Servo clock numerator: servo period = i10 / SERVO_CLOCK_HZ.
pub const SERVO_CLOCK_HZ: f64 = 8_388_608_000.0;

/// Servo period in seconds for a motion controller's `i10`.
#[inline]
pub fn servo_period(i10: u32) -> f64 {
    f64::from(i10) / SERVO_CLOCK_HZ
}

/// Converts a stream of float durations to integer ticks without drift: each
/// interval is the difference of the rounded cumulative times.
#[derive(Debug, Clone, Default)]
pub struct TickAccumulator {
    elapsed_s: f64,
    emitted_ticks: u64,
    tick_s: f64,
}

impl TickAccumulator {
    pub fn new(tick_s: f64) -> Self {
        Self {
            elapsed_s: 0.0,
            emitted_ticks: 0,
            tick_s,
        }
    }

    /// Ticks for the next interval of `dt` seconds.
    pub fn push(&mut self, dt: f64) -> u64 {
        self.elapsed_s += dt.max(0.0);
        let total = (self.elapsed_s / self.tick_s).round() as u64;
        let out = total.saturating_sub(self.emitted_ticks);
        self.emitted_ticks = total;
        out
    }

    pub fn total_ticks(&self) -> u64 {
        self.emitted_ticks
    }
}

/// Round `x` up to a whole multiple of `q` (tolerating float noise).
#[inline]
pub fn ceil_to_multiple(x: f64, q: f64) -> f64 {
    if q <= 0.0 {
        return x;
    }
    let n = (x / q - 1e-9).ceil().max(0.0);
    n * q
}
