use std::sync::{Condvar, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{HwError, Result};

/// Wall-clock duration of `seconds` of simulated time.
pub fn scaled(seconds: f64, time_scale: f64) -> Duration {
    if !(seconds.is_finite() && seconds > 0.0 && time_scale > 0.0) {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(seconds / time_scale)
}

/// Block on `cv` until `ready` holds or `timeout` passes. Returns the guard
/// so the caller keeps the lock, or `HwError::Timeout` naming `what`.
pub fn wait_while_with_timeout<'a, T>(
    cv: &Condvar,
    mut guard: MutexGuard<'a, T>,
    mut ready: impl FnMut(&T) -> bool,
    timeout: Duration,
    what: &str,
) -> Result<MutexGuard<'a, T>> {
    let deadline = Instant::now() + timeout;
    while !ready(&guard) {
        let now = Instant::now();
        if now >= deadline {
            return Err(HwError::Timeout(what.to_string()));
        }
        guard = cv
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
    Ok(guard)
}
