//! Exposure against per-point duration, allowing for detector readout and
//! timing drift.

use crate::error::{Result, ScanError};

/// Relative margin added to computed durations so the exposure still fits
/// once the duration has been through floating point round trips.
const DURATION_MARGIN: f64 = 1e-12;

/// Change `negotiate` wants made to the configure parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExposureTweak {
    /// Variable-duration scan: fix the point duration at this value.
    Duration(f64),
    Exposure(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureDeadtime {
    pub readout_time: f64,
    pub frequency_accuracy_ppm: f64,
    pub min_exposure: f64,
}

impl ExposureDeadtime {
    pub fn new(readout_time: f64, frequency_accuracy_ppm: f64, min_exposure: f64) -> Self {
        Self {
            readout_time,
            frequency_accuracy_ppm,
            min_exposure,
        }
    }

    fn drift(&self, duration: f64) -> f64 {
        self.frequency_accuracy_ppm * duration / 1e6
    }

    /// Longest exposure that fits in a point of `duration`.
    pub fn max_exposure(&self, duration: f64) -> f64 {
        duration - self.readout_time - self.drift(duration)
    }

    /// Shortest point duration that fits `exposure` plus readout.
    pub fn min_duration(&self, exposure: f64) -> f64 {
        (exposure.max(self.min_exposure) + self.readout_time) * (1.0 + DURATION_MARGIN)
    }

    /// Check `exposure` against `duration` and return the adjustment needed,
    /// if any. A `duration` of 0 means the scan duration is still variable.
    pub fn negotiate(&self, duration: f64, exposure: f64) -> Result<Option<ExposureTweak>> {
        if duration == 0.0 {
            return Ok(Some(ExposureTweak::Duration(self.min_duration(exposure))));
        }
        let max = self.max_exposure(duration);
        if max < self.min_exposure {
            return Err(ScanError::Validation(format!(
                "duration {duration} s leaves {max} s for exposure, below minimum {}",
                self.min_exposure
            ))
            .into());
        }
        if exposure <= 0.0 || exposure > max {
            return Ok(Some(ExposureTweak::Exposure(max)));
        }
        if exposure < self.min_exposure {
            return Ok(Some(ExposureTweak::Exposure(self.min_exposure)));
        }
        Ok(None)
    }
}
