//! Simulated hardware-triggered detector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel as xch;
use flyscan_traits::{Clock, Completion, Detector, HwResult};

use crate::error::HwError;
use crate::util::scaled;

/// Detector that acquires its frames back to back once armed.
///
/// An armed acquisition completes after `frames * (exposure + readout)` of
/// simulated time, or fails with "stopped" if [`Detector::stop`] was called
/// in the meantime.
pub struct SimDetector {
    clock: Arc<dyn Clock + Send + Sync>,
    time_scale: f64,
    readout_time: f64,
    frequency_accuracy_ppm: f64,
    min_exposure: f64,
    exposure: f64,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for SimDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDetector")
            .field("readout_time", &self.readout_time)
            .field("exposure", &self.exposure)
            .finish_non_exhaustive()
    }
}

impl SimDetector {
    pub fn new(clock: Arc<dyn Clock + Send + Sync>, time_scale: f64, readout_time: f64, frequency_accuracy_ppm: f64) -> Self {
        Self {
            clock,
            time_scale,
            readout_time,
            frequency_accuracy_ppm,
            min_exposure: 0.0,
            exposure: 0.0,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn with_min_exposure(mut self, min_exposure: f64) -> Self {
        self.min_exposure = min_exposure;
        self
    }

    pub fn exposure(&self) -> f64 {
        self.exposure
    }
}

impl Detector for SimDetector {
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
        if !(exposure.is_finite() && exposure > 0.0) {
            return Err(HwError::Rejected(format!("exposure {exposure} must be positive")).into());
        }
        if exposure < self.min_exposure {
            return Err(HwError::Rejected(format!("exposure {exposure} below minimum {}", self.min_exposure)).into());
        }
        self.exposure = exposure;
        tracing::debug!(exposure, "detector exposure set");
        Ok(())
    }

    fn arm(&mut self, frames: usize) -> HwResult<Completion> {
        let armed_as = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = xch::bounded(1);
        let clock = Arc::clone(&self.clock);
        let generation = Arc::clone(&self.generation);
        let frame_time = self.exposure + self.readout_time;
        let scale = self.time_scale;
        std::thread::Builder::new()
            .name("sim-detector".into())
            .spawn(move || {
                clock.sleep(scaled(frame_time * frames as f64, scale));
                let result = if generation.load(Ordering::SeqCst) == armed_as {
                    Ok(())
                } else {
                    Err("stopped".to_string())
                };
                let _ = tx.send(result);
            })
            .map_err(HwError::from)?;
        tracing::debug!(frames, "detector armed");
        Ok(rx)
    }

    fn stop(&mut self) -> HwResult<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flyscan_traits::clock::test_clock::TestClock;

    #[test]
    fn acquisition_takes_frames_times_frame_time() {
        let clock = TestClock::new();
        let mut det = SimDetector::new(Arc::new(clock.clone()), 1.0, 0.002, 50.0);
        det.set_exposure(0.098).unwrap();
        let done = det.arm(10).unwrap();
        assert_eq!(done.recv().unwrap(), Ok(()));
        assert!((clock.elapsed().as_secs_f64() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_bad_exposures() {
        let mut det = SimDetector::new(Arc::new(TestClock::new()), 1.0, 0.002, 50.0).with_min_exposure(0.01);
        assert!(det.set_exposure(0.0).is_err());
        assert!(det.set_exposure(0.005).is_err());
        assert!(det.set_exposure(0.02).is_ok());
        assert!((det.exposure() - 0.02).abs() < 1e-12);
    }
}
