//! Collaborator contracts for the scan engine.
//!
//! The engine never talks to hardware directly. Motion controllers,
//! sequencer tables, the scan gate and detectors are reached through the
//! traits in this crate; errors cross the boundary as
//! `Box<dyn Error + Send + Sync>` and are mapped to typed errors by the core.

pub mod clock;
pub mod profile;
pub mod seq;

use std::collections::BTreeMap;

pub use clock::{Clock, MonotonicClock};
pub use crossbeam_channel::Receiver;
pub use profile::{LayoutRow, MotorRecord, ProfileEvent, ProfileWrite, UserProgram, VelocityMode};
pub use seq::{OutputBits, SeqRow, SeqTable, SeqTrigger};

/// Result type used at the hardware boundary.
pub type HwResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Completion handle for a long-running hardware request (move, arm).
/// Yields `Ok(())` on success or an error message, exactly once.
pub type Completion = Receiver<Result<(), String>>;

/// Multi-axis motion controller executing time-parameterized profiles.
pub trait MotionController: Send {
    /// Servo interrupt divider; the servo period is `i10 / 8_388_608_000` s.
    fn i10(&self) -> HwResult<u32>;

    /// Motors wired to this controller (scannable name -> motor record handle).
    fn layout(&self) -> HwResult<Vec<LayoutRow>>;

    /// Snapshot of one motor's attributes.
    fn motor(&self, mri: &str) -> HwResult<MotorRecord>;

    /// Write profile samples. `Some(cs_port)` starts a fresh profile in that
    /// coordinate system; `None` appends to the profile already loaded.
    fn write_profile(&mut self, cs_port: Option<&str>, profile: &ProfileWrite) -> HwResult<()>;

    /// Start executing the loaded profile. Progress arrives on the returned
    /// channel as monotone `PointsScanned` events followed by `Finished`.
    fn execute_profile(&mut self) -> HwResult<Receiver<ProfileEvent>>;

    /// Stop a running profile.
    fn abort_profile(&mut self) -> HwResult<()>;

    /// Coordinated move of the named CS axes (letter -> EGU demand).
    fn move_cs(
        &mut self,
        cs_port: &str,
        demands: &BTreeMap<char, f64>,
        move_time: f64,
    ) -> HwResult<Completion>;
}

/// One sequencer table of a double-buffered pair.
pub trait Sequencer: Send {
    fn write_table(&mut self, table: &SeqTable) -> HwResult<()>;
    fn set_repeats(&mut self, repeats: u32) -> HwResult<()>;
    /// Subscribe to the `active` flag; the current value is delivered first.
    fn subscribe_active(&mut self) -> HwResult<Receiver<bool>>;
    fn unsubscribe_all(&mut self);
}

/// Scan gate that enables the sequencers.
pub trait Gate: Send {
    fn force_set(&mut self) -> HwResult<()>;
    fn force_reset(&mut self) -> HwResult<()>;
}

/// Hardware-triggered detector.
pub trait Detector: Send {
    /// Seconds between the end of one exposure and the next trigger being accepted.
    fn readout_time(&self) -> f64;
    /// Crystal accuracy of the detector's internal timing, in ppm.
    fn frequency_accuracy_ppm(&self) -> f64;
    fn min_exposure(&self) -> f64 {
        0.0
    }
    fn set_exposure(&mut self, exposure: f64) -> HwResult<()>;
    /// Arm for `frames` hardware triggers.
    fn arm(&mut self, frames: usize) -> HwResult<Completion>;
    fn stop(&mut self) -> HwResult<()>;
}
