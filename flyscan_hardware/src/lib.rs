#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Simulated beamline hardware behind the `flyscan_traits` contracts.
//!
//! - `pmac`: motion controller executing streamed profiles
//! - `sequencer`: double-buffered sequencer tables and their gate
//! - `detector`: hardware-triggered detector
//!
//! All simulators take a [`flyscan_traits::Clock`] and a time scale, so
//! tests can run whole scans instantly on a `TestClock`.

pub mod detector;
pub mod error;
pub mod pmac;
pub mod sequencer;
pub mod util;

pub use detector::SimDetector;
pub use error::HwError;
pub use pmac::SimMotionController;
pub use sequencer::{SimGate, SimSequencer, sim_sequencer_pair};
