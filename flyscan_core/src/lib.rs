#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Fly-scan engine (hardware-agnostic).
//!
//! This crate turns a scan point generator into continuous-motion
//! trajectories and synchronized detector trigger tables. All hardware
//! interactions go through the `flyscan_traits` collaborator traits.
//!
//! ## Architecture
//!
//! - **Kinematics**: time-optimal two-segment velocity profiles (`velocity`)
//!   and per-axis motor models (`motor`)
//! - **Geometry**: joined/linear point tests (`geometry`) and turnarounds
//!   between rows (`turnaround`)
//! - **Trajectory**: streaming profile planner with a step lookup
//!   (`trajectory`, `profile`)
//! - **Sequencer**: run-length encoded trigger rows (`seq_rows`,
//!   `seq_builder`) loaded through a pair of alternating tables
//!   (`double_buffer`)
//! - **Control**: the scan state machine (`controller`, `status`) driving
//!   parts through lifecycle hooks (`hooks`, `parts`) with a merged
//!   configure contract (`params`) and exposure negotiation (`exposure`)
//!
//! ## Units
//!
//! Positions are in engineering units, times in seconds. Profile times are
//! quantized to 1 us ticks and sequencer times to 8 ns ticks (`util`).

pub mod config;
pub mod context;
pub mod controller;
pub mod conversions;
pub mod double_buffer;
pub mod error;
pub mod exposure;
pub mod generator;
pub mod geometry;
pub mod hooks;
pub mod hw_error;
pub mod mocks;
pub mod motor;
pub mod params;
pub mod parts;
pub mod points;
pub mod process;
pub mod profile;
pub mod seq_builder;
pub mod seq_rows;
pub mod status;
pub mod trajectory;
pub mod turnaround;
pub mod util;
pub mod velocity;

pub use controller::{Controller, RunOutcome, ScanSettings};
pub use error::{Report, Result, ScanError};
pub use generator::{CompoundGenerator, LineGenerator, StaticPointGenerator};
pub use hooks::{Info, Part, PartInfo, StepWindow};
pub use params::ConfigureParams;
pub use process::Process;
pub use status::{ScanState, ScanStatus};
