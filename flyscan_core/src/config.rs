//! Configuration types for the scan engine.
//!
//! These are the runtime configuration structs used by the planners and the
//! controller. They are separate from the TOML-deserialized config in
//! `flyscan_config`.

use std::time::Duration;

/// Trajectory planner configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerCfg {
    /// Samples per profile write (PROFILE_POINTS).
    pub profile_points: usize,
    /// Scan points fetched from the generator per batch.
    pub batch_points: usize,
    /// Longest single profile sample in seconds; longer samples are split.
    pub max_move_time: f64,
    /// Shortest interval between two profile samples in seconds.
    pub min_interval: f64,
    /// Shortest turnaround between non-joined points in seconds.
    pub min_turnaround: f64,
}

impl Default for PlannerCfg {
    fn default() -> Self {
        Self {
            profile_points: 10_000,
            batch_points: 4_000,
            max_move_time: 4.0,
            min_interval: 0.002,
            min_turnaround: 0.0,
        }
    }
}

/// What starts each row of pulses on the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowTrigger {
    /// Position compare on the encoder of the axis moving most.
    #[default]
    PositionCompare,
    /// External gate bit driven by the motion controller's user programs.
    MotionController,
    /// No per-row trigger; rows start immediately.
    None,
}

/// Sequencer and double-buffer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerCfg {
    /// Capacity of one hardware table (SEQ_TABLE_ROWS).
    pub table_rows: usize,
    /// Largest repeat count a row can hold.
    pub max_repeats: u32,
    /// Minimum wall-clock time covered by one table, seconds.
    pub min_table_duration: f64,
    pub row_trigger: RowTrigger,
}

impl Default for SequencerCfg {
    fn default() -> Self {
        Self {
            table_rows: 4096,
            max_repeats: 4096,
            min_table_duration: 15.0,
            row_trigger: RowTrigger::PositionCompare,
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerCfg {
    /// Identifier of the controller in the process registry.
    pub mri: String,
    /// Bound on every hardware wait (DEFAULT_TIMEOUT).
    pub default_timeout: Duration,
    /// Maximum passes of the validate tweak loop.
    pub tweak_iterations: usize,
}

impl Default for ControllerCfg {
    fn default() -> Self {
        Self {
            mri: "SCAN".to_string(),
            default_timeout: Duration::from_secs(10),
            tweak_iterations: 10,
        }
    }
}
