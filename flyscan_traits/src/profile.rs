//! Value types exchanged with the motion controller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How the controller derives the velocity at a profile sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VelocityMode {
    /// Average of the previous and next segment velocities.
    AveragePrevToNext = 0,
    /// Exact velocity arriving from the previous sample.
    RealPrevToCurrent = 1,
    /// Average velocity of the previous segment.
    AveragePrevToCurrent = 2,
    ZeroVelocity = 3,
}

/// User program fired by the controller when a sample is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UserProgram {
    NoProgram = 0,
    Live = 1,
    Dead = 2,
    Mid = 4,
    Zero = 8,
}

impl VelocityMode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl UserProgram {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One chunk of profile samples, struct-of-arrays. All arrays share a length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileWrite {
    /// Ticks (1 us) from the previous sample to this one.
    pub time_array: Vec<u32>,
    pub velocity_mode: Vec<VelocityMode>,
    pub user_programs: Vec<UserProgram>,
    /// Demand positions in EGU keyed by CS axis letter.
    pub positions: BTreeMap<char, Vec<f64>>,
}

impl ProfileWrite {
    pub fn len(&self) -> usize {
        self.time_array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_array.is_empty()
    }
}

/// Progress of a running profile.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileEvent {
    PointsScanned(usize),
    Finished,
    Failed(String),
}

/// Row of the controller's layout table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutRow {
    /// User-facing scannable name.
    pub name: String,
    /// Handle of the motor record.
    pub mri: String,
}

/// Attribute snapshot of one motor record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorRecord {
    /// "CS1,A" style coordinate-system assignment; empty when unassigned.
    pub cs: String,
    pub max_velocity: f64,
    pub max_velocity_percent: f64,
    pub acceleration_time: f64,
    pub resolution: f64,
    pub offset: f64,
    pub readback: f64,
    pub velocity_settle: f64,
    pub units: String,
    pub user_low_limit: f64,
    pub user_high_limit: f64,
}

impl Default for MotorRecord {
    fn default() -> Self {
        Self {
            cs: String::new(),
            max_velocity: 1.0,
            max_velocity_percent: 100.0,
            acceleration_time: 0.1,
            resolution: 0.001,
            offset: 0.0,
            readback: 0.0,
            velocity_settle: 0.0,
            units: "mm".to_string(),
            user_low_limit: 0.0,
            user_high_limit: 0.0,
        }
    }
}
