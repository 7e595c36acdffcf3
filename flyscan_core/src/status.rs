//! Scan controller states and the transitions allowed between them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    Ready,
    Configuring,
    Armed,
    Running,
    PostRun,
    Finished,
    Seeking,
    Paused,
    Aborting,
    Aborted,
    Resetting,
    Fault,
    Disabling,
    Disabled,
}

impl ScanState {
    /// Whether the controller may move from `self` to `to`.
    pub fn can_transition(self, to: Self) -> bool {
        if matches!(to, Self::Fault | Self::Disabling) {
            return true;
        }
        match self {
            Self::Ready => matches!(to, Self::Configuring | Self::Aborting),
            Self::Configuring => matches!(to, Self::Armed | Self::Aborting),
            Self::Armed => matches!(to, Self::Running | Self::Seeking | Self::Resetting | Self::Aborting),
            Self::Running => matches!(to, Self::PostRun | Self::Seeking | Self::Aborting),
            Self::PostRun => matches!(to, Self::Finished | Self::Armed | Self::Seeking | Self::Aborting),
            Self::Finished => matches!(to, Self::Seeking | Self::Configuring | Self::Resetting | Self::Aborting),
            Self::Seeking => matches!(to, Self::Armed | Self::Paused | Self::Aborting),
            Self::Paused => matches!(to, Self::Seeking | Self::Running | Self::Aborting),
            Self::Aborting => matches!(to, Self::Aborted),
            Self::Aborted | Self::Fault | Self::Disabled => matches!(to, Self::Resetting),
            Self::Resetting => matches!(to, Self::Ready),
            Self::Disabling => matches!(to, Self::Disabled),
        }
    }

    /// States from which `abort` is accepted.
    pub fn abortable(self) -> bool {
        self.can_transition(Self::Aborting)
    }

    /// States from which `reset` is accepted.
    pub fn resettable(self) -> bool {
        self.can_transition(Self::Resetting)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Configuring => "CONFIGURING",
            Self::Armed => "ARMED",
            Self::Running => "RUNNING",
            Self::PostRun => "POSTRUN",
            Self::Finished => "FINISHED",
            Self::Seeking => "SEEKING",
            Self::Paused => "PAUSED",
            Self::Aborting => "ABORTING",
            Self::Aborted => "ABORTED",
            Self::Resetting => "RESETTING",
            Self::Fault => "FAULT",
            Self::Disabling => "DISABLING",
            Self::Disabled => "DISABLED",
        }
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of the controller's public attributes, broadcast on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanStatus {
    pub state: ScanState,
    pub completed_steps: usize,
    pub configured_steps: usize,
    pub total_steps: usize,
    /// Message of the last fault, cleared by reset.
    pub error: Option<String>,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self {
            state: ScanState::Ready,
            completed_steps: 0,
            configured_steps: 0,
            total_steps: 0,
            error: None,
        }
    }
}
