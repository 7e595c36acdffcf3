use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScanError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("validate did not converge after {iterations} tweak iterations: {detail}")]
    TweakLoopExhausted { iterations: usize, detail: String },
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("kinematically infeasible: {0}")]
    Kinematic(String),
    #[error("soft limit violated on {axis}: {position} outside [{low}, {high}]")]
    SoftLimit {
        axis: String,
        position: f64,
        low: f64,
        high: f64,
    },
    #[error("turnaround: {0}")]
    Turnaround(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("breakpoints {breakpoints:?} do not partition {size} steps")]
    Breakpoints { breakpoints: Vec<usize>, size: usize },
}

impl ScanError {
    /// Errors detected before any hardware was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::TweakLoopExhausted { .. }
                | Self::Kinematic(_)
                | Self::Config(_)
                | Self::Breakpoints { .. }
        )
    }
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

/// Typed root of a report, if it has one.
pub fn scan_error(report: &Report) -> Option<&ScanError> {
    report.downcast_ref::<ScanError>()
}
