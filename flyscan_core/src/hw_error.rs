//! Maps `Box<dyn Error>` from trait boundaries to typed `ScanError`.
//!
//! The traits in `flyscan_traits` use `Box<dyn Error + Send + Sync>`; this
//! module converts those to our typed error enum, with an optional
//! feature-gated path for `flyscan_hardware::HwError` downcasting.

use crate::error::{Report, ScanError};

/// Map a trait-boundary error to a typed `ScanError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> ScanError {
    #[cfg(feature = "hardware-errors")]
    {
        use flyscan_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout(what) => ScanError::Timeout(what.clone()),
                other => ScanError::HardwareFault(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") || s.to_lowercase().contains("timed out") {
        ScanError::Timeout(s)
    } else {
        ScanError::Hardware(s)
    }
}

/// `map_hw_error` for an owned boxed error, wrapped as a report.
pub fn hw_report(e: Box<dyn std::error::Error + Send + Sync>) -> Report {
    Report::new(map_hw_error(e.as_ref()))
}
