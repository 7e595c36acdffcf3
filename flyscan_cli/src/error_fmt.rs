//! Human-readable error descriptions and structured JSON error formatting.

use flyscan_core::ScanError;

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(se) = err.downcast_ref::<ScanError>() {
        return match se {
            ScanError::Validation(msg) => format!(
                "What happened: The scan was rejected during validation ({msg}).\nLikely causes: A duration, exposure or axis that the detectors or motors cannot support.\nHow to fix: Adjust the [scan] section (duration, exposure, axes_to_move) and run `flyscan validate`."
            ),
            ScanError::TweakLoopExhausted { iterations, detail } => format!(
                "What happened: Parts kept changing the scan parameters after {iterations} validate passes ({detail}).\nLikely causes: Two detectors asking for incompatible exposures or durations.\nHow to fix: Set an explicit scan.duration and scan.exposure that every detector accepts, or raise controller.tweak_iterations."
            ),
            ScanError::Kinematic(msg) => format!(
                "What happened: The trajectory cannot be planned ({msg}).\nLikely causes: Points too close together in time for the motor acceleration, or velocities above max_velocity.\nHow to fix: Lengthen scan.duration, reduce the step size, or check the motor's max_velocity and acceleration_time."
            ),
            ScanError::SoftLimit { axis, position, low, high } => format!(
                "What happened: Motor {axis} would move to {position} which is outside its soft limits [{low}, {high}].\nLikely causes: The scan range plus the run-up and turnaround distance exceeds the limits.\nHow to fix: Shrink the scan range on {axis}, shorten acceleration_time, or widen low_limit/high_limit in [[motors]]."
            ),
            ScanError::Turnaround(msg) => format!(
                "What happened: No turnaround could be planned between rows ({msg}).\nLikely causes: Rows too close for the motors to reverse, or planner.min_turnaround_s too small.\nHow to fix: Increase planner.min_turnaround_s or scan.duration."
            ),
            ScanError::Timeout(what) => format!(
                "What happened: Timed out waiting for {what}.\nLikely causes: A simulator stalled or the time scale is too slow for the configured timeout.\nHow to fix: Raise controller.default_timeout_ms or simulator.time_scale, then rerun with --log-level=debug."
            ),
            ScanError::HardwareFault(msg) => format!(
                "What happened: The hardware reported a fault during the scan ({msg}).\nLikely causes: The motion profile underran or was stopped externally.\nHow to fix: Reset and rerun; if it repeats, lower planner.profile_points or raise planner.batch_points."
            ),
            ScanError::Hardware(msg) => format!(
                "What happened: A hardware request failed ({msg}).\nLikely causes: A command was sent in the wrong state or with a value the device rejects.\nHow to fix: Re-run with --log-level=debug to see which part issued it."
            ),
            ScanError::State(msg) => format!(
                "What happened: The controller refused the request ({msg}).\nLikely causes: A command issued in the wrong state, e.g. run before configure.\nHow to fix: Reset the controller and configure the scan again."
            ),
            ScanError::Config(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: A scan axis missing from [[motors]], axes on different coordinate systems, or a motor without an encoder bus for position compare.\nHow to fix: Edit the config file, then rerun `flyscan validate`."
            ),
            ScanError::Breakpoints { breakpoints, size } => format!(
                "What happened: Breakpoints {breakpoints:?} do not divide the {size} scan steps.\nLikely causes: Breakpoint sizes that do not add up to the scan size (or a divisor of it).\nHow to fix: Make scan.breakpoints sum to a divisor of the number of points."
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = format!("{err:#}");
    let lower = msg.to_ascii_lowercase();

    if lower.contains("read config") {
        return format!(
            "What happened: The config file could not be read.\nLikely causes: Wrong --config path or missing permissions.\nHow to fix: Pass --config <FILE> pointing at a readable TOML file. Original: {msg}"
        );
    }

    if lower.contains("parse config toml") {
        return format!(
            "What happened: The config file is not valid TOML for this tool.\nLikely causes: A typo in a key, a wrong value type, or a section name that does not exist.\nHow to fix: Compare with etc/flyscan.toml. Original: {msg}"
        );
    }

    if lower.contains("invalid configuration") || lower.contains("invalid scan overrides") {
        return format!(
            "What happened: Configuration is invalid or incomplete.\nLikely causes: Out-of-range values or duplicate motors.\nHow to fix: Edit the TOML config and try again. Original: {msg}"
        );
    }

    if lower.contains("no [scan] section") {
        return "What happened: The config has no [scan] section.\nLikely causes: The command needs a scan to run or plan.\nHow to fix: Add a [scan] section with at least one [[scan.lines]] entry.".to_string();
    }

    // Motor CSV header special-case
    if lower.contains("motor csv must have headers") {
        return "Invalid headers in motor CSV. Expected 'name,cs,max_velocity,acceleration_time,resolution,units,encoder'."
            .to_string();
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!("Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}")
}

/// Stable exit codes per error kind; untyped errors return 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match err.downcast_ref::<ScanError>() {
        Some(se) if se.is_validation() => 2,
        Some(ScanError::SoftLimit { .. }) => 3,
        Some(ScanError::Timeout(_)) => 4,
        Some(ScanError::HardwareFault(_) | ScanError::Hardware(_)) => 5,
        Some(ScanError::State(_)) => 6,
        _ => 1,
    }
}

fn reason_name(err: &eyre::Report) -> &'static str {
    match err.downcast_ref::<ScanError>() {
        Some(ScanError::Validation(_)) => "Validation",
        Some(ScanError::TweakLoopExhausted { .. }) => "TweakLoopExhausted",
        Some(ScanError::Kinematic(_)) => "Kinematic",
        Some(ScanError::SoftLimit { .. }) => "SoftLimit",
        Some(ScanError::Turnaround(_)) => "Turnaround",
        Some(ScanError::Timeout(_)) => "Timeout",
        Some(ScanError::HardwareFault(_)) => "HardwareFault",
        Some(ScanError::Hardware(_)) => "Hardware",
        Some(ScanError::State(_)) => "State",
        Some(ScanError::Config(_)) => "Config",
        Some(ScanError::Breakpoints { .. }) => "Breakpoints",
        None => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let msg = humanize(err);
    match err.downcast_ref::<ScanError>() {
        Some(ScanError::SoftLimit { axis, position, low, high }) => json!({
            "reason": reason_name(err),
            "details": { "axis": axis, "position": position, "low": low, "high": high },
            "message": msg,
        })
        .to_string(),
        Some(ScanError::Breakpoints { breakpoints, size }) => json!({
            "reason": reason_name(err),
            "details": { "breakpoints": breakpoints, "size": size },
            "message": msg,
        })
        .to_string(),
        _ => json!({ "reason": reason_name(err), "message": msg }).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ScanError::Validation("x".into()), 2, "Validation")]
    #[case(ScanError::Breakpoints { breakpoints: vec![4], size: 10 }, 2, "Breakpoints")]
    #[case(ScanError::SoftLimit { axis: "x".into(), position: 2.0, low: 0.0, high: 1.0 }, 3, "SoftLimit")]
    #[case(ScanError::Timeout("move".into()), 4, "Timeout")]
    #[case(ScanError::HardwareFault("underrun".into()), 5, "HardwareFault")]
    #[case(ScanError::State("cannot run while READY".into()), 6, "State")]
    fn typed_errors_map_to_codes(#[case] e: ScanError, #[case] code: i32, #[case] reason: &str) {
        let report = eyre::Report::new(e);
        assert_eq!(exit_code_for_error(&report), code);
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&report)).unwrap();
        assert_eq!(v["reason"], reason);
        assert!(v["message"].as_str().unwrap().starts_with("What happened"));
    }

    #[test]
    fn wrapped_typed_error_is_still_found() {
        let report = eyre::Report::new(ScanError::Config("axis z is not in the motion controller layout".into()))
            .wrap_err("configure");
        assert_eq!(exit_code_for_error(&report), 2);
        assert!(humanize(&report).contains("axis z"));
    }

    #[test]
    fn untyped_errors_fall_back() {
        let report = eyre::eyre!("parse config TOML");
        assert_eq!(exit_code_for_error(&report), 1);
        assert!(humanize(&report).contains("not valid TOML"));
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&report)).unwrap();
        assert_eq!(v["reason"], "Error");
    }
}
