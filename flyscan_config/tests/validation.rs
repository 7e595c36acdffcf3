use flyscan_config::load_toml;
use rstest::rstest;

const MOTORS: &str = r#"
[[motors]]
name = "x"
cs = "CS1,A"
max_velocity = 1.0
acceleration_time = 0.4
encoder = "A"

[[motors]]
name = "y"
cs = "CS1,B"
max_velocity = 1.0
acceleration_time = 0.4
"#;

fn err_of(toml: &str) -> String {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should be rejected");
    format!("{err}").to_lowercase()
}

#[test]
fn accepts_full_config() {
    let toml = format!(
        r#"
[planner]
profile_points = 5000
min_interval_s = 0.002

[sequencer]
row_trigger = "motion_controller"

[controller]
mri = "BL45P:SCAN"
default_timeout_ms = 2000

[logging]
level = "debug"
rotation = "daily"

[simulator]
time_scale = 10.0

{MOTORS}

[scan]
duration = 0.5
axes_to_move = ["x", "y"]

[[scan.lines]]
axis = "y"
start = 0.0
stop = 1.0
size = 3

[[scan.lines]]
axis = "x"
start = 0.0
stop = 2.0
size = 5
alternate = true
"#
    );
    let cfg = load_toml(&toml).expect("parse TOML");
    cfg.validate().expect("valid");
    assert_eq!(cfg.motors.len(), 2);
    assert_eq!(cfg.motors[0].encoder.as_deref(), Some("A"));
    assert!((cfg.motors[0].resolution - 0.001).abs() < 1e-12);
    let scan = cfg.scan.expect("scan section");
    assert_eq!(scan.lines[1].axis, "x");
    assert!(scan.lines[1].alternate);
    assert_eq!(scan.axes_to_move(), vec!["x", "y"]);
}

#[test]
fn rejects_duplicate_cs_axis() {
    let toml = r#"
[[motors]]
name = "x"
cs = "CS1,A"
max_velocity = 1.0
acceleration_time = 0.4

[[motors]]
name = "x2"
cs = "CS1,a"
max_velocity = 1.0
acceleration_time = 0.4
"#;
    assert!(err_of(toml).contains("already assigned"));
}

#[test]
fn rejects_unknown_row_trigger() {
    assert!(err_of("[sequencer]\nrow_trigger = \"gate\"\n").contains("row_trigger"));
}

#[rstest]
#[case("max_velocity = 0.0\nacceleration_time = 0.4", "max_velocity must be > 0")]
#[case("max_velocity = 1.0\nacceleration_time = -1.0", "acceleration_time must be > 0")]
#[case("max_velocity = 1.0\nacceleration_time = 0.4\nresolution = 0.0", "resolution must be non-zero")]
#[case("max_velocity = 1.0\nacceleration_time = 0.4\nencoder = \"D\"", "encoder must be a, b or c")]
#[case("max_velocity = 1.0\nacceleration_time = 0.4\nlow_limit = 2.0\nhigh_limit = 1.0", "low_limit is above high_limit")]
fn rejects_bad_kinematics(#[case] body: &str, #[case] expected: &str) {
    let toml = format!("[[motors]]\nname = \"x\"\ncs = \"CS1,A\"\n{body}\n");
    let msg = err_of(&toml);
    assert!(msg.contains(expected), "{msg}");
}

#[rstest]
#[case("duration = -1.0\nstatic_points = 3", "duration must be >= 0")]
#[case("duration = 0.0\nstatic_points = 3", "unless scan.exposure")]
#[case("duration = 0.1", "at least one line")]
#[case("duration = 0.1\nstatic_points = 4\nbreakpoints = [2, 0]", "breakpoints")]
fn rejects_bad_scans(#[case] body: &str, #[case] expected: &str) {
    let toml = format!("[scan]\n{body}\n");
    let msg = err_of(&toml);
    assert!(msg.contains(expected), "{msg}");
}

#[test]
fn variable_duration_with_exposure_is_accepted() {
    let cfg = load_toml("[scan]\nduration = 0.0\nexposure = 0.1\nstatic_points = 5\n").expect("parse");
    cfg.validate().expect("valid");
}

#[test]
fn rejects_bad_rotation() {
    assert!(err_of("[logging]\nrotation = \"weekly\"\n").contains("rotation"));
}
