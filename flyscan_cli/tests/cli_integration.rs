use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use tempfile::tempdir;

const MOTORS: &str = r#"
[[motors]]
name = "x"
cs = "CS1,A"
max_velocity = 2.0
acceleration_time = 0.1
low_limit = -5.0
high_limit = 5.0
encoder = "A"

[[motors]]
name = "y"
cs = "CS1,B"
max_velocity = 2.0
acceleration_time = 0.1
encoder = "B"
"#;

// Small snake scan, run ten times faster than real time
fn write_valid_config(dir: &tempfile::TempDir) -> PathBuf {
    let toml = format!(
        r#"
[simulator]
time_scale = 10.0

[sequencer]
row_trigger = "position_compare"

{MOTORS}

[scan]
duration = 0.05

[[scan.lines]]
axis = "y"
start = 0.0
stop = 0.2
size = 3

[[scan.lines]]
axis = "x"
start = 0.0
stop = 1.0
size = 5
alternate = true
"#
    );
    let path = dir.path().join("cfg.toml");
    fs::write(&path, toml).unwrap();
    path
}

#[rstest]
#[case(&["--help"], 0, "Usage:", "stdout")]
#[case(&["validate"], 0, "config ok: 15 steps", "stdout")]
#[case(&["self-check"], 0, "motor x", "stdout")]
#[case(&["plan", "--limit", "5"], 0, "5 samples", "stdout")]
#[case(&["scan"], 0, "scan complete: 15 of 15 steps", "stdout")]
#[case(&["scan", "--duration=-1"], 1, "Configuration is invalid", "stderr")]
#[case(&["scan", "--time-scale", "0"], 1, "time-scale", "stderr")]
#[case(&[], 2, "Usage", "stderr")]
fn cli_table_cases(
    #[case] args: &[&str],
    #[case] exit_code: i32,
    #[case] needle: &str,
    #[case] stream: &str,
) {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir);

    let mut cmd = Command::cargo_bin("flyscan_cli").unwrap();

    // Always include a valid config to avoid relying on default path
    cmd.arg("--config").arg(&cfg);
    for a in args {
        cmd.arg(a);
    }

    let assert = cmd.assert().code(exit_code);
    match stream {
        "stdout" => {
            assert.stdout(predicate::str::contains(needle));
        }
        "stderr" => {
            assert.stderr(predicate::str::contains(needle));
        }
        other => panic!("unknown stream: {other}"),
    }
}

#[rstest]
fn missing_config_file_is_explained() {
    let dir = tempdir().unwrap();
    let mut cmd = Command::cargo_bin("flyscan_cli").unwrap();
    cmd.arg("--config").arg(dir.path().join("nope.toml")).arg("validate");
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("config file could not be read"));
}

#[rstest]
fn unknown_row_trigger_is_rejected_before_scanning() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cfg.toml");
    fs::write(&path, format!("[sequencer]\nrow_trigger = \"gate\"\n{MOTORS}")).unwrap();

    let mut cmd = Command::cargo_bin("flyscan_cli").unwrap();
    cmd.arg("--config").arg(&path).arg("self-check");
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("row_trigger"));
}

#[rstest]
fn soft_limit_breach_exits_with_its_own_code() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cfg.toml");
    let toml = format!(
        r#"
[simulator]
time_scale = 10.0

[sequencer]
row_trigger = "none"

{MOTORS}

[scan]
duration = 2.0
axes_to_move = ["x"]

[[scan.lines]]
axis = "x"
start = 0.0
stop = 10.0
size = 5
"#
    );
    fs::write(&path, toml).unwrap();

    let mut cmd = Command::cargo_bin("flyscan_cli").unwrap();
    cmd.arg("--config").arg(&path).arg("scan");
    cmd.assert()
        .code(3)
        .stderr(predicate::str::contains("outside its soft limits"));
}

#[rstest]
fn cli_reports_bad_motor_csv_header() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir);

    // Write a bad-header CSV
    let bad_csv = dir.path().join("motors.csv");
    let mut f = fs::File::create(&bad_csv).unwrap();
    writeln!(f, "name,cs,velocity").unwrap();
    writeln!(f, "z,\"CS1,C\",1.0").unwrap();

    let mut cmd = Command::cargo_bin("flyscan_cli").unwrap();
    cmd.arg("--config")
        .arg(&cfg)
        .arg("--motors")
        .arg(&bad_csv)
        .arg("self-check");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid headers in motor CSV"));
}

#[rstest]
fn motor_csv_adds_motors() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir);

    let csv = dir.path().join("motors.csv");
    let mut f = fs::File::create(&csv).unwrap();
    writeln!(f, "name,cs,max_velocity,acceleration_time,resolution,units,encoder").unwrap();
    writeln!(f, "z,\"CS1,C\",1.0,0.4,0.001,mm,C").unwrap();

    let mut cmd = Command::cargo_bin("flyscan_cli").unwrap();
    cmd.arg("--config").arg(&cfg).arg("--motors").arg(&csv).arg("self-check");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("motor z"));
}
