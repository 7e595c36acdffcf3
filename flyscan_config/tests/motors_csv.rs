use std::fs::File;
use std::io::Write;

use flyscan_config::load_motors_csv;
use rstest::rstest;
use tempfile::tempdir;

#[rstest]
fn loads_motor_table() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("motors.csv");
    let mut f = File::create(&path).unwrap();
    writeln!(f, "name,cs,max_velocity,acceleration_time,resolution,units,encoder").unwrap();
    writeln!(f, "x,\"CS1,A\",1.0,0.4,0.001,mm,A").unwrap();
    writeln!(f, "y,\"CS1,B\",2.0,0.2,0.0005,mm,").unwrap();
    drop(f);

    let motors = load_motors_csv(&path).unwrap();
    assert_eq!(motors.len(), 2);
    assert_eq!(motors[0].cs_parts(), Some(("CS1", 'A')));
    assert_eq!(motors[0].encoder.as_deref(), Some("A"));
    assert_eq!(motors[1].encoder, None);
    assert!((motors[1].encoder_scale() - 0.0005).abs() < 1e-12);
}

#[rstest]
fn rejects_wrong_headers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("motors.csv");
    std::fs::write(&path, "name,cs,vmax\nx,\"CS1,A\",1.0\n").unwrap();
    let err = load_motors_csv(&path).unwrap_err();
    assert!(format!("{err}").contains("motor CSV must have headers"));
}

#[rstest]
fn reports_bad_row_number() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("motors.csv");
    std::fs::write(
        &path,
        "name,cs,max_velocity,acceleration_time,resolution,units,encoder\nx,\"CS1,A\",fast,0.4,0.001,mm,A\n",
    )
    .unwrap();
    let err = load_motors_csv(&path).unwrap_err();
    assert!(format!("{err}").contains("invalid CSV row 2"));
}

#[rstest]
fn missing_file_is_an_error() {
    let dir = tempdir().unwrap();
    assert!(load_motors_csv(&dir.path().join("nope.csv")).is_err());
}
