use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use flyscan_hardware::error::HwError;
use flyscan_hardware::util::{scaled, wait_while_with_timeout};

#[test]
fn wait_returns_once_ready() {
    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let bg = Arc::clone(&pair);
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(3));
        *bg.0.lock().unwrap() = true;
        bg.1.notify_all();
    });

    let guard = pair.0.lock().unwrap();
    let res = wait_while_with_timeout(&pair.1, guard, |ready| *ready, Duration::from_secs(2), "flag");
    assert!(res.is_ok(), "expected success");
}

#[test]
fn wait_times_out_naming_what() {
    let pair = (Mutex::new(false), Condvar::new());
    let guard = pair.0.lock().unwrap();
    let err = wait_while_with_timeout(&pair.1, guard, |ready| *ready, Duration::from_millis(5), "flag")
        .expect_err("expected timeout error");
    match err {
        HwError::Timeout(what) => assert_eq!(what, "flag"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn scaled_time_divides_by_scale() {
    assert_eq!(scaled(2.0, 4.0), Duration::from_millis(500));
    assert_eq!(scaled(-1.0, 1.0), Duration::ZERO);
    assert_eq!(scaled(1.0, 0.0), Duration::ZERO);
}
