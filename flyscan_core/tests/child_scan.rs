//! A parent controller driving a child scan controller built on the simulators.

use std::sync::Arc;
use std::time::Duration;

use flyscan_core::config::{ControllerCfg, PlannerCfg, RowTrigger, SequencerCfg};
use flyscan_core::parts::{DETECTORS, DetectorPart, RunnableChildPart, SequencerPart, TrajectoryPart};
use flyscan_core::{CompoundGenerator, ConfigureParams, Controller, LineGenerator, RunOutcome, ScanState};
use flyscan_hardware::{SimDetector, SimMotionController, sim_sequencer_pair};
use flyscan_traits::clock::test_clock::TestClock;
use flyscan_traits::{Clock, MonotonicClock, MotorRecord};
use serde_json::json;

fn child(clock: Arc<dyn Clock + Send + Sync>) -> Controller {
    let rec = MotorRecord {
        cs: "CS1,A".into(),
        max_velocity: 2.0,
        ..MotorRecord::default()
    };
    let pmac = SimMotionController::new(Arc::clone(&clock), 1.0).with_motor("x", "BL:X", rec);
    let (a, b, gate) = sim_sequencer_pair(Arc::clone(&clock), 1.0);
    let cfg = SequencerCfg {
        row_trigger: RowTrigger::None,
        ..SequencerCfg::default()
    };
    Controller::new(
        ControllerCfg {
            mri: "BL:SCAN".into(),
            ..ControllerCfg::default()
        },
        vec![
            Box::new(TrajectoryPart::new("pmac", Box::new(pmac), PlannerCfg::default())),
            Box::new(SequencerPart::new("panda", Box::new(a), Box::new(b), Box::new(gate), cfg)),
            Box::new(DetectorPart::new("det", Box::new(SimDetector::new(clock, 1.0, 0.002, 50.0)))),
        ],
    )
}

fn parent(child: &Controller) -> Controller {
    Controller::new(
        ControllerCfg {
            mri: "BL:TOP".into(),
            ..ControllerCfg::default()
        },
        vec![Box::new(RunnableChildPart::new("scan", child.clone()))],
    )
}

fn line(points: usize, duration: f64) -> ConfigureParams {
    let g = CompoundGenerator::new(vec![LineGenerator::new("x", "mm", 0.0, 1.0, points, false).into()], duration);
    ConfigureParams::new(g, vec!["x".into()])
}

#[test]
fn parent_contract_carries_child_detectors() {
    let c = child(Arc::new(TestClock::new()));
    let p = parent(&c);
    let contract = p.contract();
    assert!(contract.params.contains_key(DETECTORS));
}

#[test]
fn parent_runs_child_to_completion() {
    let c = child(Arc::new(TestClock::new()));
    let p = parent(&c);
    let params = line(10, 0.1).with(DETECTORS, json!([{ "name": "det", "enable": true, "exposure": 0.5 }]));

    let validated = p.validate(params.clone()).unwrap();
    let exposure = validated.extra[DETECTORS][0]["exposure"].as_f64().unwrap();
    assert!(exposure < 0.1);

    p.configure(params).unwrap();
    assert_eq!(c.state(), ScanState::Armed);
    assert_eq!(p.run().unwrap(), RunOutcome::Finished);
    assert_eq!(c.state(), ScanState::Finished);
    assert_eq!(p.status().completed_steps, 10);

    p.reset().unwrap();
    assert_eq!(c.state(), ScanState::Ready);
}

#[test]
fn parent_abort_reaches_the_child() {
    let c = child(Arc::new(MonotonicClock::new()));
    let p = parent(&c);
    p.configure(line(100, 0.02)).unwrap();
    let runner = p.clone();
    let run = std::thread::spawn(move || runner.run());

    let statuses = c.subscribe();
    while let Ok(st) = statuses.recv_timeout(Duration::from_secs(10)) {
        if st.state == ScanState::Running {
            break;
        }
    }
    std::thread::sleep(Duration::from_millis(100));
    p.abort().unwrap();

    assert_eq!(run.join().unwrap().unwrap(), RunOutcome::Aborted);
    assert_eq!(p.state(), ScanState::Aborted);
    assert_eq!(c.state(), ScanState::Aborted);
}
