use std::collections::BTreeMap;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use flyscan_core::config::{PlannerCfg, RowTrigger};
use flyscan_core::motor::{AxisMapping, MotorInfo};
use flyscan_core::profile::TriggerMode;
use flyscan_core::seq_builder::{PositionCapture, SeqRowGenerator};
use flyscan_core::trajectory::TrajectoryPlanner;
use flyscan_core::velocity::{Limits, VelocityProfile};
use flyscan_core::{CompoundGenerator, LineGenerator};
use flyscan_traits::MotorRecord;

fn grid(rows: usize, cols: usize) -> CompoundGenerator {
    CompoundGenerator::new(
        vec![
            LineGenerator::new("y", "mm", 0.0, 1.0, rows, false).into(),
            LineGenerator::new("x", "mm", 0.0, 5.0, cols, true).into(),
        ],
        0.01,
    )
}

fn motors() -> AxisMapping {
    let rec = |cs: &str| MotorRecord {
        cs: cs.to_string(),
        max_velocity: 5.0,
        acceleration_time: 0.1,
        ..MotorRecord::default()
    };
    let mut m = AxisMapping::new();
    for (name, cs) in [("x", "CS1,A"), ("y", "CS1,B")] {
        if let Ok(info) = MotorInfo::from_record(name, name, &rec(cs)) {
            m.insert(name.to_string(), info);
        }
    }
    m
}

pub fn bench_velocity(c: &mut Criterion) {
    let limits = Limits {
        acceleration: 50.0,
        max_velocity: 5.0,
        settle: 0.0,
        min_interval: 0.002,
    };
    c.bench_function("velocity_solve_quantized", |b| {
        b.iter(|| {
            let mut p = VelocityProfile::solve(black_box(2.5), black_box(-2.5), black_box(0.01), 0.0, limits);
            p.quantize();
            black_box(p.t_total())
        });
    });
}

pub fn bench_plan(c: &mut Criterion) {
    c.bench_function("plan_snake_100x100", |b| {
        b.iter(|| {
            let mut planner = TrajectoryPlanner::new(PlannerCfg::default(), grid(100, 100), motors(), TriggerMode::EveryPoint);
            planner.start(0, 10_000);
            let mut samples = 0;
            while !planner.all_written() {
                if planner.emit().is_err() {
                    break;
                }
                samples += planner.take_chunk().map_or(0, |c| c.len());
            }
            black_box(samples)
        });
    });
}

pub fn bench_seq_rows(c: &mut Criterion) {
    let captures = BTreeMap::from([(
        "x".to_string(),
        PositionCapture {
            bus: 'A',
            scale: 0.001,
            offset: 0.0,
        },
    )]);
    c.bench_function("seq_rows_snake_100x100", |b| {
        b.iter(|| {
            let rows = SeqRowGenerator::new(
                grid(100, 100),
                motors(),
                captures.clone(),
                RowTrigger::PositionCompare,
                4096,
                4096,
                0,
                10_000,
            )
            .map_or(0, |g| g.map(|r| r.map_or(0, |r| r.len())).sum::<usize>());
            black_box(rows)
        });
    });
}

criterion_group!(benches, bench_velocity, bench_plan, bench_seq_rows);
criterion_main!(benches);
