//! Per-packet path selection and feedback handling benchmarks.
//!
//! Measures:
//! - SchedulerLoop::select_path() with 2, 4 and 16 subflows
//! - AllocatorTree::build() at full depth
//! - SchedulerLoop::on_feedback() for a two-block report
//!
//! Run with: cargo bench --package mprtp-control

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quanta::Clock;

use mprtp_control::allocator::AllocatorTree;
use mprtp_control::config::ControlConfig;
use mprtp_control::{Packet, SchedulerLoop, SubflowId};
use mprtp_wire::report::{IntervalMetric, OneWayDelayBlock, ReceiverReportBlock};
use mprtp_wire::ReportBuilder;

fn scheduler(subflows: u16) -> SchedulerLoop {
    let (clock, _mock) = Clock::mock();
    let sched = SchedulerLoop::with_clock(ControlConfig::default(), clock);
    for id in 0..subflows {
        let target = 500_000 + u64::from(id) * 250_000;
        sched.add_subflow(id, target).unwrap();
    }
    sched
}

fn bench_select_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_path");
    group.throughput(Throughput::Elements(1));

    for subflows in [2u16, 4, 16] {
        let sched = scheduler(subflows);
        let now = sched.clock().now();
        let mut seq = 0u16;
        group.bench_function(format!("{subflows}_subflows"), |b| {
            b.iter(|| {
                seq = seq.wrapping_add(1);
                let packet = Packet {
                    sequence: seq,
                    payload_size: 1200,
                    is_keyframe: seq % 64 == 0,
                };
                black_box(sched.select_path(&packet, now));
            });
        });
    }
    group.finish();
}

fn bench_tree_build(c: &mut Criterion) {
    let targets: Vec<(SubflowId, u64)> = (0..8)
        .map(|id| (id, 300_000 + u64::from(id) * 77_777))
        .collect();
    c.bench_function("tree_build_depth7_8subflows", |b| {
        b.iter(|| black_box(AllocatorTree::build(black_box(&targets), 7)));
    });
}

fn bench_on_feedback(c: &mut Criterion) {
    let sched = scheduler(2);
    let mut builder = ReportBuilder::new(0x1111, 0x2222);
    let mut ext_seq = 0u32;

    c.bench_function("on_feedback_2_blocks", |b| {
        b.iter(|| {
            ext_seq = ext_seq.wrapping_add(50);
            for id in 0..2 {
                if id == 0 {
                    builder.begin(id);
                } else {
                    builder.next_block(id).unwrap();
                }
                builder
                    .add_rr(ReceiverReportBlock {
                        ssrc: 0x2222,
                        ext_highest_seq: ext_seq,
                        ..ReceiverReportBlock::default()
                    })
                    .unwrap();
                builder
                    .add_owd(OneWayDelayBlock {
                        interval_metric: IntervalMetric::Interval,
                        ssrc: 0x2222,
                        median_delay: 3000,
                        min_delay: 2800,
                        max_delay: 3300,
                    })
                    .unwrap();
            }
            let report = builder.end().unwrap();
            black_box(sched.on_feedback(&report).unwrap());
        });
    });
}

criterion_group!(benches, bench_select_path, bench_tree_build, bench_on_feedback);
criterion_main!(benches);
