//! Benchmarks for the per-tick hot paths

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use gate_core::{CalibratedGate, ControllerConfig, SensorConfig, Timestamp};
use gate_runtime::{ControllerInput, GateController};
use gate_sensor::{SampleFilter, ScriptedSource};
use gate_wire::{LineBuffer, Message};

fn bench_median_of(c: &mut Criterion) {
    let filter = SampleFilter::new(&SensorConfig::default());
    let burst = [101.2, -1.0, 99.8, 100.4, 500.0];

    c.bench_function("median_of_burst", |b| {
        b.iter(|| {
            let mut samples = burst;
            black_box(filter.median_of(black_box(&mut samples)))
        })
    });
}

fn bench_filter_burst(c: &mut Criterion) {
    let mut config = SensorConfig::default();
    config.inter_sample_delay = std::time::Duration::ZERO;
    let filter = SampleFilter::new(&config);
    let mut source = ScriptedSource::constant(87.5);

    c.bench_function("filter_burst", |b| {
        b.iter(|| black_box(filter.filter(&mut source)))
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let lines = ["START_TIMER", "STOP_TIMER:733", "HEARTBEAT_ACK", "GARBAGE"];

    c.bench_function("message_decode", |b| {
        b.iter(|| {
            for line in &lines {
                let _ = black_box(Message::decode(black_box(line)));
            }
        })
    });
}

fn bench_message_encode(c: &mut Criterion) {
    let message = Message::StopTimer { elapsed_ms: 12_345 };

    c.bench_function("message_encode", |b| {
        b.iter(|| black_box(black_box(&message).encode()))
    });
}

fn bench_line_buffer(c: &mut Criterion) {
    let stream = b"HEARTBEAT\nCLIENT_READY\nSTOP_TIMER:733\nHEARTBEAT_ACK\n";

    c.bench_function("line_buffer_reassembly", |b| {
        b.iter(|| {
            let mut buffer = LineBuffer::new();
            for chunk in stream.chunks(7) {
                buffer.extend(chunk);
            }
            let mut count = 0;
            while let Ok(Some(line)) = buffer.next_line() {
                black_box(line);
                count += 1;
            }
            black_box(count)
        })
    });
}

fn bench_controller_idle_step(c: &mut Criterion) {
    let mut controller = GateController::new(ControllerConfig::default(), CalibratedGate::new(100.0));

    c.bench_function("controller_idle_step", |b| {
        let mut t = 0u64;
        b.iter(|| {
            t += 20;
            let input = ControllerInput {
                peer_connected: true,
                ..ControllerInput::at(Timestamp::from_millis(t), Some(100.0))
            };
            black_box(controller.step(input))
        })
    });
}

criterion_group!(
    benches,
    bench_median_of,
    bench_filter_burst,
    bench_message_decode,
    bench_message_encode,
    bench_line_buffer,
    bench_controller_idle_step,
);
criterion_main!(benches);
