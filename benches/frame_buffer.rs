//! Frame buffer throughput benchmarks
//!
//! Run with: cargo bench --bench frame_buffer
//!
//! Measures the producer-side cost of both admission policies and the
//! steady-state hand-off to a single consumer.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crabrig::buffer::{AdmissionPolicy, FrameBuffer};
use crabrig::testing::synthetic_payload;
use crabrig::types::FrameRecord;
use std::time::Duration;

fn frames(count: u64, len: usize) -> Vec<FrameRecord> {
    (0..count)
        .map(|n| {
            FrameRecord::new(
                synthetic_payload(n, 1920, len),
                n,
                Duration::from_micros(n * 33_333),
                Some(n * 33_333_000),
            )
        })
        .collect()
}

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("Buffer Admission");
    let batch = frames(1024, 64 * 1024);
    group.throughput(Throughput::Elements(batch.len() as u64));

    for capacity in [4usize, 8, 64] {
        for policy in [AdmissionPolicy::Overwrite, AdmissionPolicy::Reject] {
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", policy), capacity),
                &capacity,
                |b, &capacity| {
                    b.iter(|| {
                        let buffer = FrameBuffer::new(capacity);
                        for frame in &batch {
                            black_box(buffer.offer(frame.clone(), policy));
                        }
                        black_box(buffer.stats())
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("Buffer Hand-off");
    let batch = frames(256, 64 * 1024);
    group.throughput(Throughput::Elements(batch.len() as u64));

    group.bench_function("put_then_recv", |b| {
        let buffer = FrameBuffer::new(FrameBuffer::DEFAULT_CAPACITY);
        b.iter(|| {
            for frame in &batch {
                buffer.put_overwrite(frame.clone());
                black_box(buffer.try_recv());
            }
        })
    });

    group.bench_function("burst_then_drain", |b| {
        let buffer = FrameBuffer::new(FrameBuffer::DEFAULT_CAPACITY);
        b.iter(|| {
            for frame in &batch {
                buffer.put_overwrite(frame.clone());
            }
            black_box(buffer.drain().len())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_admission, bench_handoff);
criterion_main!(benches);
