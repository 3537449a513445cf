//! Receive ring throughput benchmarks

use cell_common::can::CanFrame;
use cell_hal::bus::ring::RxRing;
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn frame(i: u32) -> CanFrame {
    CanFrame::new(0xD0 + (i % 16), &[i as u8, 0, 0, 0]).unwrap()
}

/// Push and pop while the ring stays below capacity
fn bench_push_pop(c: &mut Criterion) {
    let frames: Vec<CanFrame> = (0..32).map(frame).collect();
    c.bench_function("rx_ring_push_pop_32", |b| {
        let mut ring: RxRing = RxRing::new();
        b.iter(|| {
            for f in &frames {
                black_box(ring.push(f.clone()));
            }
            while let Some(f) = ring.pop() {
                black_box(f);
            }
        });
    });
}

/// Sustained overflow with drop-oldest
fn bench_overflow(c: &mut Criterion) {
    let frames: Vec<CanFrame> = (0..256).map(frame).collect();
    c.bench_function("rx_ring_overflow_256", |b| {
        let mut ring: RxRing = RxRing::new();
        b.iter(|| {
            for f in &frames {
                black_box(ring.push(f.clone()));
            }
            ring.clear();
        });
    });
}

criterion_group!(benches, bench_push_pop, bench_overflow);
criterion_main!(benches);
