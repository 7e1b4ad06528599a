//! Benchmarks for the completion engine and handle tables

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use osport::runtime::completion::Descriptor;
use osport::runtime::overlapped::complete_overlapped;
use osport::runtime::OverlappedRequest;
use osport::{Delivery, HandleKind, HandleTable, IoBuffer, Runtime};
use std::time::Duration;

fn noop(_: &Runtime, count: u32, _: Descriptor, _: u32) -> Delivery {
    black_box(count);
    Delivery::none()
}

/// Benchmark post followed by fetch and dispatch
fn bench_post_dispatch(c: &mut Criterion) {
    let rt = Runtime::new();
    let mut group = c.benchmark_group("completion");

    for &batch in &[1u32, 16, 256] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_function(format!("post_dispatch_{}", batch), |b| {
            b.iter(|| {
                for i in 0..batch {
                    rt.engine().post(i, noop, Descriptor(i as usize));
                }
                for _ in 0..batch {
                    if let Some(delivery) = rt.get_completion(Duration::ZERO) {
                        delivery.deliver();
                    }
                }
            })
        });
    }

    group.finish();
}

/// Benchmark arming and completing an overlapped request
fn bench_overlapped_roundtrip(c: &mut Criterion) {
    let rt = Runtime::new();
    let buffer = IoBuffer::new(4096);

    c.bench_function("overlapped_roundtrip", |b| {
        b.iter(|| {
            let descriptor = OverlappedRequest::new(buffer.clone(), Box::new(|r| {
                black_box(r);
            }))
            .arm(rt.engine());
            rt.engine().post(4096, complete_overlapped, descriptor);
            rt.run_once(Duration::ZERO)
        })
    });
}

/// Benchmark handle allocation churn
fn bench_handle_table(c: &mut Criterion) {
    let table = HandleTable::new(HandleKind::PORT);
    let resident: Vec<_> = (0..1024).map(|i| table.allocate(i)).collect();
    black_box(&resident);

    c.bench_function("handle_allocate_deallocate", |b| {
        b.iter(|| {
            let handle = table.allocate(black_box(7));
            black_box(table.lookup(handle));
            table.deallocate(handle)
        })
    });
}

criterion_group!(
    benches,
    bench_post_dispatch,
    bench_overlapped_roundtrip,
    bench_handle_table,
);
criterion_main!(benches);
