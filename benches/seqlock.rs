//! Store/load latency benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use seqlock_shm::{MultiWriterRegion, SharedMemory, SingleWriterRegion, SpinLock};
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const SIZE: usize = 4096;

fn bench_region_store(c: &mut Criterion) {
    let single = SingleWriterRegion::<SIZE>::new();
    let multi = MultiWriterRegion::<SIZE>::new();
    let data = vec![0xAAu8; SIZE];

    let mut group = c.benchmark_group("region_store");
    for len in [64usize, 1024, SIZE] {
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::new("single_writer", len), &len, |b, &len| {
            b.iter(|| black_box(single.store(&data[..len])));
        });
        group.bench_with_input(BenchmarkId::new("multi_writer", len), &len, |b, &len| {
            b.iter(|| black_box(multi.store(&data[..len])));
        });
    }
    group.finish();
}

fn bench_region_load(c: &mut Criterion) {
    let region = SingleWriterRegion::<SIZE>::new();
    region.set(0xAA);
    let mut buf = vec![0u8; SIZE];

    let mut group = c.benchmark_group("region_load");
    for len in [64usize, 1024, SIZE] {
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter(|| black_box(region.load(&mut buf[..len])));
        });
    }
    group.finish();
}

fn bench_load_under_writer(c: &mut Criterion) {
    let region = Arc::new(SingleWriterRegion::<SIZE>::new());
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let region = Arc::clone(&region);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut i = 0u8;
            while !stop.load(Ordering::Relaxed) {
                region.set(i);
                i = i.wrapping_add(1);
            }
        })
    };

    let mut buf = vec![0u8; SIZE];
    c.bench_function("load_4k_with_busy_writer", |b| {
        b.iter(|| black_box(region.load(&mut buf)));
    });

    stop.store(true, Ordering::Relaxed);
    let _ = writer.join();
}

fn bench_shared_region(c: &mut Criterion) {
    let name = format!("/seqlock_shm_bench_{}", std::process::id());
    let region = match SharedMemory::open(&name, 0, SingleWriterRegion::<SIZE>::new) {
        Ok(opened) => opened.into_inner(),
        Err(err) => {
            eprintln!("skipping shared memory bench: {err}");
            return;
        }
    };
    let data = vec![0x55u8; SIZE];
    let mut buf = vec![0u8; SIZE];

    c.bench_function("shm_store_load_4k", |b| {
        b.iter(|| {
            region.store(&data);
            black_box(region.load(&mut buf))
        });
    });
}

fn bench_spinlock(c: &mut Criterion) {
    let lock = SpinLock::new();
    c.bench_function("spinlock_uncontended", |b| {
        b.iter(|| lock.with(|| black_box(1u64)));
    });
}

criterion_group!(
    benches,
    bench_region_store,
    bench_region_load,
    bench_load_under_writer,
    bench_shared_region,
    bench_spinlock
);
criterion_main!(benches);
