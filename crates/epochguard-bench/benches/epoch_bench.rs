//! Epoch engine benchmarks: commit, canary verification, quarantine churn.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use epochguard_core::bitmap::CorruptionBitmap;
use epochguard_core::{
    CallSite, Engine, EngineConfig, HeapAllocator, MemoryRegion, PAGE_SIZE, Step, TracingDiagnostics,
    WORD_SIZE, WriteTracking, step_fn,
};

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    let region = MemoryRegion::initialize("bench", 256 * PAGE_SIZE, WriteTracking::Explicit)
        .expect("region");

    for &pages in &[1usize, 16, 128] {
        group.bench_with_input(BenchmarkId::new("dirty_pages", pages), &pages, |b, &n| {
            let mut value = 0u64;
            b.iter(|| {
                for page in 0..n {
                    value = value.wrapping_add(1);
                    let addr = region.start() + page * PAGE_SIZE + (page % 8) * WORD_SIZE;
                    region.write_word(addr, value, Some(0)).expect("in range");
                }
                let stats = region.check_and_commit();
                region.begin_epoch().expect("begin");
                criterion::black_box(stats);
            });
        });
    }

    group.bench_function("rollback_16_pages", |b| {
        b.iter(|| {
            for page in 0..16 {
                region
                    .fill(region.start() + page * PAGE_SIZE, 256, 0xAB, None)
                    .expect("in range");
            }
            criterion::black_box(region.rollback().expect("rollback"));
        });
    });
    group.finish();
}

fn bench_canary_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("canary_scan");

    for &objects in &[64usize, 1024] {
        let region = Arc::new(
            MemoryRegion::initialize("heap", 16 << 20, WriteTracking::Explicit).expect("region"),
        );
        let bitmap = Arc::new(CorruptionBitmap::for_region(&region));
        let heap = HeapAllocator::new(Arc::clone(&region), bitmap, 1);
        for i in 0..objects {
            heap.malloc(0, 24 + (i % 5) * 40, CallSite::caller())
                .expect("heap has room");
        }
        group.bench_with_input(BenchmarkId::new("check_all", objects), &heap, |b, heap| {
            b.iter(|| criterion::black_box(heap.check_all()));
        });
    }
    group.finish();
}

fn bench_quarantine_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("quarantine_churn");
    group.sample_size(20);

    for &entries in &[16usize, 1023] {
        group.bench_with_input(BenchmarkId::new("entries", entries), &entries, |b, &n| {
            b.iter(|| {
                let config = EngineConfig::new()
                    .with_heap_bytes(8 << 20)
                    .with_globals_bytes(4096)
                    .with_quarantine(n, 4 << 20);
                let engine =
                    Engine::initialize(config, Arc::new(TracingDiagnostics)).expect("engine");
                let summary = engine
                    .run(step_fn(|cx| {
                        for i in 0..2_000 {
                            let p = cx.malloc(32 + (i % 4) * 16)?;
                            cx.free(p)?;
                        }
                        Ok(Step::Exit(0))
                    }))
                    .expect("clean run");
                criterion::black_box(summary.metrics.quarantine_evictions);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_commit, bench_canary_scan, bench_quarantine_churn);
criterion_main!(benches);
