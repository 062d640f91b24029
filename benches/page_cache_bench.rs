// Page cache hit/miss path benchmarks (spec §4.1).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tempfile::TempDir;
use tinydb::buffer::page_cache::PageCache;
use tinydb::storage::disk::DiskManager;
use tinydb::storage::page::PageType;

fn fresh_cache(capacity: usize) -> (Arc<PageCache>, TempDir) {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(DiskManager::open(dir.path().join("bench.db"), 8192).unwrap());
    (PageCache::new(disk, capacity), dir)
}

fn bench_new_page_allocation(c: &mut Criterion) {
    c.bench_function("page_cache_new_page", |b| {
        let (cache, _dir) = fresh_cache(4096);
        b.iter(|| {
            let guard = cache.new_page(PageType::CollectionData).unwrap();
            black_box(guard.page_id());
        });
    });
}

fn bench_fetch_hit_vs_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_cache_fetch");

    for capacity in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("warm_fetch", capacity), &capacity, |b, &capacity| {
            let (cache, _dir) = fresh_cache(capacity);
            let mut ids = Vec::new();
            for _ in 0..capacity.min(64) {
                let guard = cache.new_page(PageType::CollectionData).unwrap();
                ids.push(guard.page_id());
            }
            let mut i = 0usize;
            b.iter(|| {
                let id = ids[i % ids.len()];
                i += 1;
                let guard = cache.fetch(black_box(id)).unwrap();
                black_box(guard.page_id());
            });
        });
    }

    group.finish();
}

fn bench_eviction_under_pressure(c: &mut Criterion) {
    c.bench_function("page_cache_eviction_pressure", |b| {
        let (cache, _dir) = fresh_cache(32);
        b.iter(|| {
            for _ in 0..64 {
                let guard = cache.new_page(PageType::CollectionData).unwrap();
                black_box(guard.page_id());
            }
        });
    });
}

criterion_group!(benches, bench_new_page_allocation, bench_fetch_hit_vs_miss, bench_eviction_under_pressure);
criterion_main!(benches);
