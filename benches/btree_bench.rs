// B+tree bulk insert / lookup benchmarks (spec §4.3).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tempfile::TempDir;
use tinydb::buffer::page_cache::PageCache;
use tinydb::index::{BTree, IndexKey};
use tinydb::storage::disk::DiskManager;
use tinydb::value::Value;

fn fresh_tree() -> (BTree, TempDir) {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(DiskManager::open(dir.path().join("bench_idx.db"), 8192).unwrap());
    let cache = PageCache::new(disk, 2048);
    (BTree::create(cache).unwrap(), dir)
}

fn bench_bulk_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_bulk_insert");
    for count in [1_000i64, 10_000] {
        group.bench_with_input(BenchmarkId::new("insert", count), &count, |b, &count| {
            b.iter(|| {
                let (tree, _dir) = fresh_tree();
                for i in 0..count {
                    tree.insert(IndexKey::single(Value::I64(i)), Value::I64(i), None).unwrap();
                }
                black_box(tree.root_page_id());
            });
        });
    }
    group.finish();
}

fn bench_point_lookup(c: &mut Criterion) {
    c.bench_function("btree_point_lookup", |b| {
        let (tree, _dir) = fresh_tree();
        for i in 0..10_000i64 {
            tree.insert(IndexKey::single(Value::I64(i)), Value::I64(i), None).unwrap();
        }
        let mut i = 0i64;
        b.iter(|| {
            let key = IndexKey::single(Value::I64(i % 10_000));
            i += 1;
            black_box(tree.find_exact(&key).unwrap());
        });
    });
}

fn bench_range_scan(c: &mut Criterion) {
    c.bench_function("btree_range_scan", |b| {
        let (tree, _dir) = fresh_tree();
        for i in 0..10_000i64 {
            tree.insert(IndexKey::single(Value::I64(i)), Value::I64(i), None).unwrap();
        }
        b.iter(|| {
            let lo = IndexKey::single(Value::I64(1_000));
            let hi = IndexKey::single(Value::I64(1_500));
            let out = tree.range(Some(&lo), Some(&hi), true, true).unwrap();
            black_box(out.len());
        });
    });
}

criterion_group!(benches, bench_bulk_insert, bench_point_lookup, bench_range_scan);
criterion_main!(benches);
