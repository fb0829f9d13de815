//! Translation cache benchmarks
//!
//! Lookup and publish cost with a populated cache.

use std::hint::black_box;
use std::sync::Arc;

use armada_jit::{TranslationCache, marshal_thunk};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn populated(entries: u64) -> TranslationCache {
    let cache = TranslationCache::new();
    for i in 0..entries {
        let address = 0x1_0000 + i * 4;
        let thunk = marshal_thunk(address, format!("host{i}"), || ()).unwrap();
        cache.publish(address, Arc::new(thunk), 1);
    }
    cache
}

fn bench_try_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_try_get");
    for entries in [64u64, 4096] {
        let cache = populated(entries);
        group.bench_with_input(BenchmarkId::from_parameter(entries), &entries, |b, &entries| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 7) % entries;
                black_box(cache.try_get(0x1_0000 + i * 4))
            });
        });
    }
    group.finish();
}

fn bench_publish_replace(c: &mut Criterion) {
    let cache = populated(1024);
    let thunk = Arc::new(marshal_thunk(0x1_0000, "replacement", || ()).unwrap());
    c.bench_function("cache_publish_replace", |b| {
        b.iter(|| black_box(cache.publish(0x1_0000, Arc::clone(&thunk), 1)));
    });
}

criterion_group!(benches, bench_try_get, bench_publish_replace);
criterion_main!(benches);
