// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hot-path benchmarks: writer-side add and reader-side get/take.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use xdds_cache::{
    CacheOptions, ChangeKind, GetSpec, History, HistoryCache, Payload, Sample, Timestamp,
};

fn writer_cache(depth: u32) -> Arc<HistoryCache> {
    HistoryCache::new(
        CacheOptions::writer(true)
            .key_size(8)
            .transient_local()
            .history(History::KeepLast(depth)),
    )
    .expect("cache")
}

fn bench_add(c: &mut Criterion) {
    let cache = writer_cache(16);
    let (hci, handle) = cache.register(b"bench-k1", Timestamp::now()).expect("register");
    let payload = vec![0u8; 256];
    let mut sec = 0u32;

    c.bench_function("add_keep_last_16", |b| {
        b.iter(|| {
            sec = sec.wrapping_add(1);
            let mut s = Sample::new(
                ChangeKind::Alive,
                1,
                Timestamp::new(sec, 0),
                Payload::from_slice(&payload),
            )
            .expect("sample");
            s.handle = handle;
            cache.add_inst(s, Some(hci), false).expect("add");
        });
    });
}

fn bench_take(c: &mut Criterion) {
    let cache = writer_cache(64);
    let (hci, handle) = cache.register(b"bench-k2", Timestamp::now()).expect("register");
    let mut sec = 0u32;

    c.bench_function("add_then_take", |b| {
        b.iter(|| {
            sec = sec.wrapping_add(1);
            let mut s = Sample::new(
                ChangeKind::Alive,
                1,
                Timestamp::new(sec, 0),
                Payload::from_slice(&[1, 2, 3, 4]),
            )
            .expect("sample");
            s.handle = handle;
            cache.add_inst(s, Some(hci), false).expect("add");
            let taken = cache.get(1, &GetSpec::take()).expect("take");
            cache.done(taken);
        });
    });
}

criterion_group!(benches, bench_add, bench_take);
criterion_main!(benches);
