// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::items_after_statements)] // Test helpers

//! Structural invariants of the cache: counter consistency, bounded
//! reference counts, sequence monotonicity, instance teardown hygiene.

use std::sync::Arc;

use xdds_cache::{
    CacheOptions, ChangeKind, GetSpec, History, HistoryCache, InstanceHandle, Payload, Sample,
    Timestamp,
};

fn writer() -> Arc<HistoryCache> {
    HistoryCache::new(
        CacheOptions::writer(true)
            .key_size(4)
            .transient_local()
            .history(History::KeepLast(8)),
    )
    .expect("cache")
}

fn write(cache: &Arc<HistoryCache>, key: &[u8], sec: u32) -> InstanceHandle {
    let (hci, handle) = cache.register(key, Timestamp::new(sec, 0)).expect("register");
    let mut s = Sample::new(
        ChangeKind::Alive,
        1,
        Timestamp::new(sec, 0),
        Payload::from_slice(&[sec as u8]),
    )
    .expect("sample");
    s.handle = handle;
    cache.add_inst(s, Some(hci), false).expect("add");
    handle
}

/// Invariant 1: cache-wide counters equal the sum over instances.
#[test]
fn counters_sum_over_instances() {
    let cache = writer();
    let keys: [&[u8]; 3] = [b"k1  ", b"k2  ", b"k3  "];
    let mut handles = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        for rep in 0..=i as u32 {
            handles.push(write(&cache, key, 10 * (i as u32 + 1) + rep));
        }
    }
    handles.dedup();

    let stats = cache.stats();
    let mut nchanges = 0;
    let mut ndata = 0;
    for h in &handles {
        let info = cache.instance_info(*h).expect("info");
        nchanges += info.nchanges;
        ndata += info.ndata;
    }
    assert_eq!(stats.nchanges, nchanges);
    assert_eq!(stats.ndata, ndata);
    assert_eq!(stats.ninstances, handles.len() as u32);

    #[cfg(feature = "cache-check")]
    cache.cache_check();
}

/// Invariant 2: a stored sample holds one cache reference plus one per
/// outstanding `get` result.
#[test]
fn refcount_tracks_cache_and_readers() {
    let cache = writer();
    write(&cache, b"k1  ", 1);

    let first = cache.get(16, &GetSpec::any()).expect("get");
    assert_eq!(first.len(), 1);
    // Cache reference + this result.
    assert_eq!(Arc::strong_count(&first[0]), 2);

    let second = cache.get(16, &GetSpec::any()).expect("get");
    assert_eq!(Arc::strong_count(&first[0]), 3);
    cache.done(second);
    assert_eq!(Arc::strong_count(&first[0]), 2);

    // Taking unlinks the cache reference; only the user's remains.
    let taken = cache.get(16, &GetSpec::take()).expect("take");
    assert_eq!(taken.len(), 1);
    assert_eq!(Arc::strong_count(&first[0]), 2); // first + taken alias
    drop(taken);
    assert_eq!(Arc::strong_count(&first[0]), 1);
    cache.done(first);
}

/// Invariant 3: sequence numbers are strictly increasing with no gaps
/// within one add sequence, across instances.
#[test]
fn seqnrs_are_gapless_per_cache() {
    let cache = writer();
    for sec in 1..=9u32 {
        let key = [b'k', b'0' + (sec % 3) as u8, b' ', b' '];
        write(&cache, &key, sec);
    }
    let samples = cache.get(32, &GetSpec::any()).expect("get");
    let mut seqs: Vec<u64> = samples.iter().map(|s| s.seqnr.as_u64()).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=9).collect::<Vec<u64>>());
    cache.done(samples);
}

/// Invariant 5: a freed instance leaves no trace in the index or the
/// cache-wide list.
#[test]
fn freed_instance_leaves_no_references() {
    let cache = writer();
    let h1 = write(&cache, b"k1  ", 1);
    let h2 = write(&cache, b"k2  ", 2);

    cache.inst_free(h1);
    assert!(cache.instance_info(h1).is_none());
    assert_eq!(cache.stats().ninstances, 1);
    assert_eq!(cache.stats().nchanges, 1);

    let remaining = cache.get(16, &GetSpec::any()).expect("get");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].handle, h2);
    cache.done(remaining);

    #[cfg(feature = "cache-check")]
    cache.cache_check();
}

/// Handles of freed instances are not resurrected by later registers
/// (until the counter wraps).
#[test]
fn freed_handles_are_not_reused() {
    let cache = writer();
    let h1 = write(&cache, b"k1  ", 1);
    cache.inst_free(h1);
    let h2 = write(&cache, b"k2  ", 2);
    assert_ne!(h1, h2);
}

/// Samples returned by `get` keep their payload after a destructive take
/// and cache teardown (shared ownership outlives the cache).
#[test]
fn taken_samples_outlive_the_cache() {
    let cache = writer();
    write(&cache, b"k1  ", 1);
    let taken = cache.get(16, &GetSpec::take()).expect("take");
    cache.close();
    assert_eq!(taken[0].payload.as_slice(), Some(&[1u8][..]));
}
