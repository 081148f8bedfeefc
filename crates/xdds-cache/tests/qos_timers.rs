// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::items_after_statements)] // Test helpers

//! Periodic QoS scans: deadline detection, lifespan expiry and the
//! autopurge policies, driven with explicit clocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use xdds_cache::{
    CacheOptions, ChangeKind, GuardKind, History, HistoryCache, InstanceHandle, Payload, Sample,
    StatusListener, Timestamp, MIN_XQOS_DELAY, NIL_HANDLE,
};

#[derive(Default)]
struct DeadlineCounter {
    offered: AtomicUsize,
    requested: AtomicUsize,
}

impl StatusListener for DeadlineCounter {
    fn on_offered_deadline_missed(&self, _handle: InstanceHandle) {
        self.offered.fetch_add(1, Ordering::Relaxed);
    }
    fn on_requested_deadline_missed(&self, _handle: InstanceHandle) {
        self.requested.fetch_add(1, Ordering::Relaxed);
    }
}

fn write(cache: &Arc<HistoryCache>, key: &[u8], time: Timestamp) -> InstanceHandle {
    let (hci, handle) = cache.register(key, time).expect("register");
    let mut s = Sample::new(ChangeKind::Alive, 1, time, Payload::from_slice(b"d"))
        .expect("sample");
    s.handle = handle;
    cache.add_inst(s, Some(hci), false).expect("add");
    handle
}

#[test]
fn deadline_fires_once_per_episode() {
    let listener = Arc::new(DeadlineCounter::default());
    let cache = HistoryCache::new({
        let mut o = CacheOptions::writer(true)
            .key_size(4)
            .transient_local()
            .listener(listener.clone() as Arc<dyn StatusListener>);
        o.deadline = true;
        o
    })
    .expect("cache");

    let t0 = Timestamp::new(100, 0);
    let handle = write(&cache, b"k1  ", t0);

    // Inside the period: still alive, reschedule at least the floor.
    let ticks = cache.handle_xqos(GuardKind::Deadline, NIL_HANDLE, 100, t0.add_duration(Duration::from_millis(300)));
    assert!(ticks >= MIN_XQOS_DELAY);
    assert_eq!(listener.offered.load(Ordering::Relaxed), 0);

    // Past the period: the instance deadlines and the listener fires.
    let late = t0.add_duration(Duration::from_millis(1500));
    let ticks = cache.handle_xqos(GuardKind::Deadline, NIL_HANDLE, 100, late);
    assert_eq!(ticks, 0, "single deadlined instance idles the scan");
    assert_eq!(listener.offered.load(Ordering::Relaxed), 1);

    // A deadlined instance is not reported again.
    let ticks = cache.handle_xqos(GuardKind::Deadline, NIL_HANDLE, 100, late);
    assert_eq!(ticks, 0);
    assert_eq!(listener.offered.load(Ordering::Relaxed), 1);

    // A fresh sample re-arms the deadline.
    write(&cache, b"k1  ", late);
    let ticks = cache.handle_xqos(
        GuardKind::Deadline,
        NIL_HANDLE,
        100,
        late.add_duration(Duration::from_millis(100)),
    );
    assert!(ticks >= MIN_XQOS_DELAY);
    let _ = handle;
}

#[test]
fn deadline_single_instance_cache() {
    let listener = Arc::new(DeadlineCounter::default());
    let cache = HistoryCache::new({
        let mut o = CacheOptions::reader(false)
            .listener(listener.clone() as Arc<dyn StatusListener>);
        o.deadline = true;
        o
    })
    .expect("cache");

    let t0 = Timestamp::new(200, 0);
    cache
        .add_inst(
            Sample::new(ChangeKind::Alive, 1, t0, Payload::from_slice(b"d")).expect("sample"),
            None,
            false,
        )
        .expect("add");

    let late = t0.add_duration(Duration::from_secs(2));
    let ticks = cache.handle_xqos(GuardKind::Deadline, NIL_HANDLE, 100, late);
    assert_eq!(ticks, 0);
    assert_eq!(listener.requested.load(Ordering::Relaxed), 1);
}

#[test]
fn lifespan_expires_samples_and_keeps_survivors() {
    let cache = HistoryCache::new({
        let mut o = CacheOptions::writer(true)
            .key_size(4)
            .transient_local()
            .history(History::KeepLast(8));
        o.lifespan = true;
        o
    })
    .expect("cache");

    let t0 = Timestamp::new(300, 0);
    write(&cache, b"k1  ", t0);
    write(&cache, b"k1  ", t0.add_duration(Duration::from_secs(5)));
    assert_eq!(cache.stats().nchanges, 2);

    // 6 seconds in with a 2 second lifespan: the first sample dies, the
    // second survives and schedules the next check.
    let now = t0.add_duration(Duration::from_secs(6));
    let ticks = cache.handle_xqos(GuardKind::Lifespan, NIL_HANDLE, 200, now);
    assert_eq!(cache.stats().nchanges, 1);
    assert!(ticks >= MIN_XQOS_DELAY);

    // Once everything expired the scan idles.
    let now = t0.add_duration(Duration::from_secs(20));
    let ticks = cache.handle_xqos(GuardKind::Lifespan, NIL_HANDLE, 200, now);
    assert_eq!(ticks, 0);
    assert_eq!(cache.stats().nchanges, 0);
}

#[test]
fn autopurge_no_writers_reaps_unregistered() {
    let cache = HistoryCache::new({
        let mut o = CacheOptions::reader(true).key_size(4);
        o.autopurge_no_writers = true;
        o
    })
    .expect("cache");

    let t0 = Timestamp::new(400, 0);
    // Deliver an alive sample, then the writer unregisters.
    let hash = {
        use xdds_cache::KeySupport;
        xdds_cache::Md5KeySupport
            .hash_from_key(b"k1  ", false)
            .expect("hash")
    };
    let (hci, handle) = cache
        .lookup_hash(&hash, Some(b"k1  "), true)
        .expect("lookup")
        .expect("created");
    let mut alive = Sample::new(ChangeKind::Alive, 7, t0, Payload::from_slice(b"d"))
        .expect("sample");
    alive.handle = handle;
    cache.add_received(alive, Some(hci), false).expect("add");

    let mut unreg =
        Sample::new(ChangeKind::Unregistered, 7, t0, Payload::None).expect("sample");
    unreg.handle = handle;
    cache.add_received(unreg, Some(hci), false).expect("add");
    assert!(cache
        .instance_info(handle)
        .expect("info")
        .kind
        .is_unregistered());

    let now = t0.add_duration(Duration::from_secs(3));
    let ticks = cache.handle_xqos(GuardKind::AutopurgeNoWriters, NIL_HANDLE, 100, now);
    assert_eq!(ticks, 0);
    assert!(cache.instance_info(handle).is_none());
}

#[test]
fn scans_ignore_unconfigured_policies() {
    let cache = HistoryCache::new(CacheOptions::reader(true).key_size(4)).expect("cache");
    let t0 = Timestamp::new(500, 0);
    let ticks = cache.handle_xqos(GuardKind::AutopurgeDisposed, NIL_HANDLE, 100, t0);
    assert_eq!(ticks, 0);
    let ticks = cache.handle_xqos(GuardKind::Deadline, NIL_HANDLE, 100, t0);
    assert_eq!(ticks, 0);
}
