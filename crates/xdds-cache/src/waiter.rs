// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking support: a process-global list of waiters keyed by
//! `(cache, sample-or-none)`.
//!
//! A waiter owns a condition variable; callers wait on it against the
//! owning cache's state mutex. Multiple threads blocking on the same key
//! share one entry. The producer side (acknowledgement and unblock paths)
//! looks up the matching entry and wakes exactly those threads.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::pool::{self, PoolClass, PoolToken};
use crate::types::InstanceHandle;
use crate::Result;

/// Key of a waiter: sample identity inside one cache, or the cache itself.
pub(crate) type SampleKey = Option<usize>;

/// One blocking context.
pub(crate) struct WaitEntry {
    /// Owning cache id.
    pub cache: u64,
    /// Awaited sample (`None` = waiting for the whole cache to drain).
    pub sample: SampleKey,
    /// Instance the original waiter blocked on, if any.
    pub instance: Option<InstanceHandle>,
    /// Wakes the blocked threads; always used with the owning cache's
    /// state mutex.
    pub cond: Condvar,
    /// Set when the awaited sample was removed underneath the waiter.
    pub sample_gone: AtomicBool,
    waiting: AtomicU32,
    _token: PoolToken,
}

static WAITERS: Mutex<Vec<Arc<WaitEntry>>> = Mutex::new(Vec::new());

/// Join or create the waiter for `(cache, sample)`.
///
/// Returns `Ok(None)` when the caller must not wait: another thread already
/// blocks on the same instance, which would deadlock the eviction path.
pub(crate) fn acquire(
    cache: u64,
    sample: SampleKey,
    instance: Option<InstanceHandle>,
) -> Result<Option<Arc<WaitEntry>>> {
    let mut list = WAITERS.lock();
    if let Some(entry) = list
        .iter()
        .find(|e| e.cache == cache && e.sample == sample)
    {
        if instance.is_some() && entry.instance == instance {
            return Ok(None);
        }
        entry.waiting.fetch_add(1, Ordering::AcqRel);
        return Ok(Some(Arc::clone(entry)));
    }
    let token = pool::alloc(PoolClass::CWait)?;
    let entry = Arc::new(WaitEntry {
        cache,
        sample,
        instance,
        cond: Condvar::new(),
        sample_gone: AtomicBool::new(false),
        waiting: AtomicU32::new(1),
        _token: token,
    });
    list.push(Arc::clone(&entry));
    Ok(Some(entry))
}

/// Leave a waiter. Returns `true` when this was the last blocked thread and
/// the entry was retired; the caller then clears the flags it set (instance
/// wait bit, sample urgency, cache blocked bit).
pub(crate) fn release(entry: &Arc<WaitEntry>) -> bool {
    let mut list = WAITERS.lock();
    if entry.waiting.fetch_sub(1, Ordering::AcqRel) == 1 {
        list.retain(|e| !Arc::ptr_eq(e, entry));
        true
    } else {
        false
    }
}

/// Look up the waiter for `(cache, sample)` without joining it.
pub(crate) fn lookup(cache: u64, sample: SampleKey) -> Option<Arc<WaitEntry>> {
    WAITERS
        .lock()
        .iter()
        .find(|e| e.cache == cache && e.sample == sample)
        .cloned()
}

/// Wake every thread blocked on `entry`.
pub(crate) fn wake(entry: &WaitEntry) {
    entry.cond.notify_all();
}

/// Drop every waiter of a cache (endpoint close). The threads themselves
/// wake via the returned entries.
pub(crate) fn drain(cache: u64) -> Vec<Arc<WaitEntry>> {
    let mut list = WAITERS.lock();
    let mut drained = Vec::new();
    list.retain(|e| {
        if e.cache == cache {
            drained.push(Arc::clone(e));
            false
        } else {
            true
        }
    });
    drained
}
