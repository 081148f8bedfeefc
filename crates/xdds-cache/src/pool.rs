// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pool accounting for the cache subsystem.
//!
//! Storage stays with the global allocator; what the pools enforce is the
//! configured ceiling per object class. Each live object of a counted class
//! holds a [`PoolToken`] that releases its slot on drop. A class whose
//! `maximum` is `usize::MAX` is heap-backed and never rejects.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{Error, Result};

/// Object classes managed by the cache subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PoolClass {
    /// History cache containers.
    Cache = 0,
    /// Instance records.
    Instance,
    /// Sample (change) records.
    Change,
    /// Sample reference nodes.
    CcRef,
    /// Local reader match references.
    CRef,
    /// Waiter records.
    CWait,
    /// Pending transfer entries.
    CXfer,
    /// Pending transfer lists.
    XfList,
    /// Time-based filter contexts.
    Filter,
    /// Time-based filter instance nodes.
    FInst,
}

const NUM_CLASSES: usize = 10;

/// Per-class limits: pre-sized, grow step, hard ceiling.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    /// Objects expected up front.
    pub initial: usize,
    /// Growth step once `initial` is exceeded.
    pub extend: usize,
    /// Hard ceiling; `usize::MAX` means heap-backed/unbounded.
    pub maximum: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            initial: 0,
            extend: 1,
            maximum: usize::MAX,
        }
    }
}

impl PoolLimits {
    /// Unbounded heap-backed class.
    pub const fn unbounded() -> Self {
        Self {
            initial: 0,
            extend: 1,
            maximum: usize::MAX,
        }
    }

    /// Bounded class with the given ceiling.
    pub const fn bounded(initial: usize, extend: usize, maximum: usize) -> Self {
        Self {
            initial,
            extend,
            maximum,
        }
    }
}

/// Limits for all ten object classes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolConfig {
    /// Limits indexed by [`PoolClass`].
    pub limits: [PoolLimits; NUM_CLASSES],
}

impl PoolConfig {
    /// Set the limits of a single class, builder-style.
    #[must_use]
    pub fn with(mut self, class: PoolClass, limits: PoolLimits) -> Self {
        self.limits[class as usize] = limits;
        self
    }
}

struct PoolState {
    used: [AtomicUsize; NUM_CLASSES],
    max: [AtomicUsize; NUM_CLASSES],
}

static POOLS: PoolState = PoolState {
    used: [const { AtomicUsize::new(0) }; NUM_CLASSES],
    max: [const { AtomicUsize::new(usize::MAX) }; NUM_CLASSES],
};

/// Apply a pool configuration.
///
/// May be called again to re-limit classes; already-live objects are never
/// reclaimed, so lowering a ceiling below current usage only affects new
/// allocations.
pub fn init(config: &PoolConfig) {
    for (i, limits) in config.limits.iter().enumerate() {
        POOLS.max[i].store(limits.maximum, Ordering::Relaxed);
    }
    log::debug!("[POOL] limits installed");
}

/// Claim one slot of `class`.
///
/// Returns `OutOfResources` when the class ceiling is reached.
pub fn alloc(class: PoolClass) -> Result<PoolToken> {
    let idx = class as usize;
    let max = POOLS.max[idx].load(Ordering::Relaxed);
    let mut used = POOLS.used[idx].load(Ordering::Relaxed);
    loop {
        if used >= max {
            log::warn!("[POOL] class {:?} exhausted ({} in use)", class, used);
            return Err(Error::OutOfResources);
        }
        match POOLS.used[idx].compare_exchange_weak(
            used,
            used + 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return Ok(PoolToken { idx }),
            Err(cur) => used = cur,
        }
    }
}

/// Objects of `class` currently live.
pub fn in_use(class: PoolClass) -> usize {
    POOLS.used[class as usize].load(Ordering::Relaxed)
}

/// RAII slot of a counted pool class.
#[derive(Debug)]
pub struct PoolToken {
    idx: usize,
}

impl Drop for PoolToken {
    fn drop(&mut self) {
        POOLS.used[self.idx].fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_release() {
        // CWait is unused by other unit tests in this module's process
        // window; tolerate concurrent use by measuring deltas.
        let before = in_use(PoolClass::CWait);
        let t1 = alloc(PoolClass::CWait).expect("alloc");
        let t2 = alloc(PoolClass::CWait).expect("alloc");
        assert!(in_use(PoolClass::CWait) >= before + 2);
        drop(t1);
        drop(t2);
        assert!(in_use(PoolClass::CWait) >= before);
    }
}
