// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-key instance records and the per-instance writer table.

use std::sync::Arc;

use crate::monitor::WriterDirectory;
use crate::pool::{self, PoolClass, PoolToken};
use crate::refs::ChangeList;
use crate::sample::{InstanceState, ViewState};
use crate::types::{Guid, InstanceHandle, KeyHash, Timestamp, WriterHandle, NIL_HANDLE};
use crate::{Error, Result};

/// Index of an instance inside the cache's instance arena.
pub type InstSlot = u32;

/// Sentinel for "no instance slot".
pub const NIL_SLOT: InstSlot = u32::MAX;

/// Writer handles kept inline in the instance record.
#[cfg(feature = "compact-handles")]
pub const INLINE_WRITERS: usize = 4;
#[cfg(not(feature = "compact-handles"))]
pub const INLINE_WRITERS: usize = 2;

/// Hard ceiling on writers per instance.
pub const MAX_INST_WRITERS: usize = 4096;

/// Growth step of the spilled writer block.
const WRITER_GROW: usize = 4;

/// Sorted set of writer handles publishing to one instance.
///
/// Small sets stay inline in the record; larger sets spill to a heap block
/// grown in steps of four handles. The array is kept sorted so membership is
/// a binary search.
#[derive(Debug, Default)]
pub struct WriterSet {
    n: usize,
    inline: [WriterHandle; INLINE_WRITERS],
    spill: Option<Vec<WriterHandle>>,
}

impl WriterSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writers.
    pub fn len(&self) -> usize {
        self.n
    }

    /// True when no writer publishes here.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Sorted view of the handles.
    pub fn as_slice(&self) -> &[WriterHandle] {
        match &self.spill {
            Some(block) => &block[..self.n],
            None => &self.inline[..self.n],
        }
    }

    /// Membership test.
    pub fn contains(&self, writer: WriterHandle) -> bool {
        self.as_slice().binary_search(&writer).is_ok()
    }

    /// Insert a writer; returns `false` when it was already present.
    pub fn insert(&mut self, writer: WriterHandle) -> Result<bool> {
        let pos = match self.as_slice().binary_search(&writer) {
            Ok(_) => return Ok(false),
            Err(pos) => pos,
        };
        if self.n >= MAX_INST_WRITERS {
            return Err(Error::OutOfResources);
        }
        if self.spill.is_none() && self.n == INLINE_WRITERS {
            let mut block = Vec::with_capacity(INLINE_WRITERS + WRITER_GROW);
            block.extend_from_slice(&self.inline);
            self.spill = Some(block);
        }
        match &mut self.spill {
            Some(block) => {
                if block.len() == block.capacity() {
                    block.reserve_exact(WRITER_GROW);
                }
                block.insert(pos, writer);
            }
            None => {
                self.inline.copy_within(pos..self.n, pos + 1);
                self.inline[pos] = writer;
            }
        }
        self.n += 1;
        Ok(true)
    }

    /// Remove a writer; returns `false` when it was not present.
    pub fn remove(&mut self, writer: WriterHandle) -> bool {
        let pos = match self.as_slice().binary_search(&writer) {
            Ok(pos) => pos,
            Err(_) => return false,
        };
        match &mut self.spill {
            Some(block) => {
                block.remove(pos);
            }
            None => {
                self.inline.copy_within(pos + 1..self.n, pos);
            }
        }
        self.n -= 1;
        // Collapse back to inline storage once it fits again.
        if self.n == INLINE_WRITERS {
            if let Some(block) = self.spill.take() {
                self.inline[..self.n].copy_from_slice(&block[..self.n]);
            }
        }
        true
    }

    /// Drop every writer.
    pub fn clear(&mut self) {
        self.n = 0;
        self.spill = None;
    }
}

/// Per-key instance record.
#[derive(Debug)]
pub struct Instance {
    /// Assigned numeric handle.
    pub handle: InstanceHandle,
    /// 16-byte key hash.
    pub hash: KeyHash,
    /// Key bytes, kept when longer than the hash or under secure hashing.
    pub key: Option<Arc<[u8]>>,
    /// Ordered list of this instance's sample references.
    pub list: ChangeList,
    /// Alive samples in the list.
    pub ndata: u32,
    /// Lifecycle state.
    pub kind: InstanceState,
    /// View state.
    pub view: ViewState,
    /// Exclusive owner (NIL when shared or unowned).
    pub owner: WriterHandle,
    /// Writers currently publishing to this instance.
    pub writers: WriterSet,
    /// Disposed-generation counter.
    pub disp_cnt: u32,
    /// No-writers-generation counter.
    pub no_w_cnt: u32,
    /// A waiter currently blocks on this instance.
    pub wait: bool,
    /// Deadline missed and not yet refreshed.
    pub deadlined: bool,
    /// Fire `instance_flushed` when this instance is freed.
    pub inform: bool,
    /// Storage may be reclaimed when the instance limit is hit.
    pub recover: bool,
    /// Registered through `register` and not yet unregistered.
    pub registered: bool,
    /// Live time-based-filter nodes pointing here.
    pub tbf_refs: u32,
    /// Next instance in the hash-collision chain (long/secure keys).
    pub(crate) hash_next: InstSlot,
    _token: PoolToken,
}

impl Instance {
    /// Allocate a fresh instance record.
    pub fn new(handle: InstanceHandle, hash: KeyHash, key: Option<Arc<[u8]>>) -> Result<Instance> {
        let token = pool::alloc(PoolClass::Instance)?;
        Ok(Instance {
            handle,
            hash,
            key,
            list: ChangeList::new(),
            ndata: 0,
            // No writers yet.
            kind: InstanceState::UNREGISTERED,
            view: ViewState::New,
            owner: NIL_HANDLE,
            writers: WriterSet::new(),
            disp_cnt: 0,
            no_w_cnt: 0,
            wait: false,
            deadlined: false,
            inform: false,
            recover: false,
            registered: false,
            tbf_refs: 0,
            hash_next: NIL_SLOT,
            _token: token,
        })
    }

    /// Time of the most recent event on this instance.
    pub fn last_time(&self, tail_time: Option<Timestamp>) -> Timestamp {
        tail_time.unwrap_or_else(|| self.list.empty_time())
    }

    /// Empty, unregistered, and flagged recoverable.
    pub fn is_recoverable(&self) -> bool {
        self.list.is_empty() && self.kind.is_unregistered() && self.recover
    }

    /// Idle: unregistered with no samples and no filter nodes.
    pub fn is_idle(&self) -> bool {
        self.kind.is_unregistered() && self.list.is_empty() && self.tbf_refs == 0
    }

    /// Recompute the exclusive owner: highest strength wins, ties go to the
    /// lexicographically smallest GUID.
    pub fn update_owner(&mut self, directory: Option<&dyn WriterDirectory>) {
        let mut best: WriterHandle = NIL_HANDLE;
        let mut best_strength = 0u32;
        for &w in self.writers.as_slice() {
            let strength = directory.map_or(0, |d| d.strength(w));
            if best == NIL_HANDLE || strength > best_strength {
                best = w;
                best_strength = strength;
            } else if strength == best_strength && guid_less(directory, w, best) {
                best = w;
            }
        }
        self.owner = best;
    }
}

fn guid_less(directory: Option<&dyn WriterDirectory>, a: WriterHandle, b: WriterHandle) -> bool {
    let lookup = |w: WriterHandle| -> Option<Guid> { directory.and_then(|d| d.guid(w)) };
    match (lookup(a), lookup(b)) {
        (Some(ga), Some(gb)) => ga < gb,
        // Known GUIDs win ties against stale entries.
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, GuidPrefix};

    struct FixedDirectory(Vec<(WriterHandle, u32, Guid)>);

    impl WriterDirectory for FixedDirectory {
        fn strength(&self, writer: WriterHandle) -> u32 {
            self.0
                .iter()
                .find(|(w, _, _)| *w == writer)
                .map_or(0, |(_, s, _)| *s)
        }
        fn guid(&self, writer: WriterHandle) -> Option<Guid> {
            self.0
                .iter()
                .find(|(w, _, _)| *w == writer)
                .map(|(_, _, g)| *g)
        }
    }

    fn guid(last: u8) -> Guid {
        Guid {
            prefix: GuidPrefix([1; 12]),
            entity_id: EntityId([0, 0, 0, last]),
        }
    }

    #[test]
    fn writer_set_stays_sorted() {
        let mut set = WriterSet::new();
        for w in [5, 1, 9, 3, 7, 2, 8] {
            assert!(set.insert(w).expect("insert"));
        }
        assert!(!set.insert(5).expect("insert"));
        assert_eq!(set.as_slice(), &[1, 2, 3, 5, 7, 8, 9]);
        assert!(set.contains(7));
        assert!(!set.contains(4));
    }

    #[test]
    fn writer_set_spills_and_collapses() {
        let mut set = WriterSet::new();
        for w in 1..=(INLINE_WRITERS as u32 + 3) {
            set.insert(w).expect("insert");
        }
        assert!(set.spill.is_some());
        while set.len() > INLINE_WRITERS {
            let last = *set.as_slice().last().expect("non-empty");
            assert!(set.remove(last));
        }
        assert!(set.spill.is_none());
        assert_eq!(set.len(), INLINE_WRITERS);
    }

    #[test]
    fn writer_set_remove_missing() {
        let mut set = WriterSet::new();
        set.insert(1).expect("insert");
        assert!(!set.remove(2));
        assert!(set.remove(1));
        assert!(set.is_empty());
    }

    #[test]
    fn owner_by_strength_then_guid() {
        let dir = FixedDirectory(vec![
            (1, 10, guid(3)),
            (2, 20, guid(2)),
            (3, 20, guid(1)),
        ]);
        let mut inst = Instance::new(1, KeyHash::nil(), None).expect("instance");
        for w in [1, 2, 3] {
            inst.writers.insert(w).expect("insert");
        }
        inst.update_owner(Some(&dir));
        // 2 and 3 share the highest strength; 3 has the smaller GUID.
        assert_eq!(inst.owner, 3);

        inst.writers.remove(3);
        inst.update_owner(Some(&dir));
        assert_eq!(inst.owner, 2);
    }

    #[test]
    fn new_instance_starts_unregistered() {
        let inst = Instance::new(4, KeyHash::nil(), None).expect("instance");
        assert!(inst.kind.is_unregistered());
        assert_eq!(inst.view, ViewState::New);
        assert!(!inst.is_recoverable());
    }
}
