// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Instance index: a simple list that promotes to dual skiplists.
//!
//! Small caches keep instances in a plain vector in insertion order. Past
//! [`MAX_LINEAR`] instances the index is promoted to two skiplists, one
//! keyed by the 16-byte hash and one by the numeric handle. When the
//! population falls back to [`MIN_LINEAR`] and no walk is in progress, the
//! index collapses back to the vector (in handle order).
//!
//! Long keys (> 16 bytes) and secure hashing make hash collisions possible;
//! colliding instances chain through `Instance::hash_next` behind one
//! hash-skiplist entry.

use std::sync::Arc;

use crate::instance::{InstSlot, Instance, NIL_SLOT};
use crate::skiplist::{InsertOutcome, Skiplist};
use crate::types::{InstanceHandle, KeyHash, MAX_INST_HANDLE};
use crate::Result;

/// Largest population served by the simple list.
pub const MAX_LINEAR: u32 = 12;

/// Population at which the skiplists collapse back to the simple list.
pub const MIN_LINEAR: u32 = 8;

/// Deepest allowed instance-walk nesting.
const MAX_WALK_DEPTH: u8 = 3;

enum IndexForm {
    Linear(Vec<InstSlot>),
    Skip {
        by_hash: Skiplist<KeyHash>,
        by_handle: Skiplist<InstanceHandle>,
    },
}

/// Arena of instance records plus the promoted/demoted index over them.
pub struct InstanceTable {
    arena: Vec<Option<Instance>>,
    free: Vec<InstSlot>,
    index: IndexForm,
    count: u32,
    walk_depth: u8,
    last_handle: InstanceHandle,
    recycled: bool,
    long_keys: bool,
}

impl InstanceTable {
    /// Fresh table. `long_keys` enables collision chaining (keys longer
    /// than the hash, unbounded keys, or secure hashing).
    pub fn new(long_keys: bool) -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            index: IndexForm::Linear(Vec::new()),
            count: 0,
            walk_depth: 0,
            last_handle: 0,
            recycled: false,
            long_keys,
        }
    }

    /// Number of live instances.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// True after promotion to the skiplist form.
    pub fn uses_skiplists(&self) -> bool {
        matches!(self.index, IndexForm::Skip { .. })
    }

    /// Shared access to a slot.
    pub fn get(&self, slot: InstSlot) -> &Instance {
        self.arena[slot as usize]
            .as_ref()
            .expect("stale instance slot")
    }

    /// Exclusive access to a slot.
    pub fn get_mut(&mut self, slot: InstSlot) -> &mut Instance {
        self.arena[slot as usize]
            .as_mut()
            .expect("stale instance slot")
    }

    /// Find the slot holding `handle`.
    pub fn slot_by_handle(&self, handle: InstanceHandle) -> Option<InstSlot> {
        match &self.index {
            IndexForm::Linear(slots) => slots
                .iter()
                .copied()
                .find(|s| self.get(*s).handle == handle),
            IndexForm::Skip { by_handle, .. } => by_handle.search(&handle),
        }
    }

    /// Find the slot matching `(hash, key)`.
    pub fn find_by_key(&self, hash: &KeyHash, key: Option<&[u8]>) -> Option<InstSlot> {
        match &self.index {
            IndexForm::Linear(slots) => slots
                .iter()
                .copied()
                .find(|s| self.key_matches(*s, hash, key)),
            IndexForm::Skip { by_hash, .. } => {
                let mut slot = by_hash.search(hash)?;
                if !self.long_keys {
                    return Some(slot);
                }
                // Collision chain: compare stored key bytes.
                while slot != NIL_SLOT {
                    if self.key_matches(slot, hash, key) {
                        return Some(slot);
                    }
                    slot = self.get(slot).hash_next;
                }
                None
            }
        }
    }

    fn key_matches(&self, slot: InstSlot, hash: &KeyHash, key: Option<&[u8]>) -> bool {
        let inst = self.get(slot);
        if inst.hash != *hash {
            return false;
        }
        if !self.long_keys {
            return true;
        }
        match (key, &inst.key) {
            (Some(k), Some(stored)) => stored.as_ref() == k,
            // Without key bytes the hash is the best evidence available.
            _ => true,
        }
    }

    /// Assign the next instance handle, skipping still-live values after
    /// the counter wrapped.
    pub fn assign_handle(&mut self) -> InstanceHandle {
        loop {
            if self.last_handle >= MAX_INST_HANDLE {
                self.last_handle = 1;
                self.recycled = true;
            } else {
                self.last_handle += 1;
            }
            if !self.recycled || self.slot_by_handle(self.last_handle).is_none() {
                return self.last_handle;
            }
        }
    }

    /// Last handle handed out (diagnostics).
    pub fn last_handle(&self) -> InstanceHandle {
        self.last_handle
    }

    /// Create a new instance for `(hash, key)` and link it into the index.
    ///
    /// `handle` fixes the assigned handle (built-in readers); `None` rolls
    /// the counter.
    pub fn create(
        &mut self,
        hash: KeyHash,
        key: Option<Arc<[u8]>>,
        handle: Option<InstanceHandle>,
    ) -> Result<InstSlot> {
        // Promote before the simple list outgrows its threshold.
        if matches!(self.index, IndexForm::Linear(_)) && self.count >= MAX_LINEAR {
            self.promote();
        }

        let handle = match handle {
            Some(h) => h,
            None => self.assign_handle(),
        };
        let inst = Instance::new(handle, hash, key)?;
        let slot = if let Some(free) = self.free.pop() {
            self.arena[free as usize] = Some(inst);
            free
        } else {
            self.arena.push(Some(inst));
            (self.arena.len() - 1) as InstSlot
        };

        match &mut self.index {
            IndexForm::Linear(slots) => slots.push(slot),
            IndexForm::Skip { by_hash, by_handle } => {
                match by_hash.insert(hash, slot) {
                    InsertOutcome::New => {}
                    InsertOutcome::Existing(head) => {
                        // Long-key collision: chain in front of the head.
                        self.arena[slot as usize]
                            .as_mut()
                            .expect("fresh slot")
                            .hash_next = head;
                        by_hash.update(&hash, slot);
                    }
                }
                by_handle.insert(handle, slot);
            }
        }
        self.count += 1;
        Ok(slot)
    }

    /// Unlink `slot` from the index and return the record.
    ///
    /// Demotes the index when the population allows and no walk is active.
    pub fn remove(&mut self, slot: InstSlot) -> Instance {
        let handle = self.get(slot).handle;
        let hash = self.get(slot).hash;
        match &mut self.index {
            IndexForm::Linear(slots) => {
                slots.retain(|s| *s != slot);
            }
            IndexForm::Skip { by_hash, by_handle } => {
                by_handle.remove(&handle);
                let head = by_hash.search(&hash);
                if let Some(head) = head {
                    if head == slot {
                        let next = self.arena[slot as usize]
                            .as_ref()
                            .expect("stale instance slot")
                            .hash_next;
                        if next == NIL_SLOT {
                            by_hash.remove(&hash);
                        } else {
                            by_hash.update(&hash, next);
                        }
                    } else {
                        // Unlink from the middle of the collision chain.
                        let mut cur = head;
                        loop {
                            let next = self.arena[cur as usize]
                                .as_ref()
                                .expect("stale instance slot")
                                .hash_next;
                            if next == slot {
                                let skip = self.arena[slot as usize]
                                    .as_ref()
                                    .expect("stale instance slot")
                                    .hash_next;
                                self.arena[cur as usize]
                                    .as_mut()
                                    .expect("stale instance slot")
                                    .hash_next = skip;
                                break;
                            }
                            if next == NIL_SLOT {
                                log::error!("[CACHE] instance missing from hash chain");
                                break;
                            }
                            cur = next;
                        }
                    }
                } else {
                    log::error!("[CACHE] instance missing from hash index");
                }
            }
        }
        self.count -= 1;
        let inst = self.arena[slot as usize]
            .take()
            .expect("instance double free");
        self.free.push(slot);

        if self.walk_depth == 0 && self.count <= MIN_LINEAR && self.uses_skiplists() {
            self.demote();
        }
        inst
    }

    /// Handles of all instances, in index order (insertion order for the
    /// simple list, handle order after promotion).
    pub fn walk_handles(&self) -> Vec<InstanceHandle> {
        match &self.index {
            IndexForm::Linear(slots) => slots.iter().map(|s| self.get(*s).handle).collect(),
            IndexForm::Skip { by_handle, .. } => {
                let mut out = Vec::with_capacity(self.count as usize);
                by_handle.walk(|h, _| {
                    out.push(*h);
                    true
                });
                out
            }
        }
    }

    /// Enter a nested instance walk. Nesting deeper than three levels is a
    /// corruption signal and aborts.
    pub fn enter_walk(&mut self) {
        assert!(
            self.walk_depth < MAX_WALK_DEPTH,
            "instance walk recursion too deep"
        );
        self.walk_depth += 1;
    }

    /// Leave a nested walk, demoting the index if it shrank underneath.
    pub fn exit_walk(&mut self) {
        self.walk_depth -= 1;
        if self.walk_depth == 0 && self.count <= MIN_LINEAR && self.uses_skiplists() {
            self.demote();
        }
    }

    /// Oldest recoverable instance (reader caches reclaim these when the
    /// instance limit is hit).
    pub fn recoverable(&self) -> Option<InstSlot> {
        let mut best: Option<InstSlot> = None;
        for handle in self.walk_handles() {
            let Some(slot) = self.slot_by_handle(handle) else {
                continue;
            };
            let inst = self.get(slot);
            if !inst.is_recoverable() {
                continue;
            }
            match best {
                None => best = Some(slot),
                Some(b) if inst.list.empty_time() < self.get(b).list.empty_time() => {
                    best = Some(slot);
                }
                _ => {}
            }
        }
        best
    }

    fn promote(&mut self) {
        let IndexForm::Linear(slots) = &self.index else {
            return;
        };
        let slots = slots.clone();
        let mut by_hash: Skiplist<KeyHash> = Skiplist::new();
        let mut by_handle: Skiplist<InstanceHandle> = Skiplist::new();
        for slot in slots {
            let (hash, handle) = {
                let inst = self.get(slot);
                (inst.hash, inst.handle)
            };
            match by_hash.insert(hash, slot) {
                InsertOutcome::New => {}
                InsertOutcome::Existing(head) => {
                    self.arena[slot as usize]
                        .as_mut()
                        .expect("stale instance slot")
                        .hash_next = head;
                    by_hash.update(&hash, slot);
                }
            }
            by_handle.insert(handle, slot);
        }
        self.index = IndexForm::Skip { by_hash, by_handle };
        log::debug!("[CACHE] instance index promoted to skiplists");
    }

    fn demote(&mut self) {
        let IndexForm::Skip { by_handle, .. } = &self.index else {
            return;
        };
        let mut slots = Vec::with_capacity(self.count as usize);
        by_handle.walk(|_, slot| {
            slots.push(slot);
            true
        });
        for &slot in &slots {
            self.arena[slot as usize]
                .as_mut()
                .expect("stale instance slot")
                .hash_next = NIL_SLOT;
        }
        self.index = IndexForm::Linear(slots);
        log::debug!("[CACHE] instance index demoted to simple list");
    }
}
