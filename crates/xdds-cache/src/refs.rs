// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample reference nodes and the two ordered lists they live on.
//!
//! Every stored sample is referenced by exactly one arena node. The node
//! carries two independent link pairs: one chains it into the cache-wide
//! ordered list, the other into the owning instance's list. This folds the
//! classic mirrored-node pair into a single record; the twin pointer becomes
//! a chain selector.
//!
//! ```text
//! cache list:     [n0] <-> [n1] <-> [n2] <-> [n3]      (Chain::Cache links)
//! instance A:     [n0] <------> [n2]                   (Chain::Inst links)
//! instance B:              [n1] <------> [n3]
//! ```
//!
//! A list that drains to empty remembers the timestamp of the last removed
//! sample; deadline and autopurge scans use it as the last-event time.

use std::sync::Arc;

use crate::pool::{self, PoolClass, PoolToken};
use crate::sample::Sample;
use crate::types::Timestamp;
use crate::Result;

/// Index of a reference node inside the arena.
pub type RefIdx = u32;

/// Sentinel for "no node".
pub const NIL: RefIdx = u32::MAX;

/// Which link pair of a node to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    /// Cache-wide ordered list.
    Cache,
    /// Per-instance ordered list.
    Inst,
}

/// One sample reference.
#[derive(Debug)]
pub struct RefNode {
    /// The referenced sample. The node owns one shared reference.
    pub sample: Arc<Sample>,
    prev: RefIdx,
    next: RefIdx,
    iprev: RefIdx,
    inext: RefIdx,
    /// Set while the node is linked into an instance list.
    pub in_instance: bool,
    _token: PoolToken,
}

impl RefNode {
    fn links(&self, chain: Chain) -> (RefIdx, RefIdx) {
        match chain {
            Chain::Cache => (self.prev, self.next),
            Chain::Inst => (self.iprev, self.inext),
        }
    }

    fn set_prev(&mut self, chain: Chain, idx: RefIdx) {
        match chain {
            Chain::Cache => self.prev = idx,
            Chain::Inst => self.iprev = idx,
        }
    }

    fn set_next(&mut self, chain: Chain, idx: RefIdx) {
        match chain {
            Chain::Cache => self.next = idx,
            Chain::Inst => self.inext = idx,
        }
    }
}

/// Endpoints of an ordered list, or the time it drained.
#[derive(Debug, Clone, Copy)]
pub enum ListEnds {
    /// No elements; remembers when the list last held one.
    Empty {
        /// Timestamp of the last removed sample (zero if never populated).
        last_time: Timestamp,
    },
    /// At least one element.
    Nodes {
        /// First node.
        head: RefIdx,
        /// Last node.
        tail: RefIdx,
    },
}

/// An ordered list of sample references over the shared arena.
#[derive(Debug, Clone, Copy)]
pub struct ChangeList {
    /// Endpoints or drain time.
    pub ends: ListEnds,
    /// Number of linked nodes.
    pub count: u32,
}

impl Default for ChangeList {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeList {
    /// Fresh empty list.
    pub const fn new() -> Self {
        Self {
            ends: ListEnds::Empty {
                last_time: Timestamp::ZERO,
            },
            count: 0,
        }
    }

    /// First node, if any.
    pub fn head(&self) -> Option<RefIdx> {
        match self.ends {
            ListEnds::Empty { .. } => None,
            ListEnds::Nodes { head, .. } => Some(head),
        }
    }

    /// Last node, if any.
    pub fn tail(&self) -> Option<RefIdx> {
        match self.ends {
            ListEnds::Empty { .. } => None,
            ListEnds::Nodes { tail, .. } => Some(tail),
        }
    }

    /// True when no nodes are linked.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Timestamp recorded when the list drained (zero while populated).
    pub fn empty_time(&self) -> Timestamp {
        match self.ends {
            ListEnds::Empty { last_time } => last_time,
            ListEnds::Nodes { .. } => Timestamp::ZERO,
        }
    }
}

/// Arena of reference nodes shared by a cache's lists.
#[derive(Debug, Default)]
pub struct RefArena {
    nodes: Vec<Option<RefNode>>,
    free: Vec<RefIdx>,
}

impl RefArena {
    /// Fresh arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a node referencing `sample`.
    pub fn alloc(&mut self, sample: Arc<Sample>) -> Result<RefIdx> {
        let token = pool::alloc(PoolClass::CcRef)?;
        let node = RefNode {
            sample,
            prev: NIL,
            next: NIL,
            iprev: NIL,
            inext: NIL,
            in_instance: false,
            _token: token,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(node);
            Ok(idx)
        } else {
            self.nodes.push(Some(node));
            Ok((self.nodes.len() - 1) as RefIdx)
        }
    }

    /// Release a node, returning its sample reference to the caller.
    ///
    /// The node must already be unlinked from every chain.
    pub fn release(&mut self, idx: RefIdx) -> Arc<Sample> {
        let node = self.nodes[idx as usize]
            .take()
            .expect("reference node double free");
        self.free.push(idx);
        node.sample
    }

    /// Shared access to a node.
    pub fn node(&self, idx: RefIdx) -> &RefNode {
        self.nodes[idx as usize]
            .as_ref()
            .expect("stale reference node index")
    }

    fn node_mut(&mut self, idx: RefIdx) -> &mut RefNode {
        self.nodes[idx as usize]
            .as_mut()
            .expect("stale reference node index")
    }

    /// Successor of `idx` on `chain` (`NIL` at the tail).
    pub fn next(&self, chain: Chain, idx: RefIdx) -> RefIdx {
        self.node(idx).links(chain).1
    }

    /// Link `idx` into `list` on `chain`.
    ///
    /// With `ordered` set the node is inserted by sample timestamp; equal
    /// timestamps keep arrival order. Otherwise it is appended.
    pub fn link(&mut self, list: &mut ChangeList, chain: Chain, idx: RefIdx, ordered: bool) {
        if chain == Chain::Inst {
            self.node_mut(idx).in_instance = true;
        }
        match list.ends {
            ListEnds::Empty { .. } => {
                let n = self.node_mut(idx);
                n.set_prev(chain, NIL);
                n.set_next(chain, NIL);
                list.ends = ListEnds::Nodes {
                    head: idx,
                    tail: idx,
                };
            }
            ListEnds::Nodes { head, tail } => {
                let time = self.node(idx).sample.time;
                // Walk back from the tail to the last node that is not newer;
                // ties stay in arrival order.
                let mut after = tail;
                if ordered {
                    while after != NIL && self.node(after).sample.time > time {
                        after = self.node(after).links(chain).0;
                    }
                }
                if after == NIL {
                    // New head.
                    self.node_mut(idx).set_prev(chain, NIL);
                    self.node_mut(idx).set_next(chain, head);
                    self.node_mut(head).set_prev(chain, idx);
                    list.ends = ListEnds::Nodes { head: idx, tail };
                } else {
                    let succ = self.node(after).links(chain).1;
                    self.node_mut(idx).set_prev(chain, after);
                    self.node_mut(idx).set_next(chain, succ);
                    self.node_mut(after).set_next(chain, idx);
                    if succ == NIL {
                        list.ends = ListEnds::Nodes { head, tail: idx };
                    } else {
                        self.node_mut(succ).set_prev(chain, idx);
                    }
                }
            }
        }
        list.count += 1;
    }

    /// Unlink `idx` from `list` on `chain`.
    pub fn unlink(&mut self, list: &mut ChangeList, chain: Chain, idx: RefIdx) {
        let (prev, next) = self.node(idx).links(chain);
        let ListEnds::Nodes { mut head, mut tail } = list.ends else {
            panic!("unlink from empty change list");
        };
        if prev == NIL {
            head = next;
        } else {
            self.node_mut(prev).set_next(chain, next);
        }
        if next == NIL {
            tail = prev;
        } else {
            self.node_mut(next).set_prev(chain, prev);
        }
        {
            let n = self.node_mut(idx);
            n.set_prev(chain, NIL);
            n.set_next(chain, NIL);
            if chain == Chain::Inst {
                n.in_instance = false;
            }
        }
        list.count -= 1;
        if list.count == 0 {
            list.ends = ListEnds::Empty {
                last_time: self.node(idx).sample.time,
            };
        } else {
            list.ends = ListEnds::Nodes { head, tail };
        }
    }

    /// Find the node of `sample` in `list` by pointer identity.
    pub fn find(&self, list: &ChangeList, chain: Chain, sample: &Arc<Sample>) -> Option<RefIdx> {
        let mut idx = list.head()?;
        while idx != NIL {
            if Arc::ptr_eq(&self.node(idx).sample, sample) {
                return Some(idx);
            }
            idx = self.node(idx).links(chain).1;
        }
        None
    }

    /// Collect the node indices of `list` in order.
    pub fn collect(&self, list: &ChangeList, chain: Chain) -> Vec<RefIdx> {
        let mut out = Vec::with_capacity(list.count as usize);
        let mut idx = list.head().unwrap_or(NIL);
        while idx != NIL {
            out.push(idx);
            idx = self.node(idx).links(chain).1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{ChangeKind, Payload};

    fn sample(t: u32) -> Arc<Sample> {
        Arc::new(
            Sample::new(
                ChangeKind::Alive,
                1,
                Timestamp::new(t, 0),
                Payload::from_slice(&[t as u8]),
            )
            .expect("sample alloc"),
        )
    }

    fn times(arena: &RefArena, list: &ChangeList, chain: Chain) -> Vec<u32> {
        arena
            .collect(list, chain)
            .iter()
            .map(|i| arena.node(*i).sample.time.sec)
            .collect()
    }

    #[test]
    fn append_preserves_arrival_order() {
        let mut arena = RefArena::new();
        let mut list = ChangeList::new();
        for t in [3, 1, 2] {
            let idx = arena.alloc(sample(t)).expect("alloc");
            arena.link(&mut list, Chain::Cache, idx, false);
        }
        assert_eq!(times(&arena, &list, Chain::Cache), vec![3, 1, 2]);
    }

    #[test]
    fn ordered_insert_sorts_by_time() {
        let mut arena = RefArena::new();
        let mut list = ChangeList::new();
        for t in [3, 1, 2] {
            let idx = arena.alloc(sample(t)).expect("alloc");
            arena.link(&mut list, Chain::Cache, idx, true);
        }
        assert_eq!(times(&arena, &list, Chain::Cache), vec![1, 2, 3]);
    }

    #[test]
    fn ordered_insert_keeps_arrival_order_on_ties() {
        let mut arena = RefArena::new();
        let mut list = ChangeList::new();
        let a = sample(5);
        let b = sample(5);
        let ia = arena.alloc(Arc::clone(&a)).expect("alloc");
        arena.link(&mut list, Chain::Cache, ia, true);
        let ib = arena.alloc(Arc::clone(&b)).expect("alloc");
        arena.link(&mut list, Chain::Cache, ib, true);

        let order = arena.collect(&list, Chain::Cache);
        assert!(Arc::ptr_eq(&arena.node(order[0]).sample, &a));
        assert!(Arc::ptr_eq(&arena.node(order[1]).sample, &b));
    }

    #[test]
    fn drain_records_last_time() {
        let mut arena = RefArena::new();
        let mut list = ChangeList::new();
        let idx = arena.alloc(sample(9)).expect("alloc");
        arena.link(&mut list, Chain::Cache, idx, false);
        assert_eq!(list.empty_time(), Timestamp::ZERO);

        arena.unlink(&mut list, Chain::Cache, idx);
        arena.release(idx);
        assert!(list.is_empty());
        assert_eq!(list.empty_time(), Timestamp::new(9, 0));
    }

    #[test]
    fn dual_chain_links_are_independent() {
        let mut arena = RefArena::new();
        let mut cache = ChangeList::new();
        let mut inst_a = ChangeList::new();
        let mut inst_b = ChangeList::new();

        let idxs: Vec<RefIdx> = (1..=4)
            .map(|t| {
                let i = arena.alloc(sample(t)).expect("alloc");
                arena.link(&mut cache, Chain::Cache, i, false);
                i
            })
            .collect();
        arena.link(&mut inst_a, Chain::Inst, idxs[0], false);
        arena.link(&mut inst_b, Chain::Inst, idxs[1], false);
        arena.link(&mut inst_a, Chain::Inst, idxs[2], false);
        arena.link(&mut inst_b, Chain::Inst, idxs[3], false);

        assert_eq!(times(&arena, &cache, Chain::Cache), vec![1, 2, 3, 4]);
        assert_eq!(times(&arena, &inst_a, Chain::Inst), vec![1, 3]);
        assert_eq!(times(&arena, &inst_b, Chain::Inst), vec![2, 4]);

        // Removing from the instance chain leaves the cache chain intact.
        arena.unlink(&mut inst_a, Chain::Inst, idxs[2]);
        assert_eq!(times(&arena, &inst_a, Chain::Inst), vec![1]);
        assert_eq!(times(&arena, &cache, Chain::Cache), vec![1, 2, 3, 4]);
        assert!(!arena.node(idxs[2]).in_instance);
    }

    #[test]
    fn find_by_pointer_identity() {
        let mut arena = RefArena::new();
        let mut list = ChangeList::new();
        let a = sample(1);
        let b = sample(1);
        let ia = arena.alloc(Arc::clone(&a)).expect("alloc");
        arena.link(&mut list, Chain::Cache, ia, false);

        assert_eq!(arena.find(&list, Chain::Cache, &a), Some(ia));
        assert_eq!(arena.find(&list, Chain::Cache, &b), None);
    }
}
