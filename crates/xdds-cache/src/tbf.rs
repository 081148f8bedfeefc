// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-based filter: per-instance rate limiting with a one-deep pending
//! slot.
//!
//! A filter context belongs to a reader cache and owns one node per active
//! instance. The first sample of a window is sent immediately; later
//! samples within the window park in the node's pending slot, each newcomer
//! displacing the previous occupant. The expiry walk dispatches pending
//! samples whose window elapsed and retires idle nodes.
//!
//! The context is reference-counted by the remote writers feeding the
//! reader; the last writer's departure tears it down.

use std::collections::VecDeque;
use std::time::Duration;

use crate::pool::{self, PoolClass, PoolToken};
use crate::sample::Sample;
use crate::types::{Hci, InstanceHandle, Timestamp};

/// A sample parked for later delivery.
#[derive(Debug)]
pub(crate) struct TbfPending {
    /// The cloned, not-yet-inserted sample.
    pub sample: Sample,
    /// Destination instance, when known.
    pub hci: Option<Hci>,
    /// Reliability flag to use at delivery.
    pub rel: bool,
}

#[derive(Debug)]
struct TbfNode {
    instance: Option<InstanceHandle>,
    tx_time: Timestamp,
    pending: Option<TbfPending>,
    _token: PoolToken,
}

/// Verdict of [`TbfContext::add`].
#[derive(Debug)]
pub(crate) enum TbfOutcome {
    /// Deliver now; a node was created and the instance gained a filter
    /// reference. `first` is set when this was the first node (start the
    /// expiry timer).
    Send {
        /// Sample to deliver.
        pending: TbfPending,
        /// First node in the context.
        first: bool,
    },
    /// Deliver now; the node pool is exhausted, so this instance goes
    /// unfiltered.
    SendUnfiltered(TbfPending),
    /// Parked in a fresh pending slot.
    Queued,
    /// Parked, displacing the previous occupant (returned for disposal).
    Replaced(TbfPending),
}

/// Result of one expiry walk.
#[derive(Debug, Default)]
pub(crate) struct TbfExpiry {
    /// Samples whose window elapsed; deliver in order.
    pub send: Vec<TbfPending>,
    /// Instances whose idle node was retired (drop a filter reference).
    pub retired: Vec<Option<InstanceHandle>>,
    /// Delay until the next expiry, if nodes remain.
    pub next: Option<Duration>,
}

/// Per-cache filter context.
#[derive(Debug)]
pub(crate) struct TbfContext {
    delay: Timestamp,
    /// Remote writers referencing this context.
    pub nusers: u32,
    nodes: VecDeque<TbfNode>,
    _token: PoolToken,
}

impl TbfContext {
    /// Create a context with the given minimum separation.
    pub fn new(separation: Duration) -> crate::Result<Self> {
        let token = pool::alloc(PoolClass::Filter)?;
        Ok(Self {
            delay: Timestamp::from_duration(separation),
            nusers: 1,
            nodes: VecDeque::new(),
            _token: token,
        })
    }

    /// Live nodes (diagnostics).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Run a sample through the filter.
    pub fn add(
        &mut self,
        instance: Option<InstanceHandle>,
        time: Timestamp,
        pending: TbfPending,
    ) -> TbfOutcome {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.instance == instance) {
            let displaced = node.pending.replace(pending);
            return match displaced {
                Some(old) => TbfOutcome::Replaced(old),
                None => TbfOutcome::Queued,
            };
        }

        // First sample for this instance: open a window and send through.
        let Ok(token) = pool::alloc(PoolClass::FInst) else {
            log::warn!("[TBF] node pool exhausted, instance unfiltered");
            return TbfOutcome::SendUnfiltered(pending);
        };
        let first = self.nodes.is_empty();
        self.nodes.push_back(TbfNode {
            instance,
            tx_time: time.add(self.delay),
            pending: None,
            _token: token,
        });
        TbfOutcome::Send { pending, first }
    }

    /// Walk expired nodes at `now`.
    pub fn expire(&mut self, now: Timestamp) -> TbfExpiry {
        let mut result = TbfExpiry::default();
        while let Some(head) = self.nodes.front() {
            if now < head.tx_time {
                break;
            }
            let mut node = self.nodes.pop_front().expect("head exists");
            if let Some(pending) = node.pending.take() {
                // Window elapsed with a parked sample: send it, open the
                // next window, rotate to the tail.
                node.tx_time = node.tx_time.add(self.delay);
                self.nodes.push_back(node);
                result.send.push(pending);
            } else {
                // Idle window: the node has served its purpose.
                result.retired.push(node.instance);
            }
        }
        if let Some(head) = self.nodes.front() {
            let gap = head.tx_time.diff(now).to_duration();
            result.next = Some(gap.max(Duration::from_millis(1)));
        }
        result
    }

    /// Drop every node of `instance`, returning parked samples for
    /// disposal.
    pub fn remove_instance(&mut self, instance: InstanceHandle) -> Vec<TbfPending> {
        let mut dropped = Vec::new();
        self.nodes.retain_mut(|n| {
            if n.instance == Some(instance) {
                if let Some(p) = n.pending.take() {
                    dropped.push(p);
                }
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Tear the context down, returning every parked sample.
    pub fn drain(&mut self) -> (Vec<TbfPending>, Vec<Option<InstanceHandle>>) {
        let mut pendings = Vec::new();
        let mut instances = Vec::new();
        while let Some(mut node) = self.nodes.pop_front() {
            if let Some(p) = node.pending.take() {
                pendings.push(p);
            }
            instances.push(node.instance);
        }
        (pendings, instances)
    }

    /// Delay until the next expiry relative to `now`.
    pub fn next_check(&self, now: Timestamp) -> Option<Duration> {
        self.nodes.front().map(|head| {
            head.tx_time
                .diff(now)
                .to_duration()
                .max(Duration::from_millis(1))
        })
    }
}
