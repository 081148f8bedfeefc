// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic QoS scans: deadline, lifespan and the two autopurge policies.
//!
//! One entry point drives all four. Each invocation scans the cache at the
//! given `now`, performs the expirations that are due, and returns the
//! number of scheduling ticks until the next check; zero means the scan
//! went idle and must be restarted by the add path. A floor of
//! [`MIN_XQOS_DELAY`] ticks keeps a crowded cache from rescheduling in a
//! storm.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::HistoryCache;
use crate::instance::InstSlot;
use crate::monitor;
use crate::refs::{Chain, NIL};
use crate::sample::clone_ref;
use crate::types::{Ticks, Timestamp, WriterHandle, NIL_HANDLE};

/// Minimum reschedule delay in ticks.
pub const MIN_XQOS_DELAY: Ticks = 40;

/// Which periodic scan to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    /// DEADLINE missed detection.
    Deadline,
    /// LIFESPAN expiry of individual samples.
    Lifespan,
    /// Autopurge of fully unregistered instances.
    AutopurgeNoWriters,
    /// Autopurge of disposed instances.
    AutopurgeDisposed,
}

struct ScanState {
    now: Timestamp,
    period: Timestamp,
    next: Timestamp,
    nalive: u32,
}

impl HistoryCache {
    /// Run one periodic QoS scan.
    ///
    /// `writer` scopes a reader-side lifespan scan to samples of one
    /// writer (`NIL_HANDLE` matches all). Returns the ticks until the next
    /// check, or 0 when the scan went idle.
    pub fn handle_xqos(
        self: &Arc<Self>,
        kind: GuardKind,
        writer: WriterHandle,
        period: Ticks,
        now: Timestamp,
    ) -> Ticks {
        let mut g = self.lock();
        let period_ts = Timestamp::from_duration(crate::types::ticks_to_duration(period));
        let mut scan = ScanState {
            now,
            period: period_ts,
            next: Timestamp::ZERO,
            nalive: 0,
        };

        if !g.qos.multi_instance {
            // Only the deadline applies to single-instance caches.
            if kind != GuardKind::Deadline || !g.qos.deadline || g.si_deadlined {
                return 0;
            }
            let last = match g.changes.tail() {
                Some(idx) => g.refs.node(idx).sample.time,
                None => g.changes.empty_time(),
            };
            let due = last.add(scan.period);
            if due < now {
                g.si_deadlined = true;
                g.dlc_idle = true;
                self.fire_deadline_missed(&g, NIL_HANDLE);
                return 0;
            }
            scan.next = due;
            scan.nalive = 1;
        } else {
            g.instances.enter_walk();
            for handle in g.instances.walk_handles() {
                let Some(slot) = g.instances.slot_by_handle(handle) else {
                    continue;
                };
                match kind {
                    GuardKind::Deadline => {
                        if g.qos.deadline && self.check_deadline(&mut g, slot, &mut scan) {
                            scan.nalive += 1;
                        }
                    }
                    GuardKind::Lifespan => {
                        if self.check_lifespan(&mut g, slot, writer, &mut scan) {
                            scan.nalive += 1;
                        }
                    }
                    GuardKind::AutopurgeNoWriters => {
                        if g.qos.autopurge_no_writers
                            && self.check_autopurge(&mut g, slot, false, &mut scan)
                        {
                            scan.nalive += 1;
                        }
                    }
                    GuardKind::AutopurgeDisposed => {
                        if g.qos.autopurge_disposed
                            && self.check_autopurge(&mut g, slot, true, &mut scan)
                        {
                            scan.nalive += 1;
                        }
                    }
                }
            }
            g.instances.exit_walk();

            if scan.nalive == 0 {
                match kind {
                    GuardKind::Deadline => g.dlc_idle = true,
                    GuardKind::Lifespan => g.lsc_idle = true,
                    GuardKind::AutopurgeNoWriters => g.apw_idle = true,
                    GuardKind::AutopurgeDisposed => g.apd_idle = true,
                }
                log::debug!("[XQOS] {kind:?} scan idle on cache {}", self.id());
                return 0;
            }
        }

        let ticks = scan.next.diff(scan.now).as_ticks();
        ticks.max(MIN_XQOS_DELAY)
    }

    fn fire_deadline_missed(
        &self,
        g: &parking_lot::MutexGuard<'_, crate::cache::CacheState>,
        handle: crate::types::InstanceHandle,
    ) {
        log::debug!("[XQOS] deadline missed on cache {} instance {handle}", self.id());
        if let Some(listener) = &g.qos.listener {
            if g.is_writer() {
                listener.on_offered_deadline_missed(handle);
            } else {
                listener.on_requested_deadline_missed(handle);
            }
        }
    }

    /// Deadline check for one instance. True while the instance still has
    /// a pending deadline.
    fn check_deadline(
        self: &Arc<Self>,
        g: &mut parking_lot::MutexGuard<'_, crate::cache::CacheState>,
        slot: InstSlot,
        scan: &mut ScanState,
    ) -> bool {
        if g.instances.get(slot).deadlined {
            return false;
        }
        let (handle, last) = {
            let inst = g.instances.get(slot);
            let last = match inst.list.tail() {
                Some(idx) => g.refs.node(idx).sample.time,
                None => inst.list.empty_time(),
            };
            (inst.handle, last)
        };
        let due = last.add(scan.period);
        if due < scan.now {
            g.instances.get_mut(slot).deadlined = true;
            self.fire_deadline_missed(g, handle);
            return false;
        }
        if scan.next.is_zero() || due < scan.next {
            scan.next = due;
        }
        true
    }

    /// Lifespan check: expired samples are removed unless outstanding acks
    /// force an immediate recheck. True while samples remain under watch.
    fn check_lifespan(
        self: &Arc<Self>,
        g: &mut parking_lot::MutexGuard<'_, crate::cache::CacheState>,
        slot: InstSlot,
        writer: WriterHandle,
        scan: &mut ScanState,
    ) -> bool {
        {
            let inst = g.instances.get(slot);
            if inst.list.is_empty() {
                return false;
            }
            if !g.is_writer() {
                if inst.writers.is_empty() {
                    return false;
                }
                if writer != NIL_HANDLE && !inst.writers.contains(writer) {
                    return false;
                }
            }
        }

        // Snapshot the instance chain; removal invalidates walks.
        let samples: Vec<_> = {
            let mut out = Vec::new();
            let mut idx = g.instances.get(slot).list.head().unwrap_or(NIL);
            while idx != NIL {
                out.push(clone_ref(&g.refs.node(idx).sample));
                idx = g.refs.next(Chain::Inst, idx);
            }
            out
        };

        let reader = !g.is_writer();
        for sample in samples {
            if reader && writer != NIL_HANDLE && sample.writer != writer {
                continue;
            }
            let due = sample.time.add(scan.period);
            if due > scan.now {
                // List is time ordered: the rest survive too.
                if scan.next.is_zero() || due < scan.next {
                    scan.next = due;
                }
                return true;
            }
            if g.qos.must_ack() && sample.acks_pending() > 0 {
                // Still on the wire; recheck as fast as possible.
                scan.next = scan.now;
                return true;
            }
            if sample.acks_pending() > 0 {
                let n = sample.clear_acks();
                g.unacked = g.unacked.saturating_sub(u32::from(n));
                if g.monitor {
                    if let Some(mon) = monitor::installed() {
                        mon.remove_change(g.mon_user, &sample);
                    }
                }
            }
            let _ = self.remove_change(g, &sample, false);
            let inst = g.instances.get(slot);
            if inst.list.is_empty() && g.is_writer() && inst.kind.is_unregistered() {
                self.free_instance(g, slot);
                return false;
            }
        }
        false
    }

    /// Autopurge check. `disposed` selects the disposed variant, else the
    /// no-writers variant. True while the instance still waits for its
    /// purge time.
    fn check_autopurge(
        self: &Arc<Self>,
        g: &mut parking_lot::MutexGuard<'_, crate::cache::CacheState>,
        slot: InstSlot,
        disposed: bool,
        scan: &mut ScanState,
    ) -> bool {
        let (matches, last) = {
            let inst = g.instances.get(slot);
            let matches = if disposed {
                inst.kind.is_disposed()
            } else {
                inst.kind.is_unregistered()
            };
            let last = match inst.list.tail() {
                Some(idx) => g.refs.node(idx).sample.time,
                None => inst.list.empty_time(),
            };
            (matches, last)
        };
        if !matches {
            return false;
        }
        let due = last.add(scan.period);
        if due > scan.now {
            if scan.next.is_zero() || due < scan.next {
                scan.next = due;
            }
            return true;
        }
        // Purge the whole instance.
        loop {
            let head = {
                let inst = g.instances.get(slot);
                inst.list
                    .head()
                    .map(|idx| clone_ref(&g.refs.node(idx).sample))
            };
            let Some(head) = head else { break };
            let _ = self.remove_change(g, &head, false);
        }
        self.free_instance(g, slot);
        false
    }

    /// Drive the time-based filter: dispatch pending samples whose window
    /// elapsed and return the delay until the next expiry.
    pub fn tbf_timeout(self: &Arc<Self>, now: Timestamp) -> Option<Duration> {
        let mut g = self.lock();
        let Some(ctx) = g.tbf.as_mut() else {
            return None;
        };
        let expiry = ctx.expire(now);
        for instance in expiry.retired {
            let Some(handle) = instance else { continue };
            let Some(slot) = g.instances.slot_by_handle(handle) else {
                continue;
            };
            let idle = {
                let inst = g.instances.get_mut(slot);
                inst.tbf_refs = inst.tbf_refs.saturating_sub(1);
                inst.is_idle()
            };
            if idle {
                self.free_instance(&mut g, slot);
            }
        }
        for pending in expiry.send {
            let slot = if g.qos.multi_instance {
                let handle = pending.hci.map_or(pending.sample.handle, |h| h.0);
                g.instances.slot_by_handle(handle)
            } else {
                None
            };
            if g.qos.multi_instance && slot.is_none() {
                log::debug!("[TBF] pending sample dropped, instance gone");
                continue;
            }
            if let Err(e) = self.do_add_public(&mut g, pending.sample, slot, pending.rel) {
                log::debug!("[TBF] pending delivery failed: {e}");
            }
        }
        expiry.next
    }

    /// Delay until the next time-based-filter expiry.
    pub fn tbf_next_check(&self, now: Timestamp) -> Option<Duration> {
        let g = self.lock();
        g.tbf.as_ref().and_then(|ctx| ctx.next_check(now))
    }
}
