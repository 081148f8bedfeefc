// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The per-endpoint history cache: admission, storage, and the contract
//! exposed to DCPS and RTPS.
//!
//! # Architecture
//!
//! ```text
//! DCPS write  -> add_inst/add_key -> admission -> lists/index -> local
//!                                                               transfer
//! RTPS recv   -> add_received ----> (time-based filter) -> admission
//! DCPS read   -> get/get_data ----> done
//! RTPS acks   -> acknowledged ----> waiter wake / volatile reclaim
//! QoS timers  -> handle_xqos  ----> deadline / lifespan / autopurge
//! ```
//!
//! All mutable state sits behind one `parking_lot` mutex per cache; this is
//! the per-endpoint lock of the concurrency model. The only operations that
//! block are `wait_acks` and reliable KEEP_ALL admission with a non-zero
//! blocking time.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::filter::{KeySupport, Md5KeySupport, SampleFilter, SampleOrder};
use crate::index::InstanceTable;
use crate::instance::InstSlot;
use crate::listener::RejectCause;
use crate::monitor;
use crate::pool::{self, PoolClass, PoolToken};
use crate::qos::{AccessScope, CacheOptions, CacheRole, History, LENGTH_UNLIMITED};
use crate::refs::{Chain, ChangeList, RefArena, RefIdx, NIL};
use crate::sample::{clone_ref, ChangeKind, InstanceState, Payload, Sample, ViewState};
use crate::tbf::{TbfContext, TbfOutcome, TbfPending};
use crate::transfer;
use crate::types::{
    GuidPrefix, Hci, InstanceHandle, KeyHash, SequenceNumber, Timestamp, WriterHandle,
    NIL_HANDLE,
};
use crate::waiter;
use crate::{Error, Result};

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Sample categories excluded from `get`/`avail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipMask(pub u16);

impl SkipMask {
    /// Exclude nothing.
    pub const NONE: SkipMask = SkipMask(0);
    /// Exclude already-read samples.
    pub const READ: SkipMask = SkipMask(1);
    /// Exclude not-yet-read samples.
    pub const NOT_READ: SkipMask = SkipMask(2);
    /// Exclude samples of new-view instances.
    pub const NEW_VIEW: SkipMask = SkipMask(4);
    /// Exclude samples of not-new-view instances.
    pub const OLD_VIEW: SkipMask = SkipMask(8);
    /// Exclude samples of alive instances.
    pub const ALIVE: SkipMask = SkipMask(16);
    /// Exclude samples of disposed instances.
    pub const DISPOSED: SkipMask = SkipMask(32);
    /// Exclude samples of no-writer instances.
    pub const NO_WRITERS: SkipMask = SkipMask(64);

    /// True when every bit of `other` is set.
    pub fn has(self, other: SkipMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SkipMask {
    type Output = SkipMask;
    fn bitor(self, rhs: SkipMask) -> SkipMask {
        SkipMask(self.0 | rhs.0)
    }
}

/// Parameters of a `get` call.
#[derive(Default)]
pub struct GetSpec<'a> {
    /// Categories to exclude.
    pub skipmask: SkipMask,
    /// Content/query filter evaluated per candidate.
    pub filter: Option<&'a dyn SampleFilter>,
    /// Ordering program applied to the result set.
    pub order: Option<&'a dyn SampleOrder>,
    /// Instance selector (0 = any instance).
    pub handle: InstanceHandle,
    /// With a non-zero handle: first instance with data above it.
    pub next: bool,
    /// Unlink returned samples from the cache (take semantics).
    pub remove: bool,
}

impl<'a> GetSpec<'a> {
    /// Any instance, no filtering.
    pub fn any() -> Self {
        Self::default()
    }

    /// Take (destructive) variant of [`GetSpec::any`].
    pub fn take() -> Self {
        Self {
            remove: true,
            ..Self::default()
        }
    }
}

/// Aggregate counters of a cache (diagnostics and invariant checks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Samples linked in the cache-wide list.
    pub nchanges: u32,
    /// Alive samples cache-wide.
    pub ndata: u32,
    /// Live instances.
    pub ninstances: u32,
    /// Outstanding acknowledgements.
    pub unacked: u32,
    /// Back-pressure / wait flag.
    pub blocked: bool,
    /// Instance index currently promoted.
    pub skiplists: bool,
}

/// Snapshot of one instance (diagnostics and tests).
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    /// Lifecycle state.
    pub kind: InstanceState,
    /// View state.
    pub view: ViewState,
    /// Linked samples.
    pub nchanges: u32,
    /// Alive samples.
    pub ndata: u32,
    /// Exclusive owner (NIL when unowned).
    pub owner: WriterHandle,
    /// Writers currently publishing here.
    pub writers: Vec<WriterHandle>,
    /// Registered through `register`.
    pub registered: bool,
    /// Flagged recoverable.
    pub recover: bool,
}

pub(crate) struct MatchedReader {
    pub cache: Arc<HistoryCache>,
    pub endpoint: WriterHandle,
    pub filter: Option<Arc<dyn SampleFilter>>,
    pub _token: PoolToken,
}

pub(crate) struct PendingAdd {
    sample: Sample,
    rel: bool,
}

pub(crate) struct CacheState {
    pub qos: CacheOptions,
    pub enabled: bool,
    pub closed: bool,
    pub refs: RefArena,
    pub changes: ChangeList,
    pub instances: InstanceTable,
    // Single-instance caches keep the per-instance state inline.
    pub si_kind: InstanceState,
    pub si_view: ViewState,
    pub si_disp_cnt: u32,
    pub si_no_w_cnt: u32,
    pub si_deadlined: bool,
    pub ndata: u32,
    pub last_seqnr: SequenceNumber,
    pub unacked: u32,
    pub blocked: bool,
    pub pending_add: Option<PendingAdd>,
    /// Side channel returning a back-pressured sample to the local
    /// transfer path so it can queue it as a pending transfer.
    pub refused_sample: Option<Sample>,
    pub readers: Vec<MatchedReader>,
    pub monitor: bool,
    pub mon_user: u64,
    pub inform: bool,
    pub notify: Option<(Arc<dyn Fn(u64) + Send + Sync>, u64)>,
    pub tbf: Option<TbfContext>,
    pub dlc_idle: bool,
    pub lsc_idle: bool,
    pub apw_idle: bool,
    pub apd_idle: bool,
    pub alive: bool,
    _token: PoolToken,
}

type Guard<'a> = MutexGuard<'a, CacheState>;

impl CacheState {
    pub(crate) fn is_writer(&self) -> bool {
        self.qos.role == CacheRole::Writer
    }

    fn max_depth(&self) -> u32 {
        match self.qos.history {
            History::KeepLast(d) => d.max(1),
            History::KeepAll => self.qos.limits.max_samples_per_instance,
        }
    }

    fn max_samples(&self) -> u32 {
        self.qos.limits.max_samples
    }

    fn long_keys(&self) -> bool {
        self.qos.multi_instance
            && (self.qos.key_size == 0
                || self.qos.key_size as usize > crate::types::KEY_HASH_SIZE
                || self.qos.secure_hash)
    }

    fn hash_for(&self, key: &[u8]) -> Result<KeyHash> {
        match &self.qos.key_support {
            Some(ks) => ks.hash_from_key(key, self.qos.secure_hash),
            None => Md5KeySupport.hash_from_key(key, self.qos.secure_hash),
        }
    }

    fn reject(&self, cause: RejectCause, handle: InstanceHandle) {
        log::warn!("[CACHE] sample rejected ({cause:?}), instance {handle}");
        if let Some(listener) = &self.qos.listener {
            listener.on_sample_rejected(cause, handle);
        }
    }
}

enum KeyLookup {
    Found(InstSlot),
    Limit(RejectCause),
    NoMemory,
    NotFound,
}

/// Endpoint-scoped sample store.
pub struct HistoryCache {
    id: u64,
    state: Mutex<CacheState>,
}

impl HistoryCache {
    /// Create a cache with the given options.
    pub fn new(options: CacheOptions) -> Result<Arc<HistoryCache>> {
        let token = pool::alloc(PoolClass::Cache)?;
        let long_keys = options.multi_instance
            && (options.key_size == 0
                || options.key_size as usize > crate::types::KEY_HASH_SIZE
                || options.secure_hash);
        let state = CacheState {
            instances: InstanceTable::new(long_keys),
            qos: options,
            enabled: false,
            closed: false,
            refs: RefArena::new(),
            changes: ChangeList::new(),
            si_kind: InstanceState::UNREGISTERED,
            si_view: ViewState::New,
            si_disp_cnt: 0,
            si_no_w_cnt: 0,
            si_deadlined: false,
            ndata: 0,
            last_seqnr: SequenceNumber::ZERO,
            unacked: 0,
            blocked: false,
            pending_add: None,
            refused_sample: None,
            readers: Vec::new(),
            monitor: false,
            mon_user: 0,
            inform: false,
            notify: None,
            tbf: None,
            dlc_idle: false,
            lsc_idle: false,
            apw_idle: false,
            apd_idle: false,
            alive: false,
            _token: token,
        };
        Ok(Arc::new(HistoryCache {
            id: NEXT_CACHE_ID.fetch_add(1, AtomicOrdering::Relaxed),
            state: Mutex::new(state),
        }))
    }

    /// Unique id of this cache.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn lock(&self) -> Guard<'_> {
        self.state.lock()
    }

    /// Mark the cache operational.
    pub fn enable(&self) {
        let mut g = self.lock();
        g.enabled = true;
        log::debug!("[CACHE] cache {} enabled", self.id);
    }

    /// True once `enable` ran.
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Liveliness flag, set by `alive` and by sample arrival under the
    /// LIVELINESS policy.
    pub fn is_alive(&self) -> bool {
        self.lock().alive
    }

    /// Apply an updated QoS bundle.
    ///
    /// Structural settings (role, multi-instance, key size) must not change;
    /// policy flags and limits are re-read on the next operation.
    pub fn qos_update(&self, options: CacheOptions) {
        let mut g = self.lock();
        if options.tbf_separation.is_none() {
            if let Some(mut ctx) = g.tbf.take() {
                let (pendings, _) = ctx.drain();
                drop(pendings);
            }
        }
        g.qos = options;
        log::debug!("[CACHE] cache {} qos updated", self.id);
    }

    /// Current options snapshot.
    pub(crate) fn options(&self) -> CacheOptions {
        self.lock().qos.clone()
    }

    /// Aggregate counters.
    pub fn stats(&self) -> CacheStats {
        let g = self.lock();
        CacheStats {
            nchanges: g.changes.count,
            ndata: g.ndata,
            ninstances: g.instances.count(),
            unacked: g.unacked,
            blocked: g.blocked,
            skiplists: g.instances.uses_skiplists(),
        }
    }

    /// Snapshot one instance by handle.
    pub fn instance_info(&self, handle: InstanceHandle) -> Option<InstanceInfo> {
        let g = self.lock();
        let slot = g.instances.slot_by_handle(handle)?;
        let inst = g.instances.get(slot);
        Some(InstanceInfo {
            kind: inst.kind,
            view: inst.view,
            nchanges: inst.list.count,
            ndata: inst.ndata,
            owner: inst.owner,
            writers: inst.writers.as_slice().to_vec(),
            registered: inst.registered,
            recover: inst.recover,
        })
    }

    /// Sequence numbers: (oldest available, next to assign).
    pub fn seqnr_info(&self) -> (SequenceNumber, SequenceNumber) {
        let g = self.lock();
        let mut next = g.last_seqnr;
        next.bump();
        let min = g
            .changes
            .head()
            .map_or(next, |idx| g.refs.node(idx).sample.seqnr);
        (min, next)
    }

    /// Hash and key bytes of an instance.
    pub fn inst_info(&self, hci: Hci) -> Result<(KeyHash, Option<Arc<[u8]>>)> {
        let g = self.lock();
        let slot = g
            .instances
            .slot_by_handle(hci.0)
            .ok_or(Error::AlreadyDeleted)?;
        let inst = g.instances.get(slot);
        Ok((inst.hash, inst.key.clone()))
    }

    // ========================================================================
    // Registration and lookup
    // ========================================================================

    /// Register an instance for `key`, creating it if needed.
    pub fn register(&self, key: &[u8], _now: Timestamp) -> Result<(Hci, InstanceHandle)> {
        let mut g = self.lock();
        if !g.qos.multi_instance {
            return Err(Error::PreconditionNotMet);
        }
        let slot = match self.instance_for_key(&mut g, None, Some(key), true, false, 0)? {
            KeyLookup::Found(slot) => slot,
            KeyLookup::NotFound => unreachable!("add-mode lookup cannot miss"),
            KeyLookup::Limit(_) | KeyLookup::NoMemory => return Err(Error::OutOfResources),
        };
        let inst = g.instances.get_mut(slot);
        inst.registered = true;
        Ok((Hci(inst.handle), inst.handle))
    }

    /// Non-mutating lookup by key.
    pub fn lookup_key(&self, key: &[u8]) -> Result<Option<(Hci, InstanceHandle)>> {
        let mut g = self.lock();
        if !g.qos.multi_instance {
            return Err(Error::PreconditionNotMet);
        }
        match self.instance_for_key(&mut g, None, Some(key), false, false, 0)? {
            KeyLookup::Found(slot) => {
                let h = g.instances.get(slot).handle;
                Ok(Some((Hci(h), h)))
            }
            _ => Ok(None),
        }
    }

    /// Lookup by hash, optionally creating the instance.
    pub fn lookup_hash(
        &self,
        hash: &KeyHash,
        key: Option<&[u8]>,
        add: bool,
    ) -> Result<Option<(Hci, InstanceHandle)>> {
        let mut g = self.lock();
        if !g.qos.multi_instance {
            return Err(Error::PreconditionNotMet);
        }
        match self.instance_for_key(&mut g, Some(*hash), key, add, false, 0)? {
            KeyLookup::Found(slot) => {
                let h = g.instances.get(slot).handle;
                Ok(Some((Hci(h), h)))
            }
            KeyLookup::NotFound => Ok(None),
            KeyLookup::Limit(_) | KeyLookup::NoMemory => Err(Error::OutOfResources),
        }
    }

    /// Free an instance by handle.
    pub fn inst_free(&self, handle: InstanceHandle) {
        let mut g = self.lock();
        if let Some(slot) = g.instances.slot_by_handle(handle) {
            self.free_instance(&mut g, slot);
        }
    }

    /// Free an instance by key.
    pub fn inst_done(&self, key: &[u8]) {
        let mut g = self.lock();
        let Ok(hash) = g.hash_for(key) else { return };
        if let Some(slot) = g.instances.find_by_key(&hash, Some(key)) {
            self.free_instance(&mut g, slot);
        }
    }

    /// Purge every instance whose key hash starts with `prefix` (remote
    /// participant death for keyed built-ins).
    pub fn reclaim_keyed(&self, prefix: &GuidPrefix) {
        let mut g = self.lock();
        g.instances.enter_walk();
        for handle in g.instances.walk_handles() {
            let Some(slot) = g.instances.slot_by_handle(handle) else {
                continue;
            };
            if g.instances.get(slot).hash.starts_with_prefix(prefix) {
                self.free_instance(&mut g, slot);
            }
        }
        g.instances.exit_walk();
    }

    // ========================================================================
    // Adding samples
    // ========================================================================

    /// Pre-flight room check for single-instance caches.
    ///
    /// Sets the blocked flag when the cache is exactly full so the ack path
    /// knows someone is throttled.
    pub fn accepts(&self, ooo: u32) -> bool {
        let mut g = self.lock();
        if ooo == 0 && g.changes.count == g.max_samples() {
            g.blocked = true;
        }
        g.changes.count + ooo < g.max_samples()
    }

    /// Add a sample to an instance known by handle (or to a single-instance
    /// cache).
    pub fn add_inst(self: &Arc<Self>, sample: Sample, hci: Option<Hci>, rel: bool) -> Result<()> {
        let mut g = self.lock();
        if g.closed {
            return Err(Error::AlreadyDeleted);
        }
        let slot = if g.qos.multi_instance {
            let handle = hci.map_or(sample.handle, |h| h.0);
            match g.instances.slot_by_handle(handle) {
                Some(slot) => Some(slot),
                None => {
                    log::debug!("[CACHE] add_inst: unknown instance {handle}");
                    return Err(Error::BadParameter);
                }
            }
        } else {
            None
        };
        self.do_add(&mut g, sample, slot, rel)
    }

    /// Add a sample, locating or creating the instance from hash/key.
    pub fn add_key(
        self: &Arc<Self>,
        mut sample: Sample,
        hash: &KeyHash,
        key: Option<&[u8]>,
    ) -> Result<()> {
        let mut g = self.lock();
        if g.closed {
            return Err(Error::AlreadyDeleted);
        }
        let slot = if g.qos.multi_instance {
            match self.instance_for_key(&mut g, Some(*hash), key, true, true, 0)? {
                KeyLookup::Found(slot) => Some(slot),
                KeyLookup::Limit(cause) => {
                    g.reject(cause, sample.handle);
                    return Err(Error::OutOfResources);
                }
                KeyLookup::NoMemory => return Err(Error::OutOfResources),
                KeyLookup::NotFound => unreachable!("add-mode lookup cannot miss"),
            }
        } else {
            None
        };
        if let Some(slot) = slot {
            sample.handle = g.instances.get(slot).handle;
        }
        self.do_add(&mut g, sample, slot, true)
    }

    /// Reader-side add that honours an active time-based filter.
    pub fn add_received(
        self: &Arc<Self>,
        sample: Sample,
        hci: Option<Hci>,
        rel: bool,
    ) -> Result<()> {
        let mut g = self.lock();
        if g.closed {
            return Err(Error::AlreadyDeleted);
        }
        if g.tbf.is_some() {
            let instance = hci.map(|h| h.0).or({
                if sample.handle == NIL_HANDLE {
                    None
                } else {
                    Some(sample.handle)
                }
            });
            let time = sample.time;
            let pending = TbfPending {
                sample,
                hci,
                rel,
            };
            let ctx = g.tbf.as_mut().expect("tbf present");
            match ctx.add(instance, time, pending) {
                TbfOutcome::Send { pending, first: _ } => {
                    if let Some(h) = instance {
                        if let Some(slot) = g.instances.slot_by_handle(h) {
                            g.instances.get_mut(slot).tbf_refs += 1;
                        }
                    }
                    return self.finish_received(&mut g, pending);
                }
                TbfOutcome::SendUnfiltered(pending) => {
                    return self.finish_received(&mut g, pending);
                }
                TbfOutcome::Queued => return Ok(()),
                TbfOutcome::Replaced(old) => {
                    log::debug!("[TBF] pending sample displaced");
                    drop(old);
                    return Ok(());
                }
            }
        }
        let slot = if g.qos.multi_instance {
            let handle = hci.map_or(sample.handle, |h| h.0);
            g.instances.slot_by_handle(handle)
        } else {
            None
        };
        if g.qos.multi_instance && slot.is_none() {
            return Err(Error::BadParameter);
        }
        self.do_add(&mut g, sample, slot, rel)
    }

    /// Accept a locally transferred sample (writer→reader zero-hop path).
    ///
    /// Looks up or creates the instance from `(hash, key)`, runs the
    /// time-based filter when `filtered`, then admits the sample. On
    /// back-pressure the sample is returned so the caller can queue it as
    /// a pending transfer.
    pub(crate) fn deliver_local(
        self: &Arc<Self>,
        mut sample: Sample,
        hash: &KeyHash,
        key: Option<&Arc<[u8]>>,
        rel: bool,
        filtered: bool,
    ) -> std::result::Result<(), (Error, Option<Sample>)> {
        let mut g = self.lock();
        if g.closed {
            return Err((Error::AlreadyDeleted, None));
        }
        let mut slot = None;
        if g.qos.multi_instance {
            match self.instance_for_key(
                &mut g,
                Some(*hash),
                key.map(|k| k.as_ref()),
                true,
                false,
                0,
            ) {
                Ok(KeyLookup::Found(s)) => {
                    slot = Some(s);
                    sample.handle = g.instances.get(s).handle;
                }
                Ok(KeyLookup::Limit(cause)) => {
                    let handle = sample.handle;
                    g.reject(cause, handle);
                    return Err((Error::OutOfResources, None));
                }
                Ok(_) | Err(_) => return Err((Error::OutOfResources, None)),
            }
        }
        if filtered && g.tbf.is_some() {
            let hci = slot.map(|s| Hci(g.instances.get(s).handle));
            let instance = hci.map(|h| h.0);
            let time = sample.time;
            let pending = TbfPending { sample, hci, rel };
            let ctx = g.tbf.as_mut().expect("tbf present");
            match ctx.add(instance, time, pending) {
                TbfOutcome::Send { pending, first: _ } => {
                    if let Some(s) = slot {
                        g.instances.get_mut(s).tbf_refs += 1;
                    }
                    sample = pending.sample;
                }
                TbfOutcome::SendUnfiltered(pending) => sample = pending.sample,
                TbfOutcome::Queued => return Ok(()),
                TbfOutcome::Replaced(old) => {
                    drop(old);
                    return Ok(());
                }
            }
        }
        match self.do_add(&mut g, sample, slot, rel) {
            Ok(()) => Ok(()),
            Err(Error::NoData) => {
                let refused = g.refused_sample.take();
                Err((Error::NoData, refused))
            }
            Err(e) => Err((e, None)),
        }
    }

    fn finish_received(self: &Arc<Self>, g: &mut Guard<'_>, pending: TbfPending) -> Result<()> {
        let slot = if g.qos.multi_instance {
            let handle = pending.hci.map_or(pending.sample.handle, |h| h.0);
            match g.instances.slot_by_handle(handle) {
                Some(slot) => Some(slot),
                None => return Err(Error::BadParameter),
            }
        } else {
            None
        };
        self.do_add(g, pending.sample, slot, pending.rel)
    }

    /// Write a dispose record.
    pub fn dispose(
        self: &Arc<Self>,
        writer: WriterHandle,
        handle: InstanceHandle,
        hci: Option<Hci>,
        now: Timestamp,
        dests: &[WriterHandle],
    ) -> Result<()> {
        self.release(writer, handle, hci, ChangeKind::Disposed, now, dests)
    }

    /// Write an unregister record; upgrades to a zombie (dispose +
    /// unregister) when auto-dispose is configured.
    pub fn unregister(
        self: &Arc<Self>,
        writer: WriterHandle,
        handle: InstanceHandle,
        hci: Option<Hci>,
        now: Timestamp,
        dests: &[WriterHandle],
    ) -> Result<()> {
        let kind = if self.lock().qos.auto_dispose {
            ChangeKind::Zombie
        } else {
            ChangeKind::Unregistered
        };
        self.release(writer, handle, hci, kind, now, dests)
    }

    /// Write a lifecycle record of `kind` for an instance.
    pub fn release(
        self: &Arc<Self>,
        writer: WriterHandle,
        handle: InstanceHandle,
        hci: Option<Hci>,
        kind: ChangeKind,
        now: Timestamp,
        dests: &[WriterHandle],
    ) -> Result<()> {
        let mut g = self.lock();
        if g.closed {
            return Err(Error::AlreadyDeleted);
        }
        self.release_locked(&mut g, writer, handle, hci, kind, now, dests)
    }

    fn release_locked(
        self: &Arc<Self>,
        g: &mut Guard<'_>,
        writer: WriterHandle,
        handle: InstanceHandle,
        hci: Option<Hci>,
        kind: ChangeKind,
        now: Timestamp,
        dests: &[WriterHandle],
    ) -> Result<()> {
        // Nobody stores lifecycle records on a plain volatile writer with no
        // local readers; just refresh liveliness.
        if g.is_writer()
            && !g.qos.durability.is_durable()
            && !g.monitor
            && g.readers.is_empty()
            && !g.qos.deadline
        {
            g.alive = true;
            if let Some(listener) = &g.qos.listener {
                listener.on_liveliness_restored(writer);
            }
            return Ok(());
        }
        if dests.len() > crate::sample::MAX_DESTS {
            return Err(Error::OutOfResources);
        }
        let mut sample = Sample::new(kind, writer, now, Payload::None)?;
        sample.handle = handle;
        for (i, d) in dests.iter().enumerate() {
            sample.dests[i] = *d;
        }
        let slot = if g.qos.multi_instance {
            let h = hci.map_or(handle, |h| h.0);
            match g.instances.slot_by_handle(h) {
                Some(slot) => Some(slot),
                None => return Err(Error::BadParameter),
            }
        } else {
            None
        };
        self.do_add(g, sample, slot, false)
    }

    /// Refresh liveliness on this endpoint and its matched local readers.
    pub fn alive(&self) {
        let readers: Vec<Arc<HistoryCache>> = {
            let mut g = self.lock();
            g.alive = true;
            if let Some(listener) = &g.qos.listener {
                listener.on_liveliness_restored(NIL_HANDLE);
            }
            if g.monitor {
                if let Some(mon) = monitor::installed() {
                    mon.alive(g.mon_user);
                }
            }
            if g.is_writer() {
                g.readers.iter().map(|r| Arc::clone(&r.cache)).collect()
            } else {
                Vec::new()
            }
        };
        for reader in readers {
            let g = reader.lock();
            if let Some(listener) = &g.qos.listener {
                listener.on_liveliness_restored(NIL_HANDLE);
            }
        }
    }

    // ------------------------------------------------------------------
    // Core admission path
    // ------------------------------------------------------------------

    fn do_add(
        self: &Arc<Self>,
        g: &mut Guard<'_>,
        mut sample: Sample,
        slot: Option<InstSlot>,
        rel: bool,
    ) -> Result<()> {
        let writer = g.is_writer();
        let multi = g.qos.multi_instance;
        g.refused_sample = None;

        if multi {
            let slot = slot.ok_or(Error::BadParameter)?;

            // A fresh sample ends a missed-deadline episode.
            if g.instances.get(slot).deadlined {
                g.instances.get_mut(slot).deadlined = false;
                g.dlc_idle = false;
            }

            if !writer && !self.reader_writer_set_update(g, slot, &mut sample)? {
                return Ok(()); // Sample absorbed (unregister bookkeeping or non-owner drop).
            }

            // Additional not-alive info on a not-alive instance only merges
            // state.
            let inst_kind = g.instances.get(slot).kind;
            if !inst_kind.is_alive() && !sample.kind.is_alive() {
                let inst = g.instances.get_mut(slot);
                inst.kind = inst.kind.merged(sample.kind);
                if inst.kind.is_unregistered() && inst.list.is_empty() && inst.tbf_refs == 0 {
                    self.free_instance(g, slot);
                }
                return Ok(());
            }

            // Per-instance depth.
            let depth = g.max_depth();
            let over_depth = |g: &Guard<'_>| {
                let inst = g.instances.get(slot);
                (g.qos.ref_type && inst.list.count >= depth)
                    || (sample.kind.is_alive() && inst.ndata >= depth)
            };
            if over_depth(g) {
                loop {
                    let head = {
                        let inst = g.instances.get(slot);
                        inst.list.head().map(|idx| clone_ref(&g.refs.node(idx).sample))
                    };
                    let Some(head) = head else { break };
                    match self.remove_change(g, &head, rel) {
                        Ok(()) => {
                            if !(sample.kind.is_alive()
                                && g.instances.get(slot).ndata >= depth)
                                && !(g.qos.ref_type
                                    && g.instances.get(slot).list.count >= depth)
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            return self.admission_failed(
                                g,
                                sample,
                                rel,
                                e,
                                RejectCause::SamplesPerInstanceLimit,
                            );
                        }
                    }
                }
            }
        } else {
            if g.si_deadlined {
                g.si_deadlined = false;
                g.dlc_idle = false;
            }
            let depth = g.max_depth();
            while (g.qos.ref_type && g.changes.count >= depth)
                || (sample.kind.is_alive() && g.ndata >= depth)
            {
                let Some(head) = g
                    .changes
                    .head()
                    .map(|idx| clone_ref(&g.refs.node(idx).sample))
                else {
                    break;
                };
                if let Err(e) = self.remove_change(g, &head, rel) {
                    return self.admission_failed(
                        g,
                        sample,
                        rel,
                        e,
                        RejectCause::SamplesPerInstanceLimit,
                    );
                }
            }
        }

        // Cache-wide sample limit.
        let max_samples = g.max_samples();
        while (g.qos.ref_type && g.changes.count >= max_samples)
            || (sample.kind.is_alive() && g.ndata >= max_samples)
        {
            let Some(head) = g
                .changes
                .head()
                .map(|idx| clone_ref(&g.refs.node(idx).sample))
            else {
                break;
            };
            if let Err(e) = self.remove_change(g, &head, rel) {
                return self.admission_failed(
                    g,
                    sample,
                    rel,
                    e,
                    RejectCause::SamplesLimit,
                );
            }
        }

        // Liveliness refresh.
        if g.qos.liveliness {
            g.alive = true;
            if let Some(listener) = &g.qos.listener {
                listener.on_liveliness_restored(sample.writer);
            }
        }

        // Sequence number (writer) / generation snapshot (reader).
        if writer {
            g.last_seqnr.bump();
            sample.seqnr = g.last_seqnr;
        } else {
            let (disp, no_w) = match slot {
                Some(slot) => {
                    let inst = g.instances.get(slot);
                    (inst.disp_cnt, inst.no_w_cnt)
                }
                None => (g.si_disp_cnt, g.si_no_w_cnt),
            };
            sample.disp_cnt = disp;
            sample.no_w_cnt = no_w;
            sample.mark_not_read();
        }

        // Generation counters and instance-state transition.
        self.apply_kind_transition(g, slot, &sample);

        self.insert_change(g, sample, slot, rel)
    }

    /// Reader-side writer-set and ownership bookkeeping. Returns `false`
    /// when the sample was fully absorbed here.
    fn reader_writer_set_update(
        self: &Arc<Self>,
        g: &mut Guard<'_>,
        slot: InstSlot,
        sample: &mut Sample,
    ) -> Result<bool> {
        let exclusive = g.qos.ownership == crate::qos::OwnershipKind::Exclusive;
        let mut new_writer = false;

        if sample.kind.is_unregistered() {
            let owner_gone = {
                let inst = g.instances.get_mut(slot);
                let only_this = inst.writers.len() == 1
                    && inst.writers.as_slice()[0] == sample.writer;
                if inst.writers.is_empty() || only_this {
                    inst.writers.clear();
                    inst.owner = NIL_HANDLE;
                    false
                } else {
                    let was_owner = sample.writer == inst.owner;
                    inst.writers.remove(sample.writer) && exclusive && was_owner
                }
            };
            if owner_gone {
                let dir = g.qos.writer_directory.clone();
                g.instances.get_mut(slot).update_owner(dir.as_deref());
            }
            let inst = g.instances.get(slot);
            if sample.kind == ChangeKind::Unregistered && !inst.writers.is_empty() {
                // Other writers remain; the instance stays alive.
                return Ok(false);
            }
            if !inst.writers.is_empty() {
                // Zombie from one writer of several: keep the dispose part.
                sample.kind = ChangeKind::from_bits(sample.kind.bits() & !2);
            }
        } else {
            let inst = g.instances.get_mut(slot);
            if inst.writers.is_empty() {
                inst.writers.insert(sample.writer)?;
                inst.owner = if exclusive { sample.writer } else { NIL_HANDLE };
            } else if !inst.writers.contains(sample.writer) {
                inst.writers.insert(sample.writer)?;
                new_writer = true;
            }
            if exclusive {
                if new_writer {
                    let dir = g.qos.writer_directory.clone();
                    g.instances.get_mut(slot).update_owner(dir.as_deref());
                }
                let inst = g.instances.get(slot);
                if inst.owner != NIL_HANDLE && sample.writer != inst.owner {
                    log::debug!(
                        "[CACHE] non-owner writer {} dropped on instance {}",
                        sample.writer,
                        inst.handle
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn apply_kind_transition(
        &self,
        g: &mut Guard<'_>,
        slot: Option<InstSlot>,
        sample: &Sample,
    ) {
        let old_kind = match slot {
            Some(slot) => g.instances.get(slot).kind,
            None => g.si_kind,
        };
        if InstanceState::from_kind(sample.kind) == old_kind {
            return;
        }
        if old_kind.is_disposed() {
            if sample.kind.is_alive() {
                match slot {
                    Some(slot) => {
                        let inst = g.instances.get_mut(slot);
                        inst.disp_cnt += 1;
                        inst.view = ViewState::New;
                    }
                    None => {
                        g.si_disp_cnt += 1;
                        g.si_view = ViewState::New;
                    }
                }
            }
            g.apd_idle = false;
        } else if old_kind.is_unregistered() {
            if sample.kind.is_alive() {
                match slot {
                    Some(slot) => {
                        let inst = g.instances.get_mut(slot);
                        inst.no_w_cnt += 1;
                        inst.view = ViewState::New;
                        inst.recover = false;
                    }
                    None => {
                        g.si_no_w_cnt += 1;
                        g.si_view = ViewState::New;
                    }
                }
            }
            g.apw_idle = false;
        }
        match slot {
            Some(slot) => {
                let inst = g.instances.get_mut(slot);
                inst.kind = InstanceState::from_kind(sample.kind);
                if sample.kind.is_unregistered() {
                    inst.registered = false;
                }
            }
            None => g.si_kind = InstanceState::from_kind(sample.kind),
        }
    }

    /// Admission failed while evicting. Reliable writers with a zero
    /// blocking time park the sample in the one-deep pending slot; readers
    /// surface the rejection.
    fn admission_failed(
        self: &Arc<Self>,
        g: &mut Guard<'_>,
        sample: Sample,
        rel: bool,
        err: Error,
        cause: RejectCause,
    ) -> Result<()> {
        if g.is_writer() && matches!(err, Error::NoData) {
            if g.pending_add.is_none() {
                // Solicit acks for the eviction candidate and park the new
                // sample until space frees.
                if let Some(idx) = g.changes.head() {
                    let head = clone_ref(&g.refs.node(idx).sample);
                    head.set_urgent(true);
                    if g.monitor {
                        if let Some(mon) = monitor::installed() {
                            mon.urgent_change(g.mon_user, &head);
                        }
                    }
                }
                g.pending_add = Some(PendingAdd { sample, rel });
                g.blocked = true;
                log::debug!("[CACHE] writer saturated, sample parked");
                return Ok(());
            }
            return Err(Error::NoData);
        }
        if !g.is_writer() {
            let handle = sample.handle;
            g.reject(cause, handle);
            if matches!(err, Error::NoData) {
                g.refused_sample = Some(sample);
            }
        }
        Err(err)
    }

    /// Final insertion into the lists, monitor/notify fan-out, local
    /// transfer and volatile reclaim.
    fn insert_change(
        self: &Arc<Self>,
        g: &mut Guard<'_>,
        sample: Sample,
        slot: Option<InstSlot>,
        _rel: bool,
    ) -> Result<()> {
        let ordered = g.qos.src_time_order();
        let arc = Arc::new(sample);

        let idx = g.refs.alloc(clone_ref(&arc))?;
        {
            let st = &mut **g;
            let CacheState {
                refs, changes, ..
            } = st;
            refs.link(changes, Chain::Cache, idx, ordered);
        }
        if let Some(slot) = slot {
            let st = &mut **g;
            let CacheState {
                refs, instances, ..
            } = st;
            let inst = instances.get_mut(slot);
            refs.link(&mut inst.list, Chain::Inst, idx, ordered);
            if arc.kind.is_alive() {
                inst.ndata += 1;
            }
        }
        if arc.kind.is_alive() {
            g.ndata += 1;
        }
        arc.set_cached(true);

        // Urgency heuristics plus RTPS / DCPS notification.
        if g.monitor {
            let mut urgent = false;
            if g.qos.must_ack() {
                let depth = g.max_depth();
                let max_samples = g.max_samples();
                if let Some(slot) = slot {
                    if depth != LENGTH_UNLIMITED && g.instances.get(slot).ndata >= depth / 2 {
                        urgent = true;
                    }
                }
                if max_samples != LENGTH_UNLIMITED && g.ndata >= max_samples / 2 {
                    urgent = true;
                }
            }
            if arc.kind == ChangeKind::Zombie && g.unacked > 12 {
                urgent = true;
            }
            arc.set_urgent(urgent);
            if let Some(mon) = monitor::installed() {
                let hci = slot.map(|s| Hci(g.instances.get(s).handle));
                mon.new_change(g.mon_user, &arc, hci);
            }
            arc.set_urgent(false);
            g.unacked += u32::from(arc.acks_pending());
        } else if let Some((hook, user)) = g.notify.clone() {
            hook(user);
        }

        // Local writers feed matched reader caches directly.
        if g.is_writer() {
            transfer::distribute(self, g, slot, &arc);
        }

        // Volatile writers drop fully acknowledged samples immediately.
        if g.is_writer() && !g.qos.durability.is_durable() && arc.acks_pending() == 0 {
            self.remove_change(g, &arc, false)?;
            if let Some(slot) = slot {
                let inst = g.instances.get(slot);
                if g.qos.multi_instance && inst.kind.is_unregistered() && inst.list.is_empty() {
                    self.free_instance(g, slot);
                }
            }
            return Ok(());
        }

        if g.qos.lifespan && g.lsc_idle {
            g.lsc_idle = false;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Admission entry for crate-internal callers that already hold the
    /// state lock (time-based-filter dispatch).
    pub(crate) fn do_add_public(
        self: &Arc<Self>,
        g: &mut Guard<'_>,
        sample: Sample,
        slot: Option<InstSlot>,
        rel: bool,
    ) -> Result<()> {
        self.do_add(g, sample, slot, rel)
    }

    /// Remove one change, honouring reliability.
    pub(crate) fn remove_change(
        self: &Arc<Self>,
        g: &mut Guard<'_>,
        sample: &Arc<Sample>,
        rel: bool,
    ) -> Result<()> {
        let writer = g.is_writer();
        if g.qos.must_ack() {
            if sample.acks_pending() > 0 && writer {
                if g.qos.max_blocking_time.is_zero() {
                    return Err(Error::NoData);
                }
                if self.wait_acked(g, sample) {
                    return Err(Error::Timeout);
                }
            } else if !writer && rel {
                g.blocked = true;
                return Err(Error::NoData);
            }
        } else if sample.acks_pending() > 0 {
            // Forced removal under best effort: tell RTPS to forget it.
            let n = sample.clear_acks();
            g.unacked = g.unacked.saturating_sub(u32::from(n));
            if g.monitor {
                if let Some(mon) = monitor::installed() {
                    mon.remove_change(g.mon_user, sample);
                }
            }
        }
        Self::unlink_sample(g, sample);
        Ok(())
    }

    /// Block until `sample` is fully acknowledged or the blocking time
    /// elapses. Returns `true` on timeout.
    fn wait_acked(self: &Arc<Self>, g: &mut Guard<'_>, sample: &Arc<Sample>) -> bool {
        if g.monitor {
            if let Some(mon) = monitor::installed() {
                mon.urgent_change(g.mon_user, sample);
            }
        }
        let inst_handle = if g.qos.multi_instance {
            Some(sample.handle)
        } else {
            None
        };
        if let Some(h) = inst_handle {
            if let Some(slot) = g.instances.slot_by_handle(h) {
                if g.instances.get(slot).wait {
                    return true;
                }
            }
        }
        sample.set_urgent(true);
        let key = Some(Arc::as_ptr(sample) as usize);
        let entry = match waiter::acquire(self.id, key, inst_handle) {
            Ok(Some(entry)) => entry,
            Ok(None) | Err(_) => return false,
        };
        if entry.instance == inst_handle {
            if let Some(h) = inst_handle {
                if let Some(slot) = g.instances.slot_by_handle(h) {
                    g.instances.get_mut(slot).wait = true;
                }
            }
        }
        let deadline = Instant::now() + g.qos.max_blocking_time;
        let mut timed_out = false;
        loop {
            if g.closed
                || entry.sample_gone.load(AtomicOrdering::Acquire)
                || sample.acks_pending() == 0
            {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break;
            }
            let res = entry.cond.wait_for(g, deadline - now);
            if res.timed_out() {
                timed_out = sample.acks_pending() > 0;
                break;
            }
        }
        if waiter::release(&entry) {
            sample.set_urgent(false);
            if let Some(h) = entry.instance {
                if let Some(slot) = g.instances.slot_by_handle(h) {
                    g.instances.get_mut(slot).wait = false;
                }
            }
        }
        timed_out
    }

    /// Unlink a sample from both lists. No-op when it is not cached here.
    fn unlink_sample(g: &mut Guard<'_>, sample: &Arc<Sample>) {
        let Some(idx) = g.refs.find(&g.changes, Chain::Cache, sample) else {
            return;
        };
        Self::unlink_idx(g, idx);
    }

    fn unlink_idx(g: &mut Guard<'_>, idx: RefIdx) {
        let (alive, handle, in_instance) = {
            let node = g.refs.node(idx);
            (
                node.sample.kind.is_alive(),
                node.sample.handle,
                node.in_instance,
            )
        };
        if in_instance {
            if let Some(slot) = g.instances.slot_by_handle(handle) {
                let st = &mut **g;
                let CacheState {
                    refs, instances, ..
                } = st;
                let inst = instances.get_mut(slot);
                refs.unlink(&mut inst.list, Chain::Inst, idx);
                if alive {
                    inst.ndata -= 1;
                }
            }
        }
        {
            let st = &mut **g;
            let CacheState { refs, changes, .. } = st;
            refs.unlink(changes, Chain::Cache, idx);
        }
        if alive {
            g.ndata -= 1;
        }
        let sample = g.refs.release(idx);
        sample.set_cached(false);
    }

    /// Free an instance: unlink it from the index, flush its samples, tear
    /// down filter nodes.
    pub(crate) fn free_instance(&self, g: &mut Guard<'_>, slot: InstSlot) {
        let handle = g.instances.get(slot).handle;
        let inform = g.instances.get(slot).inform;
        if inform && g.monitor {
            if let Some(mon) = monitor::installed() {
                mon.instance_flushed(g.mon_user, Hci(handle));
            }
        }
        if let Some(tbf) = g.tbf.as_mut() {
            let dropped = tbf.remove_instance(handle);
            drop(dropped);
        }
        let mut inst = g.instances.remove(slot);
        while let Some(idx) = inst.list.head() {
            let sample = clone_ref(&g.refs.node(idx).sample);
            let pending = sample.acks_pending();
            if pending > 0 {
                g.unacked = g.unacked.saturating_sub(u32::from(pending));
                sample.clear_acks();
                if g.monitor {
                    if let Some(mon) = monitor::installed() {
                        mon.remove_change(g.mon_user, &sample);
                    }
                }
            }
            {
                let st = &mut **g;
                let CacheState { refs, changes, .. } = st;
                refs.unlink(&mut inst.list, Chain::Inst, idx);
                refs.unlink(changes, Chain::Cache, idx);
            }
            if sample.kind.is_alive() {
                g.ndata -= 1;
            }
            let owned = g.refs.release(idx);
            owned.set_cached(false);
        }
        log::debug!("[CACHE] instance {handle} freed");
    }

    // ------------------------------------------------------------------
    // Key lookup / creation
    // ------------------------------------------------------------------

    fn instance_for_key(
        &self,
        g: &mut Guard<'_>,
        hash: Option<KeyHash>,
        key: Option<&[u8]>,
        add: bool,
        check_limits: bool,
        ooo: u32,
    ) -> Result<KeyLookup> {
        let hash = match hash {
            Some(h) => h,
            None => {
                let key = key.ok_or(Error::BadParameter)?;
                g.hash_for(key)?
            }
        };

        if let Some(slot) = g.instances.find_by_key(&hash, key) {
            if add && check_limits && g.qos.must_ack() {
                let inst = g.instances.get(slot);
                if inst.ndata >= g.max_depth() {
                    return Ok(KeyLookup::Limit(RejectCause::SamplesPerInstanceLimit));
                }
                if g.ndata + ooo >= g.max_samples() {
                    return Ok(KeyLookup::Limit(RejectCause::SamplesLimit));
                }
            }
            return Ok(KeyLookup::Found(slot));
        }
        if !add {
            return Ok(KeyLookup::NotFound);
        }

        // Instance limit, with reclaim of a recoverable instance on the
        // reader side.
        if g.instances.count() >= g.qos.limits.max_instances {
            let recoverable = if g.is_writer() {
                None
            } else {
                g.instances.recoverable()
            };
            match recoverable {
                Some(victim) => self.free_instance(g, victim),
                None => return Ok(KeyLookup::Limit(RejectCause::InstanceLimit)),
            }
        }
        if check_limits && g.changes.count + ooo >= g.max_samples() {
            return Ok(KeyLookup::Limit(RejectCause::SamplesLimit));
        }

        let stored_key = if g.long_keys() {
            key.map(Arc::from)
        } else {
            None
        };
        match g.instances.create(hash, stored_key, None) {
            Ok(slot) => Ok(KeyLookup::Found(slot)),
            Err(_) => {
                log::warn!("[CACHE] out of memory for instance");
                Ok(KeyLookup::NoMemory)
            }
        }
    }

    // ========================================================================
    // Acknowledgements
    // ========================================================================

    /// Record one acknowledgement for the sample with `seqnr`.
    pub fn acknowledged(self: &Arc<Self>, hci: Option<Hci>, seqnr: SequenceNumber) {
        let mut g = self.lock();
        let multi = g.qos.multi_instance;
        let slot = if multi {
            let Some(h) = hci else { return };
            match g.instances.slot_by_handle(h.0) {
                Some(slot) => Some(slot),
                None => return,
            }
        } else {
            None
        };
        let list = match slot {
            Some(slot) => g.instances.get(slot).list,
            None => g.changes,
        };
        if list.count == 0 {
            return;
        }
        let chain = if slot.is_some() {
            Chain::Inst
        } else {
            Chain::Cache
        };
        // Sequence numbers grow towards the tail, so bound-check first.
        let head_seq = g.refs.node(list.head().expect("non-empty")).sample.seqnr;
        let tail_seq = g.refs.node(list.tail().expect("non-empty")).sample.seqnr;
        if seqnr < head_seq || seqnr > tail_seq {
            return;
        }
        let mut idx = list.head().expect("non-empty");
        let mut found = None;
        while idx != NIL {
            let node = g.refs.node(idx);
            if node.sample.seqnr == seqnr {
                found = Some(clone_ref(&node.sample));
                break;
            }
            idx = g.refs.next(chain, idx);
        }
        let Some(sample) = found else { return };
        if sample.acks_pending() == 0 {
            // Duplicate acknowledgement; nothing outstanding.
            return;
        }

        g.unacked = g.unacked.saturating_sub(1);
        if sample.ack_done() > 0 {
            return;
        }

        let entry = if sample.is_urgent() {
            waiter::lookup(self.id, Some(Arc::as_ptr(&sample) as usize))
        } else {
            None
        };

        // Last ack: volatile caches (and fully unregistered single-sample
        // instances) drop the sample now.
        let list_len = match slot {
            Some(slot) => g.instances.get(slot).list.count,
            None => g.changes.count,
        };
        if !g.qos.durability.is_durable()
            || (sample.kind.is_unregistered() && list_len == 1)
        {
            let _ = self.remove_change(&mut g, &sample, false);
            if let Some(e) = &entry {
                e.sample_gone.store(true, AtomicOrdering::Release);
            }
        }

        if let Some(slot) = slot {
            let inst = g.instances.get(slot);
            if inst.kind.is_unregistered()
                && inst.list.is_empty()
                && !inst.registered
                && !inst.wait
            {
                self.free_instance(&mut g, slot);
            }
        }

        if let Some(e) = entry {
            waiter::wake(&e);
        }

        // Space may have freed for a parked sample.
        if g.pending_add.is_some() {
            let PendingAdd { sample, rel } = g.pending_add.take().expect("pending present");
            // Re-resolve the instance: it may have been reclaimed while the
            // sample was parked.
            let slot = if multi {
                g.instances.slot_by_handle(sample.handle)
            } else {
                None
            };
            if multi && slot.is_none() {
                log::debug!("[CACHE] parked sample dropped, instance gone");
                g.blocked = false;
            } else {
                match self.do_add(&mut g, sample, slot, rel) {
                    Ok(()) => {
                        if g.pending_add.is_none() {
                            g.blocked = false;
                            log::debug!("[CACHE] parked sample admitted");
                        }
                    }
                    Err(e) => log::debug!("[CACHE] parked sample still refused: {e}"),
                }
            }
        }

        if g.unacked == 0 && g.blocked {
            if let Some(e) = waiter::lookup(self.id, None) {
                waiter::wake(&e);
            }
        }
    }

    /// Block until every sample is acknowledged, or `max_wait` elapses.
    pub fn wait_acks(&self, max_wait: Duration) -> Result<()> {
        let mut g = self.lock();
        if g.unacked == 0 {
            return Ok(());
        }
        if max_wait.is_zero() {
            return Err(Error::Timeout);
        }
        let entry = match waiter::acquire(self.id, None, None)? {
            Some(entry) => entry,
            None => return Err(Error::Timeout),
        };
        g.blocked = true;
        let deadline = Instant::now() + max_wait;
        let result = loop {
            if g.unacked == 0 {
                break Ok(());
            }
            if g.closed {
                break Err(Error::Timeout);
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(Error::Timeout);
            }
            entry.cond.wait_for(&mut g, deadline - now);
        };
        if waiter::release(&entry) {
            g.blocked = false;
        }
        result
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Produce up to `nmax` samples according to `spec`.
    ///
    /// Returned samples hold an extra reference each and must be handed to
    /// [`HistoryCache::done`] eventually.
    pub fn get(&self, nmax: usize, spec: &GetSpec<'_>) -> Result<Vec<Arc<Sample>>> {
        self.get_inner(nmax, spec, false)
    }

    /// `get` without filter/order programs, marking samples read
    /// immediately (RTPS/DCPS fast path).
    pub fn get_data(
        &self,
        nmax: usize,
        skipmask: SkipMask,
        handle: InstanceHandle,
        next: bool,
        remove: bool,
    ) -> Result<Vec<Arc<Sample>>> {
        let spec = GetSpec {
            skipmask,
            filter: None,
            order: None,
            handle,
            next,
            remove,
        };
        self.get_inner(nmax, &spec, true)
    }

    fn get_inner(
        &self,
        nmax: usize,
        spec: &GetSpec<'_>,
        mark_read: bool,
    ) -> Result<Vec<Arc<Sample>>> {
        let mut g = self.lock();
        let mut out = Vec::new();
        let mut unblocked = false;
        let multi = g.qos.multi_instance;
        let inst_order = g.qos.access_scope == AccessScope::Instance;

        if multi && (inst_order || spec.handle != NIL_HANDLE) {
            if spec.handle != NIL_HANDLE && !spec.next && g.instances.uses_skiplists() {
                if let Some(slot) = g.instances.slot_by_handle(spec.handle) {
                    self.get_from_list(
                        &mut g,
                        Some(slot),
                        nmax,
                        spec,
                        mark_read,
                        &mut out,
                        &mut unblocked,
                    );
                    g.instances.get_mut(slot).view = ViewState::NotNew;
                }
            } else {
                g.instances.enter_walk();
                for handle in g.instances.walk_handles() {
                    if out.len() >= nmax {
                        break;
                    }
                    let Some(slot) = g.instances.slot_by_handle(handle) else {
                        continue;
                    };
                    let view = g.instances.get(slot).view;
                    if (spec.skipmask.has(SkipMask::NEW_VIEW) && view == ViewState::New)
                        || (spec.skipmask.has(SkipMask::OLD_VIEW) && view == ViewState::NotNew)
                    {
                        continue;
                    }
                    if spec.handle != NIL_HANDLE {
                        if !spec.next && handle != spec.handle {
                            continue;
                        }
                        if spec.next && handle <= spec.handle {
                            continue;
                        }
                    }
                    let before = out.len();
                    if !g.instances.get(slot).list.is_empty() {
                        self.get_from_list(
                            &mut g,
                            Some(slot),
                            nmax,
                            spec,
                            mark_read,
                            &mut out,
                            &mut unblocked,
                        );
                    }
                    g.instances.get_mut(slot).view = ViewState::NotNew;
                    if spec.next && out.len() > before {
                        break;
                    }
                    if spec.handle != NIL_HANDLE && !spec.next {
                        break;
                    }
                }
                g.instances.exit_walk();
            }
        } else if g.changes.count > 0 {
            self.get_from_list(&mut g, None, nmax, spec, mark_read, &mut out, &mut unblocked);
        }

        if unblocked {
            transfer::unblock(self.id, &mut g);
        }
        drop(g);

        if let Some(order) = spec.order {
            out.sort_by(|a, b| {
                let pa = a.payload.as_slice().unwrap_or(&[]);
                let pb = b.payload.as_slice().unwrap_or(&[]);
                order.compare(pa, pb).unwrap_or(std::cmp::Ordering::Less)
            });
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn get_from_list(
        &self,
        g: &mut Guard<'_>,
        slot: Option<InstSlot>,
        nmax: usize,
        spec: &GetSpec<'_>,
        mark_read: bool,
        out: &mut Vec<Arc<Sample>>,
        unblocked: &mut bool,
    ) {
        let chain = if slot.is_some() {
            Chain::Inst
        } else {
            Chain::Cache
        };
        let mut idx = match slot {
            Some(slot) => g.instances.get(slot).list.head().unwrap_or(NIL),
            None => g.changes.head().unwrap_or(NIL),
        };
        while idx != NIL && out.len() < nmax {
            let next = g.refs.next(chain, idx);
            let sample = clone_ref(&g.refs.node(idx).sample);

            // Instance context for state masks and generation ranks.
            let (kind, view, disp, no_w) = match slot {
                Some(slot) => {
                    let inst = g.instances.get(slot);
                    (inst.kind, inst.view, inst.disp_cnt, inst.no_w_cnt)
                }
                None => {
                    if g.qos.multi_instance {
                        match g.instances.slot_by_handle(sample.handle) {
                            Some(s) => {
                                let inst = g.instances.get(s);
                                (inst.kind, inst.view, inst.disp_cnt, inst.no_w_cnt)
                            }
                            None => (g.si_kind, g.si_view, g.si_disp_cnt, g.si_no_w_cnt),
                        }
                    } else {
                        (g.si_kind, g.si_view, g.si_disp_cnt, g.si_no_w_cnt)
                    }
                }
            };

            if self.skip_sample(spec.skipmask, &sample, kind, view) {
                idx = next;
                continue;
            }
            if let Some(filter) = spec.filter {
                let Some(payload) = sample.payload.as_slice() else {
                    idx = next;
                    continue;
                };
                match filter.matches(payload) {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        idx = next;
                        continue;
                    }
                }
            }

            sample.snapshot_view(view);
            sample.snapshot_instance_state(kind);
            sample.snapshot_generation_rank(
                (disp + no_w).wrapping_sub(sample.disp_cnt + sample.no_w_cnt),
            );
            if mark_read {
                sample.mark_read();
            }
            out.push(clone_ref(&sample));

            if spec.remove {
                Self::unlink_idx(g, idx);
                if g.blocked {
                    *unblocked = true;
                }
            }
            idx = next;
        }
    }

    fn skip_sample(
        &self,
        mask: SkipMask,
        sample: &Arc<Sample>,
        kind: InstanceState,
        view: ViewState,
    ) -> bool {
        if mask == SkipMask::NONE {
            return false;
        }
        use crate::sample::SampleState;
        (sample.sample_state() == SampleState::NotRead && mask.has(SkipMask::NOT_READ))
            || (sample.sample_state() == SampleState::Read && mask.has(SkipMask::READ))
            || (kind.is_alive() && mask.has(SkipMask::ALIVE))
            || (kind.is_disposed() && mask.has(SkipMask::DISPOSED))
            || (kind.is_unregistered() && mask.has(SkipMask::NO_WRITERS))
            || (view == ViewState::New && mask.has(SkipMask::NEW_VIEW))
            || (view == ViewState::NotNew && mask.has(SkipMask::OLD_VIEW))
    }

    /// Release samples previously returned by `get`/`get_data`.
    pub fn done(&self, entries: impl IntoIterator<Item = Arc<Sample>>) {
        let mut g = self.lock();
        for sample in entries {
            if sample.is_cached() {
                sample.mark_read();
            } else if g.qos.multi_instance && sample.kind.is_unregistered() {
                if let Some(slot) = g.instances.slot_by_handle(sample.handle) {
                    let inst = g.instances.get(slot);
                    if inst.list.is_empty()
                        && inst.list.empty_time() == sample.time
                        && !inst.registered
                    {
                        if g.qos.limits.max_instances != LENGTH_UNLIMITED {
                            g.instances.get_mut(slot).recover = true;
                        } else {
                            self.free_instance(&mut g, slot);
                        }
                    }
                }
            }
            drop(sample);
        }
    }

    /// True when at least one sample escapes `skipmask`.
    pub fn avail(&self, skipmask: SkipMask) -> bool {
        self.avail_inner(skipmask, None)
    }

    /// `avail` with an additional query filter.
    pub fn avail_condition(&self, skipmask: SkipMask, query: &dyn SampleFilter) -> bool {
        self.avail_inner(skipmask, Some(query))
    }

    fn avail_inner(&self, mask: SkipMask, query: Option<&dyn SampleFilter>) -> bool {
        let mut g = self.lock();
        let multi = g.qos.multi_instance;
        if multi {
            g.instances.enter_walk();
            let mut found = false;
            for handle in g.instances.walk_handles() {
                let Some(slot) = g.instances.slot_by_handle(handle) else {
                    continue;
                };
                let view = g.instances.get(slot).view;
                if (mask.has(SkipMask::NEW_VIEW) && view == ViewState::New)
                    || (mask.has(SkipMask::OLD_VIEW) && view == ViewState::NotNew)
                {
                    continue;
                }
                if self.check_list(&g, Some(slot), mask, query) {
                    found = true;
                    break;
                }
            }
            g.instances.exit_walk();
            found
        } else if g.changes.count > 0 {
            self.check_list(&g, None, mask, query)
        } else {
            false
        }
    }

    fn check_list(
        &self,
        g: &Guard<'_>,
        slot: Option<InstSlot>,
        mask: SkipMask,
        query: Option<&dyn SampleFilter>,
    ) -> bool {
        let chain = if slot.is_some() {
            Chain::Inst
        } else {
            Chain::Cache
        };
        let (kind, view) = match slot {
            Some(slot) => {
                let inst = g.instances.get(slot);
                (inst.kind, inst.view)
            }
            None => (g.si_kind, g.si_view),
        };
        let mut idx = match slot {
            Some(slot) => g.instances.get(slot).list.head().unwrap_or(NIL),
            None => g.changes.head().unwrap_or(NIL),
        };
        while idx != NIL {
            let sample = &g.refs.node(idx).sample;
            if !self.skip_sample(mask, sample, kind, view) {
                match query {
                    None => return true,
                    Some(q) => {
                        let matched = sample
                            .payload
                            .as_slice()
                            .map(|p| q.matches(p).unwrap_or(false))
                            .unwrap_or(false);
                        return matched;
                    }
                }
            }
            idx = g.refs.next(chain, idx);
        }
        false
    }

    /// Iterate the cache-wide list for durability replay. The callback may
    /// take ack references; the unacked counter tracks the delta. Stops
    /// when the callback returns `false`.
    pub fn replay(&self, f: &mut dyn FnMut(&Arc<Sample>, Option<Hci>) -> bool) {
        let mut g = self.lock();
        let mut idx = g.changes.head().unwrap_or(NIL);
        while idx != NIL {
            let next = g.refs.next(Chain::Cache, idx);
            let sample = clone_ref(&g.refs.node(idx).sample);
            let before = sample.acks_pending();
            let hci = if g.qos.multi_instance {
                Some(Hci(sample.handle))
            } else {
                None
            };
            let again = f(&sample, hci);
            let after = sample.acks_pending();
            g.unacked = g
                .unacked
                .saturating_add(u32::from(after))
                .saturating_sub(u32::from(before));
            if !again {
                break;
            }
            idx = next;
        }
    }

    // ========================================================================
    // Monitoring / notification plumbing
    // ========================================================================

    /// Route this cache's changes through the installed RTPS monitor.
    pub fn monitor_start(&self, user: u64) {
        let mut g = self.lock();
        g.monitor = true;
        g.mon_user = user;
    }

    /// Detach from the RTPS monitor.
    pub fn monitor_end(&self) {
        let mut g = self.lock();
        g.monitor = false;
    }

    /// Enable instance-flush notifications.
    pub fn inform_start(&self, user: u64) {
        let mut g = self.lock();
        g.inform = true;
        g.mon_user = user;
    }

    /// Request a flush notification for one instance.
    pub fn inst_inform(&self, hci: Hci) {
        let mut g = self.lock();
        if let Some(slot) = g.instances.slot_by_handle(hci.0) {
            g.instances.get_mut(slot).inform = true;
        }
    }

    /// Disable instance-flush notifications.
    pub fn inform_end(&self) {
        let mut g = self.lock();
        g.inform = false;
        g.instances.enter_walk();
        for handle in g.instances.walk_handles() {
            if let Some(slot) = g.instances.slot_by_handle(handle) {
                g.instances.get_mut(slot).inform = false;
            }
        }
        g.instances.exit_walk();
    }

    /// Install the data-available hook.
    pub fn request_notification(&self, hook: Arc<dyn Fn(u64) + Send + Sync>, user: u64) {
        let mut g = self.lock();
        g.notify = Some((hook, user));
    }

    /// True when this writer cache has any interested party.
    pub fn write_required(&self) -> bool {
        let g = self.lock();
        g.is_writer()
            && (g.qos.durability.is_durable()
                || g.monitor
                || !g.readers.is_empty()
                || g.qos.deadline)
    }

    // ========================================================================
    // Remote writer lifecycle (reader side)
    // ========================================================================

    /// A remote writer matched this reader cache. Creates (or references)
    /// the time-based filter context.
    pub fn rem_writer_add(&self, _writer: WriterHandle) {
        let mut g = self.lock();
        let Some(separation) = g.qos.tbf_separation else {
            return;
        };
        if let Some(ctx) = g.tbf.as_mut() {
            ctx.nusers += 1;
            return;
        }
        match TbfContext::new(separation) {
            Ok(ctx) => g.tbf = Some(ctx),
            Err(_) => log::warn!("[TBF] cannot allocate filter context"),
        }
    }

    /// A remote writer left. Drops the filter-context reference and writes
    /// unregister records for every instance it owned.
    pub fn rem_writer_removed(self: &Arc<Self>, writer: WriterHandle, now: Timestamp) {
        let mut g = self.lock();
        if g.qos.tbf_separation.is_some() {
            let teardown = match g.tbf.as_mut() {
                Some(ctx) => {
                    ctx.nusers -= 1;
                    ctx.nusers == 0
                }
                None => false,
            };
            if teardown {
                if let Some(mut ctx) = g.tbf.take() {
                    let (pendings, _) = ctx.drain();
                    drop(pendings);
                }
            }
        }
        if !g.qos.multi_instance || g.instances.count() == 0 {
            return;
        }
        g.instances.enter_walk();
        for handle in g.instances.walk_handles() {
            let Some(slot) = g.instances.slot_by_handle(handle) else {
                continue;
            };
            let inst = g.instances.get(slot);
            if inst.writers.is_empty() {
                continue;
            }
            let only_this =
                inst.writers.len() == 1 && inst.writers.as_slice()[0] == writer;
            if only_this {
                let hci = Some(Hci(handle));
                if let Err(e) = self.release_locked(
                    &mut g,
                    writer,
                    handle,
                    hci,
                    ChangeKind::Unregistered,
                    now,
                    &[],
                ) {
                    log::debug!("[CACHE] unregister on writer death failed: {e}");
                }
                g.apw_idle = false;
            } else if g.instances.get_mut(slot).writers.remove(writer) {
                let exclusive = g.qos.ownership == crate::qos::OwnershipKind::Exclusive;
                if exclusive && g.instances.get(slot).owner == writer {
                    let dir = g.qos.writer_directory.clone();
                    g.instances.get_mut(slot).update_owner(dir.as_deref());
                }
            }
        }
        g.instances.exit_walk();
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close the cache: wake all waiters, drop every sample and instance,
    /// purge pending transfers.
    pub fn close(self: &Arc<Self>) {
        {
            let mut g = self.lock();
            g.closed = true;
            for entry in waiter::drain(self.id) {
                entry.sample_gone.store(true, AtomicOrdering::Release);
                entry.cond.notify_all();
            }
            if let Some(mut ctx) = g.tbf.take() {
                let (pendings, _) = ctx.drain();
                drop(pendings);
            }
            g.readers.clear();
            g.notify = None;
            if g.qos.multi_instance {
                loop {
                    let Some(handle) = g.instances.walk_handles().into_iter().next() else {
                        break;
                    };
                    let Some(slot) = g.instances.slot_by_handle(handle) else {
                        break;
                    };
                    self.free_instance(&mut g, slot);
                }
            } else {
                while let Some(idx) = g.changes.head() {
                    let pending = g.refs.node(idx).sample.acks_pending();
                    if pending > 0 {
                        g.unacked = g.unacked.saturating_sub(u32::from(pending));
                        g.refs.node(idx).sample.clear_acks();
                    }
                    Self::unlink_idx(&mut g, idx);
                }
            }
        }
        transfer::purge(self.id);
        log::debug!("[CACHE] cache {} closed", self.id);
    }

    /// Structural validator: verifies list counts and index membership.
    /// Fatal on corruption.
    #[cfg(feature = "cache-check")]
    pub fn cache_check(&self) {
        let g = self.lock();
        let mut total = 0u32;
        let mut data = 0u32;
        let mut idx = g.changes.head().unwrap_or(NIL);
        while idx != NIL {
            let node = g.refs.node(idx);
            assert!(node.sample.is_cached(), "cache check: uncached sample linked");
            total += 1;
            if node.sample.kind.is_alive() {
                data += 1;
            }
            idx = g.refs.next(Chain::Cache, idx);
        }
        assert_eq!(total, g.changes.count, "cache check: list count mismatch");
        assert_eq!(data, g.ndata, "cache check: ndata mismatch");
        if g.qos.multi_instance {
            let mut inst_changes = 0u32;
            let mut inst_data = 0u32;
            for handle in g.instances.walk_handles() {
                let slot = g
                    .instances
                    .slot_by_handle(handle)
                    .expect("cache check: index handle resolves");
                let inst = g.instances.get(slot);
                inst_changes += inst.list.count;
                inst_data += inst.ndata;
            }
            assert!(
                inst_changes <= total,
                "cache check: instance changes exceed cache list"
            );
            assert_eq!(inst_data, data, "cache check: instance ndata mismatch");
        }
    }
}

impl std::fmt::Debug for HistoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryCache").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::ResourceLimits;

    fn alive_sample(writer: WriterHandle, sec: u32, data: &[u8]) -> Sample {
        Sample::new(
            ChangeKind::Alive,
            writer,
            Timestamp::new(sec, 0),
            Payload::from_slice(data),
        )
        .expect("sample alloc")
    }

    fn durable_writer(depth: u32) -> Arc<HistoryCache> {
        HistoryCache::new(
            CacheOptions::writer(true)
                .key_size(4)
                .history(History::KeepLast(depth))
                .transient_local(),
        )
        .expect("cache alloc")
    }

    fn reader() -> Arc<HistoryCache> {
        HistoryCache::new(CacheOptions::reader(true).key_size(4)).expect("cache alloc")
    }

    /// Deliver a sample into a reader cache the way RTPS would.
    fn recv(
        cache: &Arc<HistoryCache>,
        writer: WriterHandle,
        key: &[u8],
        kind: ChangeKind,
        sec: u32,
    ) -> Result<InstanceHandle> {
        let hash = cache.lock().hash_for(key)?;
        let (hci, handle) = cache
            .lookup_hash(&hash, Some(key), true)?
            .expect("instance created");
        let mut sample = Sample::new(
            kind,
            writer,
            Timestamp::new(sec, 0),
            if kind.is_alive() {
                Payload::from_slice(&[sec as u8])
            } else {
                Payload::None
            },
        )?;
        sample.handle = handle;
        cache.add_inst(sample, Some(hci), false)?;
        Ok(handle)
    }

    #[test]
    fn register_and_lookup() {
        let cache = durable_writer(4);
        let (hci, handle) = cache.register(b"k1  ", Timestamp::now()).expect("register");
        assert_ne!(handle, NIL_HANDLE);

        let found = cache.lookup_key(b"k1  ").expect("lookup").expect("present");
        assert_eq!(found.1, handle);
        assert_eq!(found.0, hci);
        assert!(cache.lookup_key(b"none").expect("lookup").is_none());

        let info = cache.instance_info(handle).expect("info");
        assert!(info.registered);
    }

    #[test]
    fn register_on_single_instance_cache_fails() {
        let cache =
            HistoryCache::new(CacheOptions::writer(false).transient_local()).expect("cache");
        assert!(matches!(
            cache.register(b"k", Timestamp::now()),
            Err(Error::PreconditionNotMet)
        ));
    }

    #[test]
    fn writer_assigns_monotonic_seqnrs() {
        let cache = durable_writer(8);
        let (hci, handle) = cache.register(b"k1  ", Timestamp::now()).expect("register");
        for sec in 1..=5 {
            let mut s = alive_sample(1, sec, b"d");
            s.handle = handle;
            cache.add_inst(s, Some(hci), false).expect("add");
        }
        let samples = cache.get(16, &GetSpec::any()).expect("get");
        let seqs: Vec<u64> = samples.iter().map(|s| s.seqnr.as_u64()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        cache.done(samples);
    }

    #[test]
    fn keep_last_depth_evicts_oldest() {
        let cache = durable_writer(2);
        let (hci, handle) = cache.register(b"k1  ", Timestamp::now()).expect("register");
        for sec in 1..=3 {
            let mut s = alive_sample(1, sec, b"d");
            s.handle = handle;
            cache.add_inst(s, Some(hci), false).expect("add");
        }
        let stats = cache.stats();
        assert_eq!(stats.nchanges, 2);
        assert_eq!(stats.ndata, 2);

        let samples = cache.get(16, &GetSpec::any()).expect("get");
        let seqs: Vec<u64> = samples.iter().map(|s| s.seqnr.as_u64()).collect();
        assert_eq!(seqs, vec![2, 3]);
        cache.done(samples);
    }

    #[test]
    fn volatile_writer_reclaims_unacked_free_samples() {
        let cache = HistoryCache::new(CacheOptions::writer(true).key_size(4)).expect("cache");
        let (hci, handle) = cache.register(b"k1  ", Timestamp::now()).expect("register");
        let mut s = alive_sample(1, 1, b"d");
        s.handle = handle;
        cache.add_inst(s, Some(hci), false).expect("add");
        // Nothing holds an ack reference: the sample is gone already.
        assert_eq!(cache.stats().nchanges, 0);
    }

    #[test]
    fn take_unlinks_and_counts_stay_consistent() {
        let cache = durable_writer(8);
        let (hci, handle) = cache.register(b"k1  ", Timestamp::now()).expect("register");
        for sec in 1..=4 {
            let mut s = alive_sample(1, sec, b"d");
            s.handle = handle;
            cache.add_inst(s, Some(hci), false).expect("add");
        }
        let taken = cache.get(2, &GetSpec::take()).expect("take");
        assert_eq!(taken.len(), 2);
        assert_eq!(cache.stats().nchanges, 2);
        assert_eq!(cache.stats().ndata, 2);
        let info = cache.instance_info(handle).expect("info");
        assert_eq!(info.nchanges, 2);
        assert_eq!(info.ndata, 2);
        cache.done(taken);
    }

    #[test]
    fn read_marks_and_masks_filter() {
        let cache = durable_writer(8);
        let (hci, handle) = cache.register(b"k1  ", Timestamp::now()).expect("register");
        for sec in 1..=3 {
            let mut s = alive_sample(1, sec, b"d");
            s.handle = handle;
            cache.add_inst(s, Some(hci), false).expect("add");
        }
        // get_data marks read immediately.
        let first = cache
            .get_data(2, SkipMask::READ, NIL_HANDLE, false, false)
            .expect("read");
        assert_eq!(first.len(), 2);

        // Only one unread sample remains.
        let rest = cache
            .get_data(16, SkipMask::READ, NIL_HANDLE, false, false)
            .expect("read");
        assert_eq!(rest.len(), 1);
        assert!(!cache.avail(SkipMask::READ));
        assert!(cache.avail(SkipMask::NONE));
        cache.done(first);
        cache.done(rest);
    }

    #[test]
    fn reader_tracks_instance_lifecycle() {
        let cache = reader();
        let handle = recv(&cache, 7, b"k1  ", ChangeKind::Alive, 1).expect("recv");
        let info = cache.instance_info(handle).expect("info");
        assert!(info.kind.is_alive());
        assert_eq!(info.writers, vec![7]);

        recv(&cache, 7, b"k1  ", ChangeKind::Disposed, 2).expect("recv");
        let info = cache.instance_info(handle).expect("info");
        assert!(info.kind.is_disposed());

        // Revival bumps the disposed generation and resets the view.
        let taken = cache.get(16, &GetSpec::take()).expect("drain");
        cache.done(taken);
        recv(&cache, 7, b"k1  ", ChangeKind::Alive, 3).expect("recv");
        let samples = cache.get(16, &GetSpec::any()).expect("get");
        assert_eq!(samples.len(), 1);
        // The revival sample carries the pre-transition generation count.
        assert_eq!(samples[0].absolute_generation_rank(), 1);
        let info = cache.instance_info(handle).expect("info");
        assert_eq!(info.view, ViewState::NotNew);
        cache.done(samples);
    }

    #[test]
    fn unregister_from_last_writer_empties_writer_set() {
        let cache = reader();
        let handle = recv(&cache, 7, b"k1  ", ChangeKind::Alive, 1).expect("recv");
        recv(&cache, 8, b"k1  ", ChangeKind::Alive, 2).expect("recv");
        let info = cache.instance_info(handle).expect("info");
        assert_eq!(info.writers, vec![7, 8]);

        // One of two writers unregisters: absorbed, instance stays alive.
        recv(&cache, 7, b"k1  ", ChangeKind::Unregistered, 3).expect("recv");
        let info = cache.instance_info(handle).expect("info");
        assert_eq!(info.writers, vec![8]);
        assert!(info.kind.is_alive());

        // The last writer unregisters: lifecycle record lands.
        recv(&cache, 8, b"k1  ", ChangeKind::Unregistered, 4).expect("recv");
        let info = cache.instance_info(handle).expect("info");
        assert!(info.writers.is_empty());
        assert!(info.kind.is_unregistered());
    }

    #[test]
    fn reader_reject_reports_samples_limit() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting {
            rejected: AtomicUsize,
        }
        impl crate::listener::StatusListener for Counting {
            fn on_sample_rejected(&self, _cause: RejectCause, _handle: InstanceHandle) {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }

        let listener = Arc::new(Counting {
            rejected: AtomicUsize::new(0),
        });
        let cache = HistoryCache::new(
            CacheOptions::reader(true)
                .key_size(4)
                .history(History::KeepAll)
                .reliable(Duration::ZERO)
                .limits(ResourceLimits {
                    max_samples: 2,
                    max_instances: LENGTH_UNLIMITED,
                    max_samples_per_instance: LENGTH_UNLIMITED,
                })
                .listener(listener.clone() as Arc<dyn crate::listener::StatusListener>),
        )
        .expect("cache");

        let hash = cache.lock().hash_for(b"k1  ").expect("hash");
        let (hci, handle) = cache
            .lookup_hash(&hash, Some(b"k1  "), true)
            .expect("lookup")
            .expect("created");
        for sec in 1..=2 {
            let mut s = alive_sample(7, sec, b"d");
            s.handle = handle;
            cache.add_received(s, Some(hci), true).expect("add");
        }
        // Third reliable sample cannot evict: blocked + NoData.
        let mut s = alive_sample(7, 3, b"d");
        s.handle = handle;
        let err = cache.add_received(s, Some(hci), true);
        assert!(matches!(err, Err(Error::NoData)));
        assert!(cache.stats().blocked);
        assert_eq!(listener.rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn wait_acks_times_out_then_succeeds() {
        let cache =
            HistoryCache::new(CacheOptions::writer(false).transient_local()).expect("cache");
        cache
            .add_inst(alive_sample(1, 1, b"d"), None, false)
            .expect("add");

        // Simulate RTPS taking an ack reference during replay.
        cache.replay(&mut |sample, _| {
            sample.add_ack_ref();
            true
        });
        assert_eq!(cache.stats().unacked, 1);
        assert!(matches!(
            cache.wait_acks(Duration::from_millis(20)),
            Err(Error::Timeout)
        ));

        cache.acknowledged(None, SequenceNumber::from_u64(1));
        assert_eq!(cache.stats().unacked, 0);
        cache.wait_acks(Duration::from_millis(20)).expect("acked");
    }

    #[test]
    fn acknowledged_removes_unregister_tail() {
        let cache = durable_writer(4);
        let (hci, handle) = cache.register(b"k1  ", Timestamp::now()).expect("register");
        let mut s = alive_sample(1, 1, b"d");
        s.handle = handle;
        cache.add_inst(s, Some(hci), false).expect("add");
        cache
            .unregister(1, handle, Some(hci), Timestamp::new(2, 0), &[])
            .expect("unregister");

        // Ack the unregister record once RTPS has carried it.
        cache.replay(&mut |sample, _| {
            if sample.kind.is_unregistered() {
                sample.add_ack_ref();
            }
            true
        });
        let (_, next) = cache.seqnr_info();
        let unreg_seq = SequenceNumber::from_u64(next.as_u64() - 1);
        cache.acknowledged(Some(hci), unreg_seq);
        // Durable cache keeps the alive sample; the lifecycle record was
        // the single remaining reference to the unregistered state.
        assert_eq!(cache.stats().unacked, 0);
    }

    #[test]
    fn dest_targeted_release_rejects_overflow() {
        let cache = durable_writer(4);
        let (hci, handle) = cache.register(b"k1  ", Timestamp::now()).expect("register");
        let err = cache.release(
            1,
            handle,
            Some(hci),
            ChangeKind::Disposed,
            Timestamp::new(1, 0),
            &[10, 11, 12],
        );
        assert!(matches!(err, Err(Error::OutOfResources)));
    }

    #[test]
    fn instance_limit_reports_cause() {
        let cache = HistoryCache::new(
            CacheOptions::writer(true)
                .key_size(4)
                .transient_local()
                .limits(ResourceLimits {
                    max_samples: LENGTH_UNLIMITED,
                    max_instances: 2,
                    max_samples_per_instance: LENGTH_UNLIMITED,
                }),
        )
        .expect("cache");
        cache.register(b"k1  ", Timestamp::now()).expect("register");
        cache.register(b"k2  ", Timestamp::now()).expect("register");
        // Writer caches never recover instances.
        assert!(matches!(
            cache.register(b"k3  ", Timestamp::now()),
            Err(Error::OutOfResources)
        ));
    }

    #[test]
    fn close_drops_everything() {
        let cache = durable_writer(8);
        let (hci, handle) = cache.register(b"k1  ", Timestamp::now()).expect("register");
        let mut s = alive_sample(1, 1, b"d");
        s.handle = handle;
        cache.add_inst(s, Some(hci), false).expect("add");
        cache.close();
        let stats = cache.stats();
        assert_eq!(stats.nchanges, 0);
        assert_eq!(stats.ninstances, 0);
        assert!(matches!(
            cache.add_inst(alive_sample(1, 2, b"d"), Some(hci), false),
            Err(Error::AlreadyDeleted)
        ));
    }
}
