// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local writer→reader transfer and the pending-transfer machinery.
//!
//! When a writer cache accepts a sample it walks its matched local readers
//! and delivers a clone straight into each reader cache, skipping the wire
//! entirely. A reader refusing the sample under back-pressure gets the
//! clone parked on a process-global pending list; the source sample carries
//! an extra ack reference while the clone waits. Once the reader unblocks,
//! its list moves to the ready queue and a dispatcher thread drains it.
//!
//! Lock discipline: a cache mutex may be held while taking the registry
//! mutex, never the reverse. The dispatcher pops work under the registry
//! lock and delivers with no lock held.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::cache::{CacheState, HistoryCache, MatchedReader};
use crate::instance::InstSlot;
use crate::monitor;
use crate::pool::{self, PoolClass, PoolToken};
use crate::qos;
use crate::sample::{clone_ref, Sample};
use crate::types::{Hci, KeyHash, SequenceNumber, Timestamp};
use crate::Error;

struct XferEntry {
    src: Option<Arc<HistoryCache>>,
    src_hci: Option<Hci>,
    seqnr: SequenceNumber,
    hash: KeyHash,
    key: Option<Arc<[u8]>>,
    sample: Sample,
    _token: PoolToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XferState {
    /// Destination still blocked.
    Waiting,
    /// Destination unblocked; dispatcher may drain.
    Ready,
}

struct XferList {
    dest: Arc<HistoryCache>,
    entries: VecDeque<XferEntry>,
    state: XferState,
    _token: PoolToken,
}

static XFERS: Mutex<Vec<XferList>> = Mutex::new(Vec::new());
static DISPATCHER: OnceLock<Sender<()>> = OnceLock::new();

fn dispatcher() -> &'static Sender<()> {
    DISPATCHER.get_or_init(|| {
        let (tx, rx) = unbounded::<()>();
        std::thread::Builder::new()
            .name("xdds-cache-xfer".into())
            .spawn(move || {
                while rx.recv().is_ok() {
                    process_ready();
                }
            })
            .expect("spawn transfer dispatcher");
        tx
    })
}

/// QoS/partition compatibility between a writer and a reader cache.
pub fn matches(writer: &Arc<HistoryCache>, reader: &Arc<HistoryCache>) -> bool {
    qos::compatible(&writer.options(), &reader.options())
}

/// Begin a local match: remember the reader and replay existing history to
/// it (durability initial state).
pub fn match_begin(writer: &Arc<HistoryCache>, reader: &Arc<HistoryCache>) -> crate::Result<()> {
    let ropts = reader.options();
    let token = pool::alloc(PoolClass::CRef)?;
    let mut g = writer.lock();
    if g.readers.iter().any(|m| m.cache.id() == reader.id()) {
        return Ok(());
    }
    g.readers.push(MatchedReader {
        cache: Arc::clone(reader),
        endpoint: ropts.endpoint,
        filter: ropts.content_filter.clone(),
        _token: token,
    });
    log::debug!(
        "[XFER] match {} -> {} established",
        writer.id(),
        reader.id()
    );

    // Initial state transfer: walk everything already in the writer cache.
    let mut idx = g.changes.head().unwrap_or(crate::refs::NIL);
    while idx != crate::refs::NIL {
        let next = g.refs.next(crate::refs::Chain::Cache, idx);
        let sample = clone_ref(&g.refs.node(idx).sample);
        let (endpoint, filter) = {
            let m = g.readers.last().expect("just pushed");
            (m.endpoint, m.filter.clone())
        };
        if sample.targets(endpoint) && filter_passes(filter.as_deref(), &sample) {
            let wslot = writer_slot(&g, &sample);
            transfer_change(writer, &mut g, wslot, &sample, reader);
        }
        idx = next;
    }
    Ok(())
}

/// End a local match.
pub fn match_end(writer: &Arc<HistoryCache>, reader: &Arc<HistoryCache>) {
    let mut g = writer.lock();
    g.readers.retain(|m| m.cache.id() != reader.id());
    log::debug!("[XFER] match {} -> {} removed", writer.id(), reader.id());
}

fn filter_passes(filter: Option<&dyn crate::filter::SampleFilter>, sample: &Sample) -> bool {
    match (filter, sample.payload.as_slice()) {
        (Some(f), Some(payload)) => f.matches(payload).unwrap_or(false),
        // Lifecycle records and unfiltered readers always pass.
        _ => true,
    }
}

fn writer_slot(g: &CacheState, sample: &Sample) -> Option<InstSlot> {
    if g.qos.multi_instance {
        g.instances.slot_by_handle(sample.handle)
    } else {
        None
    }
}

/// Fan a freshly accepted sample out to every matched local reader.
pub(crate) fn distribute(
    writer: &Arc<HistoryCache>,
    g: &mut CacheState,
    wslot: Option<InstSlot>,
    sample: &Arc<Sample>,
) {
    let targets: Vec<(Arc<HistoryCache>, u32, Option<Arc<dyn crate::filter::SampleFilter>>)> = g
        .readers
        .iter()
        .map(|m| (Arc::clone(&m.cache), m.endpoint, m.filter.clone()))
        .collect();
    for (dest, endpoint, filter) in targets {
        if !sample.targets(endpoint) {
            continue;
        }
        if !filter_passes(filter.as_deref(), sample) {
            continue;
        }
        transfer_change(writer, g, wslot, sample, &dest);
    }
}

/// Clone `sample` into `dest`, queueing it as a pending transfer on
/// back-pressure.
fn transfer_change(
    writer: &Arc<HistoryCache>,
    g: &mut CacheState,
    wslot: Option<InstSlot>,
    sample: &Arc<Sample>,
    dest: &Arc<HistoryCache>,
) {
    // Instance handles differ between caches, so the change is cloned
    // rather than shared.
    let Ok(mut clone) = Sample::clone_change(sample) else {
        log::warn!("[XFER] clone failed, delivery dropped");
        return;
    };
    clone.writer = g.qos.endpoint;
    if clone.time.is_zero() {
        clone.time = Timestamp::now();
    }
    let (hash, key, src_hci) = match wslot {
        Some(slot) => {
            let inst = g.instances.get(slot);
            (inst.hash, inst.key.clone(), Some(Hci(inst.handle)))
        }
        None => (KeyHash::nil(), None, None),
    };
    match dest.deliver_local(clone, &hash, key.as_ref(), true, true) {
        Ok(()) => {}
        Err((Error::NoData, Some(refused))) => {
            if xfer_add(
                Some(Arc::clone(writer)),
                src_hci,
                sample.seqnr,
                hash,
                key,
                refused,
                dest,
            ) {
                // The source sample stays acknowledged-pending while the
                // clone waits for admission.
                sample.add_ack_ref();
                g.unacked += 1;
            }
        }
        Err((e, _)) => {
            log::debug!("[XFER] delivery to {} failed: {e}", dest.id());
        }
    }
}

/// Park a refused clone on the destination's pending list.
fn xfer_add(
    src: Option<Arc<HistoryCache>>,
    src_hci: Option<Hci>,
    seqnr: SequenceNumber,
    hash: KeyHash,
    key: Option<Arc<[u8]>>,
    sample: Sample,
    dest: &Arc<HistoryCache>,
) -> bool {
    let Ok(token) = pool::alloc(PoolClass::CXfer) else {
        return false;
    };
    let entry = XferEntry {
        src,
        src_hci,
        seqnr,
        hash,
        key,
        sample,
        _token: token,
    };
    let mut lists = XFERS.lock();
    let pos = match lists.iter().position(|l| l.dest.id() == dest.id()) {
        Some(pos) => pos,
        None => {
            let Ok(token) = pool::alloc(PoolClass::XfList) else {
                return false;
            };
            lists.push(XferList {
                dest: Arc::clone(dest),
                entries: VecDeque::new(),
                state: XferState::Waiting,
                _token: token,
            });
            lists.len() - 1
        }
    };
    let list = &mut lists[pos];
    list.entries.push_back(entry);
    log::debug!(
        "[XFER] sample parked for blocked reader {} ({} pending)",
        dest.id(),
        list.entries.len()
    );
    true
}

/// A blocked reader became writable: clear the flag, mark its pending list
/// ready and kick the dispatcher; with nothing pending, tell RTPS instead.
pub(crate) fn unblock(dest_id: u64, st: &mut CacheState) {
    st.blocked = false;
    let had_pending = {
        let mut lists = XFERS.lock();
        match lists.iter_mut().find(|l| l.dest.id() == dest_id) {
            Some(list) => {
                list.state = XferState::Ready;
                true
            }
            None => false,
        }
    };
    if had_pending {
        let _ = dispatcher().send(());
    } else if st.inform {
        if let Some(mon) = monitor::installed() {
            mon.unblock(st.mon_user);
        }
    }
}

/// Drain every ready pending list. Runs on the dispatcher thread; also
/// callable directly for deterministic tests.
pub fn process_ready() {
    loop {
        // Pop one entry with the registry unlocked during delivery.
        let work = {
            let mut lists = XFERS.lock();
            let mut found = None;
            for list in lists.iter_mut() {
                if list.state == XferState::Ready {
                    if let Some(entry) = list.entries.pop_front() {
                        found = Some((Arc::clone(&list.dest), entry));
                        break;
                    }
                }
            }
            if found.is_some() {
                lists.retain(|l| !l.entries.is_empty() || l.state == XferState::Waiting);
            }
            found
        };
        let Some((dest, entry)) = work else { break };
        let XferEntry {
            src,
            src_hci,
            seqnr,
            hash,
            key,
            sample,
            _token,
        } = entry;
        match dest.deliver_local(sample, &hash, key.as_ref(), true, false) {
            Err((Error::NoData, Some(refused))) => {
                // Still blocked: put it back and wait for the next unblock.
                let mut lists = XFERS.lock();
                let pos = match lists.iter().position(|l| l.dest.id() == dest.id()) {
                    Some(pos) => pos,
                    None => {
                        let Ok(token) = pool::alloc(PoolClass::XfList) else {
                            continue;
                        };
                        lists.push(XferList {
                            dest: Arc::clone(&dest),
                            entries: VecDeque::new(),
                            state: XferState::Waiting,
                            _token: token,
                        });
                        lists.len() - 1
                    }
                };
                let list = &mut lists[pos];
                list.state = XferState::Waiting;
                list.entries.push_front(XferEntry {
                    src,
                    src_hci,
                    seqnr,
                    hash,
                    key,
                    sample: refused,
                    _token,
                });
            }
            res => {
                if let Err((e, _)) = res {
                    log::debug!("[XFER] pending delivery failed: {e}");
                }
                // Delivered (or dropped for good): release the source's
                // ack reference.
                if let Some(src) = src {
                    src.acknowledged(src_hci, seqnr);
                }
            }
        }
    }
}

/// Remove every registry trace of a closing cache.
pub(crate) fn purge(cache_id: u64) {
    let mut lists = XFERS.lock();
    lists.retain(|l| l.dest.id() != cache_id);
    for list in lists.iter_mut() {
        for entry in &mut list.entries {
            if entry.src.as_ref().is_some_and(|s| s.id() == cache_id) {
                entry.src = None;
            }
        }
    }
}
