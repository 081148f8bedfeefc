// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample (change) records and their shared store.
//!
//! A [`Sample`] is immutable once it enters a cache list; the handful of
//! fields that legitimately change afterwards (read state, view/instance
//! snapshots, ack bookkeeping, urgency) are atomics so shared references
//! stay `Sync`. Sharing across caches and user reads uses `Arc`, bounded by
//! [`MAX_SAMPLE_REFS`]; exceeding the bound is a fatal error, as is pushing
//! the outstanding-ack count past [`MAX_SAMPLE_ACKS`].

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::pool::{self, PoolClass, PoolToken};
use crate::types::{InstanceHandle, SequenceNumber, Timestamp, WriterHandle, NIL_HANDLE};
use crate::Result;

/// Maximum number of concurrent references to one sample.
pub const MAX_SAMPLE_REFS: usize = 2047;

/// Maximum outstanding acknowledgement count of one sample.
pub const MAX_SAMPLE_ACKS: u16 = 2047;

/// Maximum number of targeted destination readers per sample.
pub const MAX_DESTS: usize = 2;

/// Payload bytes stored inline inside the sample record.
pub const INLINE_PAYLOAD: usize = 32;

/// Kind of a cache change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Regular data sample.
    Alive,
    /// Instance disposed by a writer.
    Disposed,
    /// Writer unregistered from the instance.
    Unregistered,
    /// Combined dispose + unregister (auto-dispose unregister).
    Zombie,
}

impl ChangeKind {
    /// Bit-set form: bit 0 = disposed, bit 1 = unregistered.
    pub const fn bits(self) -> u8 {
        match self {
            ChangeKind::Alive => 0,
            ChangeKind::Disposed => 1,
            ChangeKind::Unregistered => 2,
            ChangeKind::Zombie => 3,
        }
    }

    /// Back from bit-set form.
    pub const fn from_bits(bits: u8) -> ChangeKind {
        match bits & 3 {
            1 => ChangeKind::Disposed,
            2 => ChangeKind::Unregistered,
            3 => ChangeKind::Zombie,
            _ => ChangeKind::Alive,
        }
    }

    /// True for `Alive`.
    pub const fn is_alive(self) -> bool {
        matches!(self, ChangeKind::Alive)
    }

    /// Disposed bit set.
    pub const fn is_disposed(self) -> bool {
        self.bits() & 1 != 0
    }

    /// Unregistered bit set.
    pub const fn is_unregistered(self) -> bool {
        self.bits() & 2 != 0
    }
}

/// Instance lifecycle state as a combinable bit-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceState(pub u8);

impl InstanceState {
    /// Alive (no bits set).
    pub const ALIVE: InstanceState = InstanceState(0);
    /// Disposed bit.
    pub const DISPOSED: InstanceState = InstanceState(1);
    /// No-writers / unregistered bit.
    pub const UNREGISTERED: InstanceState = InstanceState(2);

    /// True when no lifecycle bits are set.
    pub const fn is_alive(self) -> bool {
        self.0 == 0
    }

    /// Disposed bit set.
    pub const fn is_disposed(self) -> bool {
        self.0 & 1 != 0
    }

    /// Unregistered bit set.
    pub const fn is_unregistered(self) -> bool {
        self.0 & 2 != 0
    }

    /// State with the change's lifecycle bits merged in.
    pub const fn merged(self, kind: ChangeKind) -> InstanceState {
        InstanceState(self.0 | kind.bits())
    }

    /// State replaced by the change's lifecycle bits.
    pub const fn from_kind(kind: ChangeKind) -> InstanceState {
        InstanceState(kind.bits())
    }

    /// Clear the unregistered bit.
    pub const fn without_unregistered(self) -> InstanceState {
        InstanceState(self.0 & !2)
    }
}

/// Read state of a sample (DDS sample state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleState {
    /// Not yet handed to the user.
    NotRead,
    /// Returned by a previous `get`/`done` round.
    Read,
}

/// View state of an instance (DDS view state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// Instance is new (or reborn) for this reader.
    New,
    /// Instance was seen before.
    NotNew,
}

/// Sample payload storage.
#[derive(Debug)]
pub enum Payload {
    /// No data (dispose/unregister records).
    None,
    /// Small payload kept inline in the record.
    Inline {
        /// Used byte count.
        len: u8,
        /// Inline buffer.
        data: [u8; INLINE_PAYLOAD],
    },
    /// Exclusively owned heap buffer.
    Owned(Box<[u8]>),
    /// Shared buffer; cloning takes another reference.
    Shared(Arc<[u8]>),
}

impl Payload {
    /// Build from a byte slice, choosing inline storage when it fits.
    pub fn from_slice(bytes: &[u8]) -> Payload {
        if bytes.is_empty() {
            return Payload::None;
        }
        if bytes.len() <= INLINE_PAYLOAD {
            let mut data = [0u8; INLINE_PAYLOAD];
            data[..bytes.len()].copy_from_slice(bytes);
            Payload::Inline {
                len: bytes.len() as u8,
                data,
            }
        } else {
            Payload::Owned(bytes.to_vec().into_boxed_slice())
        }
    }

    /// Wrap an already shared buffer.
    pub fn shared(buf: Arc<[u8]>) -> Payload {
        Payload::Shared(buf)
    }

    /// Payload bytes, if any.
    pub fn as_slice(&self) -> Option<&[u8]> {
        match self {
            Payload::None => None,
            Payload::Inline { len, data } => Some(&data[..*len as usize]),
            Payload::Owned(b) => Some(b),
            Payload::Shared(b) => Some(b),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().map_or(0, <[u8]>::len)
    }

    /// True when there is no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for Payload {
    fn clone(&self) -> Self {
        match self {
            Payload::None => Payload::None,
            Payload::Inline { len, data } => Payload::Inline {
                len: *len,
                data: *data,
            },
            Payload::Owned(b) => Payload::Owned(b.clone()),
            // Shared buffers are refcounted, never copied.
            Payload::Shared(b) => Payload::Shared(Arc::clone(b)),
        }
    }
}

/// A single cache change.
#[derive(Debug)]
pub struct Sample {
    /// Change kind. Fixed once the sample is linked into a cache.
    pub kind: ChangeKind,
    /// Originating writer handle.
    pub writer: WriterHandle,
    /// Instance handle inside the destination cache.
    pub handle: InstanceHandle,
    /// Source or reception timestamp.
    pub time: Timestamp,
    /// Sequence number, assigned when a writer cache accepts the sample.
    pub seqnr: SequenceNumber,
    /// Targeted destination readers; `NIL_HANDLE` entries are unused.
    pub dests: [WriterHandle; MAX_DESTS],
    /// Payload bytes.
    pub payload: Payload,
    /// Reader-side disposed-generation count at reception.
    pub disp_cnt: u32,
    /// Reader-side no-writers-generation count at reception.
    pub no_w_cnt: u32,

    sstate: AtomicU8,
    vstate: AtomicU8,
    istate: AtomicU8,
    abs_cnt: AtomicU32,
    wack: AtomicU16,
    urgent: AtomicBool,
    cached: AtomicBool,
    _token: PoolToken,
}

impl Sample {
    /// Allocate a fresh sample record.
    ///
    /// Fails with `OutOfResources` when the change pool is exhausted.
    pub fn new(
        kind: ChangeKind,
        writer: WriterHandle,
        time: Timestamp,
        payload: Payload,
    ) -> Result<Sample> {
        let token = pool::alloc(PoolClass::Change)?;
        Ok(Sample {
            kind,
            writer,
            handle: NIL_HANDLE,
            time,
            seqnr: SequenceNumber::ZERO,
            dests: [NIL_HANDLE; MAX_DESTS],
            payload,
            disp_cnt: 0,
            no_w_cnt: 0,
            sstate: AtomicU8::new(0),
            vstate: AtomicU8::new(0),
            istate: AtomicU8::new(0),
            abs_cnt: AtomicU32::new(0),
            wack: AtomicU16::new(0),
            urgent: AtomicBool::new(false),
            cached: AtomicBool::new(false),
            _token: token,
        })
    }

    /// Clone all scalar fields of an existing change.
    ///
    /// The clone starts with a zero ack count and shares any refcounted
    /// payload buffer.
    pub fn clone_change(src: &Sample) -> Result<Sample> {
        let token = pool::alloc(PoolClass::Change)?;
        Ok(Sample {
            kind: src.kind,
            writer: src.writer,
            handle: src.handle,
            time: src.time,
            seqnr: src.seqnr,
            dests: src.dests,
            payload: src.payload.clone(),
            disp_cnt: src.disp_cnt,
            no_w_cnt: src.no_w_cnt,
            sstate: AtomicU8::new(src.sstate.load(Ordering::Relaxed)),
            vstate: AtomicU8::new(src.vstate.load(Ordering::Relaxed)),
            istate: AtomicU8::new(src.istate.load(Ordering::Relaxed)),
            abs_cnt: AtomicU32::new(0),
            wack: AtomicU16::new(0),
            urgent: AtomicBool::new(false),
            cached: AtomicBool::new(false),
            _token: token,
        })
    }

    /// Current read state.
    pub fn sample_state(&self) -> SampleState {
        if self.sstate.load(Ordering::Relaxed) == 0 {
            SampleState::NotRead
        } else {
            SampleState::Read
        }
    }

    /// Mark the sample as read.
    pub fn mark_read(&self) {
        self.sstate.store(1, Ordering::Relaxed);
    }

    /// Reset the read state (reader-side admission).
    pub fn mark_not_read(&self) {
        self.sstate.store(0, Ordering::Relaxed);
    }

    /// View-state snapshot taken at the last `get`.
    pub fn view_state(&self) -> ViewState {
        if self.vstate.load(Ordering::Relaxed) == 0 {
            ViewState::New
        } else {
            ViewState::NotNew
        }
    }

    pub(crate) fn snapshot_view(&self, view: ViewState) {
        self.vstate
            .store(u8::from(view == ViewState::NotNew), Ordering::Relaxed);
    }

    /// Instance-state snapshot taken at the last `get`.
    pub fn instance_state(&self) -> InstanceState {
        InstanceState(self.istate.load(Ordering::Relaxed))
    }

    pub(crate) fn snapshot_instance_state(&self, state: InstanceState) {
        self.istate.store(state.0, Ordering::Relaxed);
    }

    /// Absolute generation rank snapshot taken at the last `get`.
    pub fn absolute_generation_rank(&self) -> u32 {
        self.abs_cnt.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot_generation_rank(&self, rank: u32) {
        self.abs_cnt.store(rank, Ordering::Relaxed);
    }

    /// Outstanding acknowledgement count.
    pub fn acks_pending(&self) -> u16 {
        self.wack.load(Ordering::Acquire)
    }

    /// Take one acknowledgement reference (a reliable transport or pending
    /// transfer now refers to this sample).
    pub fn add_ack_ref(&self) {
        let prev = self.wack.fetch_add(1, Ordering::AcqRel);
        assert!(
            prev < MAX_SAMPLE_ACKS,
            "sample ack reference limit exceeded"
        );
    }

    /// Drop one acknowledgement reference; returns the remaining count.
    pub(crate) fn ack_done(&self) -> u16 {
        let prev = self.wack.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "sample ack count underflow");
        prev - 1
    }

    /// Clear all acknowledgement references; returns how many were held.
    pub(crate) fn clear_acks(&self) -> u16 {
        self.wack.swap(0, Ordering::AcqRel)
    }

    /// Urgent flag (out-of-band ack solicitation requested).
    pub fn is_urgent(&self) -> bool {
        self.urgent.load(Ordering::Relaxed)
    }

    pub(crate) fn set_urgent(&self, urgent: bool) {
        self.urgent.store(urgent, Ordering::Relaxed);
    }

    /// True while the sample is linked into a cache list.
    pub fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }

    pub(crate) fn set_cached(&self, cached: bool) {
        self.cached.store(cached, Ordering::Release);
    }

    /// True when the sample targets the given reader (or targets everyone).
    pub fn targets(&self, reader: WriterHandle) -> bool {
        if self.dests[0] == NIL_HANDLE {
            return true;
        }
        self.dests.iter().any(|d| *d == reader)
    }
}

/// Take a bounded shared reference on a stored sample.
///
/// Fatal when the reference bound is exceeded: a runaway consumer holding
/// 2047 references indicates corruption, not load.
pub fn clone_ref(sample: &Arc<Sample>) -> Arc<Sample> {
    assert!(
        Arc::strong_count(sample) < MAX_SAMPLE_REFS,
        "sample reference limit exceeded"
    );
    Arc::clone(sample)
}
