// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # xdds-cache - DDS history cache core
//!
//! The in-memory store that sits between application-level readers/writers
//! and the RTPS protocol machinery of a DDS stack. It keeps published
//! samples alive for reliable delivery and late joiners, indexes them per
//! key instance for ordered access, enforces resource limits with
//! back-pressure, delivers zero-hop between local endpoints, and runs the
//! time-driven QoS policies (deadline, lifespan, autopurge, time-based
//! filter).
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                      DCPS readers / writers                        |
//! |     register . write . dispose . get/take . done . wait_acks       |
//! +--------------------------------------------------------------------+
//! |                            HistoryCache                            |
//! |     admission/eviction  |  local transfer  |  QoS timers           |
//! +--------------------------------------------------------------------+
//! |  sample store  |  reference lists  |  instance index  |  waiters   |
//! |  time-based filter  |  writer tables  |  pools                     |
//! +--------------------------------------------------------------------+
//! |                 RTPS monitor hooks / type support                  |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`HistoryCache`] | Per-endpoint cache, the main entry point |
//! | [`CacheOptions`] | Creation-time QoS bundle |
//! | [`Sample`] | One immutable change record |
//! | [`GetSpec`] | Read/take request parameters |
//! | [`RtpsMonitor`] | Process-wide RTPS callback hooks |
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use xdds_cache::{CacheOptions, ChangeKind, GetSpec, HistoryCache, Payload, Sample, Timestamp};
//!
//! # fn main() -> xdds_cache::Result<()> {
//! // Transient-local so samples survive until a reader takes them.
//! let cache = HistoryCache::new(CacheOptions::writer(true).key_size(4).transient_local())?;
//! let (hci, handle) = cache.register(b"key1", Timestamp::now())?;
//!
//! let mut sample = Sample::new(
//!     ChangeKind::Alive,
//!     1,
//!     Timestamp::now(),
//!     Payload::from_slice(b"hello"),
//! )?;
//! sample.handle = handle;
//! cache.add_inst(sample, Some(hci), false)?;
//!
//! let samples = cache.get(16, &GetSpec::any())?;
//! assert_eq!(samples.len(), 1);
//! cache.done(samples);
//! # Ok(())
//! # }
//! ```

/// Cache container and public contract.
pub mod cache;
/// Type-system and filter/query evaluation seams.
pub mod filter;
/// Instance index (simple list / dual skiplists).
pub mod index;
/// Per-key instance records and writer tables.
pub mod instance;
/// DCPS status listener surface.
pub mod listener;
/// Process-wide RTPS hooks.
pub mod monitor;
/// Pool accounting for the ten cache object classes.
pub mod pool;
/// QoS policies consumed by the cache.
pub mod qos;
/// Sample reference nodes and ordered lists.
pub mod refs;
/// Sample records and the shared store.
pub mod sample;
/// Probabilistic skiplist for the promoted index.
pub mod skiplist;
/// Time-based filter (per-instance rate limiting).
mod tbf;
/// Local writer-to-reader transfer and pending-transfer lists.
pub mod transfer;
/// Fundamental types: handles, timestamps, sequence numbers.
pub mod types;
/// Blocking/waking support.
mod waiter;
/// Periodic QoS scans (deadline, lifespan, autopurge).
pub mod xqos;

pub use cache::{CacheStats, GetSpec, HistoryCache, InstanceInfo, SkipMask};
pub use filter::{KeySupport, Md5KeySupport, SampleFilter, SampleOrder};
pub use listener::{RejectCause, StatusListener};
pub use monitor::{RtpsMonitor, WriterDirectory};
pub use pool::{PoolClass, PoolConfig, PoolLimits};
pub use qos::{
    AccessScope, CacheOptions, CacheRole, DestinationOrderKind, DurabilityKind, History,
    OwnershipKind, ReliabilityKind, ResourceLimits, LENGTH_UNLIMITED,
};
pub use sample::{
    ChangeKind, InstanceState, Payload, Sample, SampleState, ViewState, MAX_SAMPLE_ACKS,
    MAX_SAMPLE_REFS,
};
pub use types::{
    EntityId, Guid, GuidPrefix, Hci, InstanceHandle, KeyHash, SequenceNumber, Ticks, Timestamp,
    WriterHandle, MAX_INST_HANDLE, NIL_HANDLE,
};
pub use xqos::{GuardKind, MIN_XQOS_DELAY};

/// Errors returned by cache operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Caller errors
    // ========================================================================
    /// Invalid argument (unknown instance, missing key, ...).
    BadParameter,
    /// Operation requires state the cache is not in (e.g. keyed access on
    /// a single-instance cache).
    PreconditionNotMet,

    // ========================================================================
    // Resource errors
    // ========================================================================
    /// A pool or QoS resource limit was hit.
    OutOfResources,
    /// Back-pressure: a reliable reader cache is currently blocked.
    NoData,
    /// A blocking call reached its deadline.
    Timeout,

    // ========================================================================
    // Lifecycle errors
    // ========================================================================
    /// The instance or cache was already freed.
    AlreadyDeleted,
    /// A process-wide hook was installed twice.
    AlreadyRegistered,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BadParameter => write!(f, "Bad parameter"),
            Error::PreconditionNotMet => write!(f, "Precondition not met"),
            Error::OutOfResources => write!(f, "Out of resources"),
            Error::NoData => write!(f, "No data: destination blocked"),
            Error::Timeout => write!(f, "Timeout"),
            Error::AlreadyDeleted => write!(f, "Already deleted"),
            Error::AlreadyRegistered => write!(f, "Already registered"),
        }
    }
}

impl std::error::Error for Error {}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
