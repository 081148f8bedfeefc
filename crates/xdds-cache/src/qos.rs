// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! QoS surface of the history cache.
//!
//! Only the policies the cache itself enforces appear here; everything else
//! (latency budget, transport priority, ...) lives with the endpoint layer.
//! `CacheOptions` is the creation-time bundle; `qos_update` re-applies a
//! changed bundle to a live cache.

use std::sync::Arc;
use std::time::Duration;

use crate::filter::{KeySupport, SampleFilter};
use crate::listener::StatusListener;
use crate::monitor::WriterDirectory;
use crate::types::WriterHandle;

/// "No limit" marker for resource limits (DDS `LENGTH_UNLIMITED`).
pub const LENGTH_UNLIMITED: u32 = u32::MAX;

/// HISTORY policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    /// Keep at most the given number of samples per instance.
    KeepLast(u32),
    /// Keep everything up to the resource limits.
    KeepAll,
}

impl History {
    /// Per-instance depth implied by the policy.
    pub fn depth(self) -> u32 {
        match self {
            History::KeepLast(depth) => depth.max(1),
            History::KeepAll => LENGTH_UNLIMITED,
        }
    }
}

impl Default for History {
    /// Default: KEEP_LAST with depth 1.
    fn default() -> Self {
        History::KeepLast(1)
    }
}

/// RESOURCE_LIMITS policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Total samples across all instances.
    pub max_samples: u32,
    /// Distinct instances.
    pub max_instances: u32,
    /// Samples within one instance.
    pub max_samples_per_instance: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_samples: LENGTH_UNLIMITED,
            max_instances: LENGTH_UNLIMITED,
            max_samples_per_instance: LENGTH_UNLIMITED,
        }
    }
}

/// DURABILITY policy (the slice of it the cache cares about).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityKind {
    /// Samples may be discarded once acknowledged.
    #[default]
    Volatile,
    /// Samples are retained for late-joining readers.
    TransientLocal,
}

impl DurabilityKind {
    /// True when samples outlive acknowledgement.
    pub fn is_durable(self) -> bool {
        matches!(self, DurabilityKind::TransientLocal)
    }
}

/// RELIABILITY policy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReliabilityKind {
    /// Fire and forget.
    #[default]
    BestEffort,
    /// Delivery tracked by acknowledgements.
    Reliable,
}

/// OWNERSHIP policy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnershipKind {
    /// Any writer may update any instance.
    #[default]
    Shared,
    /// Highest-strength writer owns each instance.
    Exclusive,
}

/// DESTINATION_ORDER policy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestinationOrderKind {
    /// Order samples by arrival.
    #[default]
    ByReceptionTimestamp,
    /// Order samples by source timestamp.
    BySourceTimestamp,
}

/// PRESENTATION access scope (the slice the cache iterates by).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessScope {
    /// Iterate instance by instance.
    #[default]
    Instance,
    /// Preserve cache-wide order across instances.
    Topic,
}

/// Which side of the topic this cache serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRole {
    /// Attached to a data writer.
    Writer,
    /// Attached to a data reader.
    Reader,
}

/// Creation-time configuration of a history cache.
#[derive(Clone)]
pub struct CacheOptions {
    /// Writer or reader side.
    pub role: CacheRole,
    /// Entity handle of the owning endpoint (used as the writer handle on
    /// locally transferred samples and as the destination id on readers).
    pub endpoint: WriterHandle,
    /// Keyed topic (multi-instance) or single-instance.
    pub multi_instance: bool,
    /// HISTORY policy.
    pub history: History,
    /// RESOURCE_LIMITS policy.
    pub limits: ResourceLimits,
    /// DURABILITY policy.
    pub durability: DurabilityKind,
    /// RELIABILITY policy kind.
    pub reliability: ReliabilityKind,
    /// RELIABILITY max blocking time for writer-side admission.
    pub max_blocking_time: Duration,
    /// DESTINATION_ORDER policy.
    pub destination_order: DestinationOrderKind,
    /// PRESENTATION access scope.
    pub access_scope: AccessScope,
    /// OWNERSHIP policy.
    pub ownership: OwnershipKind,
    /// Partition names (empty means the default partition).
    pub partition: Vec<String>,
    /// Serialised key size in bytes; 0 for keyless or unbounded keys.
    pub key_size: u32,
    /// Use the secure (always hashed) key-hash construction.
    pub secure_hash: bool,
    /// Purge history depth by total change count rather than data count
    /// (reference/built-in topics).
    pub ref_type: bool,
    /// WRITER_DATA_LIFECYCLE auto-dispose: unregister upgrades to zombie.
    pub auto_dispose: bool,
    /// LIVELINESS bookkeeping enabled.
    pub liveliness: bool,
    /// DEADLINE scan participates in `handle_xqos`.
    pub deadline: bool,
    /// LIFESPAN scan participates in `handle_xqos`.
    pub lifespan: bool,
    /// READER_DATA_LIFECYCLE autopurge of no-writer instances.
    pub autopurge_no_writers: bool,
    /// READER_DATA_LIFECYCLE autopurge of disposed instances.
    pub autopurge_disposed: bool,
    /// TIME_BASED_FILTER minimum separation (None disables filtering).
    pub tbf_separation: Option<Duration>,
    /// Content filter of the subscribed (filtered) topic, reader side.
    pub content_filter: Option<Arc<dyn SampleFilter>>,
    /// Key hashing support; `None` selects the stock MD5 construction.
    pub key_support: Option<Arc<dyn KeySupport>>,
    /// Ownership-strength/GUID lookup for exclusive arbitration.
    pub writer_directory: Option<Arc<dyn WriterDirectory>>,
    /// DCPS status listener.
    pub listener: Option<Arc<dyn StatusListener>>,
}

impl std::fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("role", &self.role)
            .field("multi_instance", &self.multi_instance)
            .field("history", &self.history)
            .field("limits", &self.limits)
            .field("durability", &self.durability)
            .field("reliability", &self.reliability)
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

impl CacheOptions {
    fn base(role: CacheRole, multi_instance: bool) -> Self {
        Self {
            role,
            endpoint: 0,
            multi_instance,
            history: History::default(),
            limits: ResourceLimits::default(),
            durability: DurabilityKind::default(),
            reliability: ReliabilityKind::default(),
            max_blocking_time: Duration::ZERO,
            destination_order: DestinationOrderKind::default(),
            access_scope: AccessScope::default(),
            ownership: OwnershipKind::default(),
            partition: Vec::new(),
            key_size: 0,
            secure_hash: false,
            ref_type: false,
            auto_dispose: false,
            liveliness: false,
            deadline: false,
            lifespan: false,
            autopurge_no_writers: false,
            autopurge_disposed: false,
            tbf_separation: None,
            content_filter: None,
            key_support: None,
            writer_directory: None,
            listener: None,
        }
    }

    /// Writer-side cache options.
    pub fn writer(multi_instance: bool) -> Self {
        Self::base(CacheRole::Writer, multi_instance)
    }

    /// Reader-side cache options.
    pub fn reader(multi_instance: bool) -> Self {
        Self::base(CacheRole::Reader, multi_instance)
    }

    /// Set the owning endpoint's entity handle.
    #[must_use]
    pub fn endpoint(mut self, handle: WriterHandle) -> Self {
        self.endpoint = handle;
        self
    }

    /// Attach a content filter (filtered-topic reader).
    #[must_use]
    pub fn content_filter(mut self, filter: Arc<dyn SampleFilter>) -> Self {
        self.content_filter = Some(filter);
        self
    }

    /// Enable the time-based filter with the given minimum separation.
    #[must_use]
    pub fn time_based_filter(mut self, separation: Duration) -> Self {
        self.tbf_separation = Some(separation);
        self
    }

    /// Set the HISTORY policy.
    #[must_use]
    pub fn history(mut self, history: History) -> Self {
        self.history = history;
        self
    }

    /// Set the RESOURCE_LIMITS policy.
    #[must_use]
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Reliable delivery with the given max blocking time.
    #[must_use]
    pub fn reliable(mut self, max_blocking_time: Duration) -> Self {
        self.reliability = ReliabilityKind::Reliable;
        self.max_blocking_time = max_blocking_time;
        self
    }

    /// Transient-local durability.
    #[must_use]
    pub fn transient_local(mut self) -> Self {
        self.durability = DurabilityKind::TransientLocal;
        self
    }

    /// Exclusive ownership with the given arbitration directory.
    #[must_use]
    pub fn exclusive(mut self, directory: Arc<dyn WriterDirectory>) -> Self {
        self.ownership = OwnershipKind::Exclusive;
        self.writer_directory = Some(directory);
        self
    }

    /// Order by source timestamps.
    #[must_use]
    pub fn by_source_time(mut self) -> Self {
        self.destination_order = DestinationOrderKind::BySourceTimestamp;
        self
    }

    /// Set the serialised key size (0 for keyless).
    #[must_use]
    pub fn key_size(mut self, size: u32) -> Self {
        self.key_size = size;
        self
    }

    /// Attach a status listener.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// True when the writer side must track acknowledgements.
    pub fn must_ack(&self) -> bool {
        self.reliability == ReliabilityKind::Reliable
    }

    /// True when source-timestamp ordering applies.
    pub fn src_time_order(&self) -> bool {
        self.destination_order == DestinationOrderKind::BySourceTimestamp
    }
}

/// Partition compatibility: at least one shared name, with an empty set
/// standing for the default partition.
pub fn partitions_match(a: &[String], b: &[String]) -> bool {
    static DEFAULT: String = String::new();
    let a: &[String] = if a.is_empty() {
        std::slice::from_ref(&DEFAULT)
    } else {
        a
    };
    let b: &[String] = if b.is_empty() {
        std::slice::from_ref(&DEFAULT)
    } else {
        b
    };
    a.iter().any(|p| b.iter().any(|q| p == q))
}

/// Request-vs-offered compatibility between a writer and a reader cache.
pub fn compatible(writer: &CacheOptions, reader: &CacheOptions) -> bool {
    // Reliability: reliable readers need a reliable writer.
    if reader.reliability == ReliabilityKind::Reliable
        && writer.reliability != ReliabilityKind::Reliable
    {
        return false;
    }
    // Durability: durable readers need a durable writer.
    if reader.durability.is_durable() && !writer.durability.is_durable() {
        return false;
    }
    // Ownership kinds must match exactly.
    if writer.ownership != reader.ownership {
        return false;
    }
    // Destination order: source-time readers need source-time writers.
    if reader.destination_order == DestinationOrderKind::BySourceTimestamp
        && writer.destination_order != DestinationOrderKind::BySourceTimestamp
    {
        return false;
    }
    partitions_match(&writer.partition, &reader.partition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_depth() {
        assert_eq!(History::KeepLast(4).depth(), 4);
        assert_eq!(History::KeepLast(0).depth(), 1);
        assert_eq!(History::KeepAll.depth(), LENGTH_UNLIMITED);
    }

    #[test]
    fn reliability_compat() {
        let w = CacheOptions::writer(true);
        let r = CacheOptions::reader(true).reliable(Duration::ZERO);
        assert!(!compatible(&w, &r));
        let w = w.reliable(Duration::ZERO);
        assert!(compatible(&w, &r));
        // Reliable writer serves best-effort reader.
        assert!(compatible(&w, &CacheOptions::reader(true)));
    }

    #[test]
    fn durability_compat() {
        let w = CacheOptions::writer(true);
        let r = CacheOptions::reader(true).transient_local();
        assert!(!compatible(&w, &r));
        assert!(compatible(&w.transient_local(), &r));
    }

    #[test]
    fn partition_matching() {
        assert!(partitions_match(&[], &[]));
        assert!(partitions_match(
            &["a".into(), "b".into()],
            &["b".into(), "c".into()]
        ));
        assert!(!partitions_match(&["a".into()], &["b".into()]));
        assert!(!partitions_match(&[], &["b".into()]));
        assert!(partitions_match(&[String::new()], &[]));
    }

    #[test]
    fn destination_order_compat() {
        let w = CacheOptions::writer(true);
        let r = CacheOptions::reader(true).by_source_time();
        assert!(!compatible(&w, &r));
        assert!(compatible(&w.by_source_time(), &r));
    }
}
