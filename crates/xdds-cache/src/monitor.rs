// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide RTPS hooks.
//!
//! The RTPS layer installs a single [`RtpsMonitor`] at start-up; caches that
//! call `monitor_start` route their change traffic through it, tagged with a
//! per-cache user token. Installation is write-once.

use std::sync::Arc;
use std::sync::OnceLock;

use crate::sample::Sample;
use crate::types::{Guid, Hci, WriterHandle};
use crate::{Error, Result};

/// Callbacks into the RTPS layer.
pub trait RtpsMonitor: Send + Sync {
    /// A monitored writer cache accepted a new change.
    ///
    /// The RTPS layer takes acknowledgement references on the sample
    /// (`Sample::add_ack_ref`) for every reliable proxy that will carry it.
    fn new_change(&self, user: u64, sample: &Arc<Sample>, hci: Option<Hci>);

    /// The cache removed a change that still had outstanding acks.
    fn remove_change(&self, user: u64, sample: &Arc<Sample>);

    /// The cache requests an immediate acknowledgement round.
    fn urgent_change(&self, user: u64, sample: &Arc<Sample>);

    /// A previously blocked reader cache accepts data again.
    fn unblock(&self, user: u64);

    /// Emit a liveliness message for this endpoint.
    fn alive(&self, user: u64);

    /// An instance the RTPS layer held an HCI for has disappeared.
    fn instance_flushed(&self, user: u64, hci: Hci);
}

/// Ownership-strength and GUID lookup used by exclusive arbitration.
pub trait WriterDirectory: Send + Sync {
    /// OWNERSHIP_STRENGTH of the writer (0 when unknown).
    fn strength(&self, writer: WriterHandle) -> u32;

    /// Full GUID of the writer, for the lexicographic tie-break.
    fn guid(&self, writer: WriterHandle) -> Option<Guid>;
}

static MONITOR: OnceLock<Arc<dyn RtpsMonitor>> = OnceLock::new();

/// Install the process-wide RTPS monitor.
///
/// Fails with `AlreadyRegistered` on a second installation.
pub fn install(monitor: Arc<dyn RtpsMonitor>) -> Result<()> {
    MONITOR
        .set(monitor)
        .map_err(|_| Error::AlreadyRegistered)
}

/// The installed monitor, if any.
pub fn installed() -> Option<&'static Arc<dyn RtpsMonitor>> {
    MONITOR.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMonitor {
        new_changes: AtomicUsize,
    }

    impl RtpsMonitor for CountingMonitor {
        fn new_change(&self, _user: u64, _sample: &Arc<Sample>, _hci: Option<Hci>) {
            self.new_changes.fetch_add(1, Ordering::Relaxed);
        }
        fn remove_change(&self, _user: u64, _sample: &Arc<Sample>) {}
        fn urgent_change(&self, _user: u64, _sample: &Arc<Sample>) {}
        fn unblock(&self, _user: u64) {}
        fn alive(&self, _user: u64) {}
        fn instance_flushed(&self, _user: u64, _hci: Hci) {}
    }

    #[test]
    fn install_is_write_once() {
        let m = Arc::new(CountingMonitor {
            new_changes: AtomicUsize::new(0),
        });
        // First install may race other tests in this binary; either way the
        // second explicit install must report AlreadyRegistered.
        let _ = install(m.clone());
        assert!(matches!(install(m), Err(Error::AlreadyRegistered)));
        assert!(installed().is_some());
    }
}
