//! Hub counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct HubMetrics {
    registered: AtomicU64,
    unregistered: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    stale_dropped: AtomicU64,
}

impl HubMetrics {
    pub(crate) fn subscriber_registered(&self) {
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn subscriber_unregistered(&self) {
        self.unregistered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_published(&self, delivered: u64, stale_dropped: u64) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.stale_dropped.fetch_add(stale_dropped, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, active: usize) -> HubStats {
        HubStats {
            active_subscribers: active,
            registered_total: self.registered.load(Ordering::Relaxed),
            unregistered_total: self.unregistered.load(Ordering::Relaxed),
            frames_published: self.published.load(Ordering::Relaxed),
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of hub activity, served by the health endpoint.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub active_subscribers: usize,
    pub registered_total: u64,
    pub unregistered_total: u64,
    pub frames_published: u64,
    /// Frames placed into a subscriber mailbox.
    pub frames_delivered: u64,
    /// Unconsumed frames replaced by a newer one.
    pub frames_stale_dropped: u64,
}
