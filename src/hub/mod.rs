//! Fan-out hub: the subscriber registry and snapshot delivery.
//!
//! The registry is the single source of truth for who is subscribed. It sits
//! behind one mutex; `register`, `unregister`, `publish` and `close` each take
//! it for a short, non-blocking critical section, so publish never observes a
//! half-updated set and never waits on a subscriber.
//!
//! Delivery policy: newest wins. A subscriber that has not consumed the
//! previous frame when the next one is published loses the stale frame; it is
//! never queued. Writes to the socket happen in the subscriber's own
//! connection task, one at a time, bounded by the write timeout.

mod feed;
mod metrics;

pub use feed::{DeliveryError, Frame, SubscriberFeed, SubscriberId};
pub use metrics::HubStats;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::snapshot::MetricsSnapshot;
use feed::{Mailbox, SubscriberState};
use metrics::HubMetrics;

/// Wire shape of every pushed message.
#[derive(Serialize)]
struct SnapshotMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    seq: u64,
    snapshot: &'a MetricsSnapshot,
}

struct Subscriber {
    mailbox: Mailbox,
    state: Arc<SubscriberState>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<SubscriberId, Subscriber>,
    closed: bool,
    seq: u64,
    last_captured_at: Option<DateTime<Utc>>,
    latest: Option<Arc<MetricsSnapshot>>,
}

/// Outcome of one successful publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub seq: u64,
    /// Live subscribers that received the frame.
    pub delivered: usize,
    /// Of those, how many still had an unconsumed older frame.
    pub stale_dropped: usize,
    /// Dead or disconnected subscribers removed by this publish.
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubError {
    /// The hub has been closed for shutdown.
    Closed,
    /// The snapshot is older than one already published.
    OutOfOrder {
        last: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
    Encode(String),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::Closed => write!(f, "hub is closed"),
            HubError::OutOfOrder { last, attempted } => write!(
                f,
                "snapshot captured at {} is older than last published {}",
                attempted, last
            ),
            HubError::Encode(msg) => write!(f, "failed to encode snapshot: {}", msg),
        }
    }
}

impl std::error::Error for HubError {}

pub struct Hub {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    metrics: HubMetrics,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            metrics: HubMetrics::default(),
        }
    }

    /// Adds a subscriber. It receives every frame published from now on.
    pub fn register(&self) -> Result<SubscriberFeed, HubError> {
        let mut reg = self.lock();
        if reg.closed {
            return Err(HubError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (mailbox, rx) = watch::channel(None);
        let state = Arc::new(SubscriberState::new());
        reg.subscribers.insert(
            id,
            Subscriber {
                mailbox,
                state: state.clone(),
            },
        );
        self.metrics.subscriber_registered();
        info!(
            subscriber = id,
            active = reg.subscribers.len(),
            "subscriber registered"
        );

        Ok(SubscriberFeed::new(id, rx, state))
    }

    /// Removes a subscriber. Returns `false` if it was already gone, in which
    /// case nothing is counted twice.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut reg = self.lock();
        let removed = reg.subscribers.remove(&id).is_some();
        if removed {
            self.metrics.subscriber_unregistered();
            info!(
                subscriber = id,
                active = reg.subscribers.len(),
                "subscriber unregistered"
            );
        }
        removed
    }

    /// Delivers `snapshot` to every live subscriber.
    ///
    /// Never waits on a subscriber: each delivery replaces the contents of
    /// that subscriber's mailbox. Subscribers flagged dead or whose feed was
    /// dropped are removed instead of served.
    pub fn publish(&self, snapshot: Arc<MetricsSnapshot>) -> Result<PublishReport, HubError> {
        let mut reg = self.lock();
        if reg.closed {
            return Err(HubError::Closed);
        }
        if let Some(last) = reg.last_captured_at
            && snapshot.captured_at < last
        {
            return Err(HubError::OutOfOrder {
                last,
                attempted: snapshot.captured_at,
            });
        }

        let seq = reg.seq + 1;
        let payload = serde_json::to_string(&SnapshotMessage {
            kind: "snapshot",
            seq,
            snapshot: &snapshot,
        })
        .map_err(|e| HubError::Encode(e.to_string()))?;
        let frame = Arc::new(Frame {
            seq,
            captured_at: snapshot.captured_at,
            payload: Arc::from(payload),
        });

        reg.seq = seq;
        reg.last_captured_at = Some(snapshot.captured_at);
        reg.latest = Some(snapshot);

        let mut report = PublishReport {
            seq,
            ..PublishReport::default()
        };
        let mut gone = Vec::new();
        for (id, sub) in &reg.subscribers {
            if !sub.state.is_alive() || sub.mailbox.is_closed() {
                gone.push(*id);
                continue;
            }
            let stale = sub
                .mailbox
                .borrow()
                .as_ref()
                .is_some_and(|prev| prev.seq > sub.state.taken());
            if stale {
                report.stale_dropped += 1;
            }
            sub.mailbox.send_replace(Some(frame.clone()));
            report.delivered += 1;
        }

        for id in gone {
            if reg.subscribers.remove(&id).is_some() {
                report.removed += 1;
                self.metrics.subscriber_unregistered();
                info!(subscriber = id, "dropped unresponsive subscriber");
            }
        }

        self.metrics
            .frame_published(report.delivered as u64, report.stale_dropped as u64);
        debug!(
            seq,
            delivered = report.delivered,
            stale_dropped = report.stale_dropped,
            removed = report.removed,
            "frame published"
        );
        Ok(report)
    }

    /// Closes the hub: every feed ends and later registrations are refused.
    /// Returns the number of subscribers dropped; `0` on repeated calls.
    pub fn close(&self) -> usize {
        let mut reg = self.lock();
        if reg.closed {
            return 0;
        }
        reg.closed = true;
        let dropped = reg.subscribers.len();
        for _ in reg.subscribers.drain() {
            self.metrics.subscriber_unregistered();
        }
        info!(dropped, "hub closed");
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_registered(&self, id: SubscriberId) -> bool {
        self.lock().subscribers.contains_key(&id)
    }

    /// The most recently published snapshot, if any.
    pub fn latest(&self) -> Option<Arc<MetricsSnapshot>> {
        self.lock().latest.clone()
    }

    pub fn stats(&self) -> HubStats {
        let active = self.subscriber_count();
        self.metrics.snapshot(active)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Critical sections never panic halfway through a mutation.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}
