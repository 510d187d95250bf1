//! Per-subscriber delivery path.
//!
//! Each subscriber owns a single-slot mailbox (a `watch` channel). The hub
//! overwrites the slot on every publish, so a subscriber that falls behind
//! skips straight to the newest frame instead of queueing stale ones.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

pub type SubscriberId = u64;

/// One serialised snapshot message, shared by every subscriber of a publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    /// JSON text pushed to the client as-is.
    pub payload: Arc<str>,
}

pub(crate) type Mailbox = watch::Sender<Option<Arc<Frame>>>;

/// State shared between the registry entry and the feed.
#[derive(Debug)]
pub(crate) struct SubscriberState {
    alive: AtomicBool,
    /// Sequence number of the last frame taken out of the mailbox.
    taken: AtomicU64,
}

impl SubscriberState {
    pub(crate) fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            taken: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn taken(&self) -> u64 {
        self.taken.load(Ordering::Acquire)
    }
}

/// Receiving side handed to the connection task on registration.
#[derive(Debug)]
pub struct SubscriberFeed {
    id: SubscriberId,
    rx: watch::Receiver<Option<Arc<Frame>>>,
    state: Arc<SubscriberState>,
}

impl SubscriberFeed {
    pub(crate) fn new(
        id: SubscriberId,
        rx: watch::Receiver<Option<Arc<Frame>>>,
        state: Arc<SubscriberState>,
    ) -> Self {
        Self { id, rx, state }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next frame. Returns `None` once the subscriber has been
    /// removed from the registry (or the hub closed) and nothing is pending.
    pub async fn recv(&mut self) -> Option<Arc<Frame>> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(frame) = self.take() {
                return Some(frame);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<Frame>> {
        match self.rx.has_changed() {
            Ok(true) => self.take(),
            _ => None,
        }
    }

    /// Flags the subscriber as unable to take deliveries (write failed or
    /// timed out). The hub drops it on its next publish.
    pub fn mark_dead(&self) {
        self.state.alive.store(false, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    fn take(&mut self) -> Option<Arc<Frame>> {
        let frame = self.rx.borrow_and_update().clone()?;
        self.state.taken.fetch_max(frame.seq, Ordering::AcqRel);
        Some(frame)
    }
}

/// Delivery to one subscriber failed. Only ever affects that subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The write did not finish within the configured bound.
    Timeout(Duration),
    /// The socket rejected the write (peer gone, protocol error).
    Transport(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Timeout(d) => write!(f, "write timed out after {:?}", d),
            DeliveryError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for DeliveryError {}
