//! Fixed-interval acquire/decode/publish loop.
//!
//! Every failure inside a cycle is absorbed here: an unavailable region or a
//! rejected image skips the cycle, and only the shutdown signal ends the
//! loop. A cycle that has started always runs to completion, including
//! release of the region view.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::hub::{Hub, HubError};
use crate::region::{AcquisitionError, RegionSource};
use crate::shutdown::ShutdownSignal;
use crate::snapshot::{DecodeError, MetricsSnapshot, decode};

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A snapshot went out to the hub with this sequence number.
    Published { seq: u64, delivered: usize },
    /// The region could not be acquired; retried next tick.
    Unavailable(AcquisitionError),
    /// The region was read but failed validation; nothing was sent.
    Rejected(DecodeError),
    /// Decoded, but the hub refused it (closed or out of order).
    Dropped(HubError),
}

/// Counters returned when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub cycles: u64,
    pub published: u64,
    pub unavailable: u64,
    pub rejected: u64,
    pub dropped: u64,
}

pub struct Poller<S> {
    source: Arc<S>,
    hub: Arc<Hub>,
    interval: Duration,
    last_captured_at: Option<DateTime<Utc>>,
    region_available: Option<bool>,
    stats: PollerStats,
}

impl<S: RegionSource + 'static> Poller<S> {
    pub fn new(source: S, hub: Arc<Hub>, interval: Duration) -> Self {
        Self {
            source: Arc::new(source),
            hub,
            interval,
            last_captured_at: None,
            region_available: None,
            stats: PollerStats::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stats(&self) -> PollerStats {
        self.stats
    }

    /// Runs until `shutdown` fires. The region read runs on the blocking
    /// pool; the tick cadence is not shifted by slow cycles (missed ticks are
    /// skipped rather than bunched up).
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> PollerStats {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "poller started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = tick.tick() => {}
            }

            let t0 = Instant::now();
            let captured_at = self.next_capture_time();
            let source = self.source.clone();
            let read = tokio::task::spawn_blocking(move || read_snapshot(&*source, captured_at))
                .await;

            let outcome = match read {
                Ok(result) => self.settle(result),
                Err(e) => {
                    warn!(error = %e, "poll cycle panicked, skipping");
                    continue;
                }
            };

            let elapsed = t0.elapsed();
            if elapsed > self.interval / 2 {
                warn!(
                    duration_ms = elapsed.as_millis() as u64,
                    interval_ms = self.interval.as_millis() as u64,
                    "poll cycle exceeded 50% of interval"
                );
            }
            if let CycleOutcome::Dropped(HubError::Closed) = outcome {
                break;
            }
        }

        info!(
            cycles = self.stats.cycles,
            published = self.stats.published,
            unavailable = self.stats.unavailable,
            rejected = self.stats.rejected,
            "poller stopped"
        );
        self.stats
    }

    /// One synchronous cycle on the calling thread.
    pub fn poll_once(&mut self) -> CycleOutcome {
        let captured_at = self.next_capture_time();
        let result = read_snapshot(&*self.source, captured_at);
        self.settle(result)
    }

    /// Wall clock, clamped so capture times never go backwards.
    fn next_capture_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_captured_at {
            Some(prev) if now < prev => prev,
            _ => now,
        }
    }

    fn settle(&mut self, result: Result<MetricsSnapshot, CycleFailure>) -> CycleOutcome {
        self.stats.cycles += 1;
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(CycleFailure::Acquire(e)) => {
                self.stats.unavailable += 1;
                if self.region_available != Some(false) {
                    info!(reason = %e, "shared region unavailable, will keep polling");
                } else {
                    debug!(reason = %e, "shared region still unavailable");
                }
                self.region_available = Some(false);
                return CycleOutcome::Unavailable(e);
            }
            Err(CycleFailure::Decode(e)) => {
                self.stats.rejected += 1;
                self.mark_available();
                warn!(error = %e, "discarding region image");
                return CycleOutcome::Rejected(e);
            }
        };
        self.mark_available();

        let captured_at = snapshot.captured_at;
        match self.hub.publish(Arc::new(snapshot)) {
            Ok(report) => {
                self.stats.published += 1;
                self.last_captured_at = Some(captured_at);
                CycleOutcome::Published {
                    seq: report.seq,
                    delivered: report.delivered,
                }
            }
            Err(e) => {
                self.stats.dropped += 1;
                debug!(error = %e, "hub refused snapshot");
                CycleOutcome::Dropped(e)
            }
        }
    }

    fn mark_available(&mut self) {
        if self.region_available == Some(false) {
            info!("shared region available again");
        }
        self.region_available = Some(true);
    }
}

enum CycleFailure {
    Acquire(AcquisitionError),
    Decode(DecodeError),
}

/// Acquire, decode, release. The view is dropped inside `with_region` on
/// every path; only the owned snapshot escapes.
fn read_snapshot<S: RegionSource>(
    source: &S,
    captured_at: DateTime<Utc>,
) -> Result<MetricsSnapshot, CycleFailure> {
    source
        .with_region(|bytes| decode(bytes, captured_at))
        .map_err(CycleFailure::Acquire)?
        .map_err(CycleFailure::Decode)
}
