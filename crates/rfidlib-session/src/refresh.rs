//! Periodic display refresh.
//!
//! The refresh task ticks on a fixed interval regardless of read activity,
//! takes an [`AggregateSnapshot`], computes the instantaneous read rate over
//! the last tick, and publishes both through a [`watch`] channel. It only
//! ever works from snapshots, so a clear between ticks is harmless: a total
//! lower than the previous one resets the rate baseline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::aggregator::{AggregateSnapshot, TagAggregator};

/// One published refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshTick {
    pub snapshot: AggregateSnapshot,
    /// Observations per second over the last interval.
    pub instant_rate: f64,
}

/// Handle to a running refresh task. Dropping it stops the task.
#[derive(Debug)]
pub struct RefreshTimer {
    ticks: watch::Receiver<Option<RefreshTick>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RefreshTimer {
    /// Receiver for published ticks; `None` until the first tick.
    pub fn subscribe(&self) -> watch::Receiver<Option<RefreshTick>> {
        self.ticks.clone()
    }

    /// Stop the task and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Tracks the previous total to turn totals into a per-tick rate.
#[derive(Debug, Default)]
struct RateTracker {
    last: Option<(u64, Instant)>,
}

impl RateTracker {
    fn update(&mut self, total: u64, now: Instant) -> f64 {
        let rate = match self.last {
            Some((prev, at)) if total >= prev => {
                let secs = now.saturating_duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    (total - prev) as f64 / secs
                } else {
                    0.0
                }
            }
            // First tick, or the aggregate was cleared since the last one.
            _ => 0.0,
        };
        self.last = Some((total, now));
        rate
    }
}

/// Spawn the refresh task for `aggregator`, ticking every `interval`.
pub fn spawn_refresh_timer(aggregator: Arc<TagAggregator>, interval: Duration) -> RefreshTimer {
    let (tx, rx) = watch::channel(None);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(refresh_loop(aggregator, interval, tx, cancel.clone()));
    RefreshTimer {
        ticks: rx,
        cancel,
        task: Some(task),
    }
}

async fn refresh_loop(
    aggregator: Arc<TagAggregator>,
    interval: Duration,
    tx: watch::Sender<Option<RefreshTick>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut rate = RateTracker::default();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                trace!("refresh timer stopped");
                break;
            }

            _ = ticker.tick() => {
                let snapshot = aggregator.snapshot();
                let instant_rate = rate.update(snapshot.total_reads, Instant::now());
                tx.send_replace(Some(RefreshTick {
                    snapshot,
                    instant_rate,
                }));
            }
        }
    }
}
