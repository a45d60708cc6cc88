//! Client-side predictive estimator.
//!
//! A client fetches a [`Snapshot`] once (via the service's `peek`) and then
//! answers "is this allowed right now / when will it be allowed" locally,
//! with no further round-trips: the same rate math the server runs is
//! replayed against the snapshot at the skew-corrected server time. A
//! background watch re-checks exactly at the predicted retry instant, so UI
//! state flips to "available" without polling.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::ratelimit::{compute, Snapshot};
use crate::store::ShardState;
use crate::time::{now_ms, Milliseconds, Timestamp};

/// A local availability estimate derived from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Projected shard value at the corrected server time (after
    /// subtraction when the count fits).
    pub value: f64,
    /// Server-time instant the projection is anchored to.
    pub ts: Timestamp,
    /// Whether the count would be accepted right now.
    pub ok: bool,
    /// When `ok` is false: the client-clock instant at which the count is
    /// predicted to fit.
    pub retry_at: Option<Timestamp>,
}

struct EstimatorInner {
    snapshot: RwLock<Snapshot>,
    /// Estimated `server_time - client_time - rtt/2`.
    time_offset: RwLock<Milliseconds>,
    /// Woken on every snapshot or offset change; watches re-check on it.
    changed: Notify,
}

impl EstimatorInner {
    fn check_at(&self, client_time: Timestamp, count: f64) -> Estimate {
        let offset = *self.time_offset.read();
        let snapshot = self.snapshot.read().clone();

        let server_time = (client_time as Milliseconds + offset).round() as Timestamp;
        let state = ShardState {
            value: snapshot.value,
            ts: snapshot.ts,
        };
        let result = compute(Some(&state), &snapshot.config, server_time, count);

        match result.retry_after {
            None => Estimate {
                value: result.value,
                ts: result.ts,
                ok: true,
                retry_at: None,
            },
            Some(retry_after) => {
                // Translate the server-relative delay back to the client
                // clock.
                let retry_at =
                    (server_time as Milliseconds + retry_after - offset).ceil() as Timestamp;
                Estimate {
                    value: result.value,
                    ts: result.ts,
                    ok: false,
                    retry_at: Some(retry_at),
                }
            }
        }
    }
}

/// Predicts limiter availability between server round-trips.
///
/// Cheap to clone; clones share the snapshot, the clock offset, and the
/// change notifications.
#[derive(Clone)]
pub struct ClientEstimator {
    inner: Arc<EstimatorInner>,
}

impl ClientEstimator {
    /// Create an estimator over an initial snapshot, with no clock
    /// correction yet.
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            inner: Arc::new(EstimatorInner {
                snapshot: RwLock::new(snapshot),
                time_offset: RwLock::new(0.0),
                changed: Notify::new(),
            }),
        }
    }

    /// Derive the clock offset from one server-time probe.
    ///
    /// `sent_at` and `received_at` are client-clock instants around the
    /// probe; `server_time` is the server's reported time. Half the round
    /// trip is attributed to the request leg.
    pub fn sync_clock(&self, sent_at: Timestamp, server_time: Timestamp, received_at: Timestamp) {
        let rtt = (received_at - sent_at).max(0) as Milliseconds;
        let offset = server_time as Milliseconds - sent_at as Milliseconds - rtt / 2.0;
        trace!(offset = offset, rtt = rtt, "Synchronized client clock");
        *self.inner.time_offset.write() = offset;
        self.inner.changed.notify_waiters();
    }

    /// The current estimated clock offset in milliseconds.
    pub fn time_offset(&self) -> Milliseconds {
        *self.inner.time_offset.read()
    }

    /// Replace the held snapshot with a fresher observation and wake any
    /// watches.
    pub fn observe(&self, snapshot: Snapshot) {
        *self.inner.snapshot.write() = snapshot;
        self.inner.changed.notify_waiters();
    }

    /// The snapshot currently held.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot.read().clone()
    }

    /// Estimate availability of `count` units right now. Pure local
    /// computation, no I/O.
    pub fn check(&self, count: f64) -> Estimate {
        self.check_at(now_ms(), count)
    }

    /// [`check`](Self::check) at an explicit client-clock instant.
    pub fn check_at(&self, client_time: Timestamp, count: f64) -> Estimate {
        self.inner.check_at(client_time, count)
    }

    /// Subscribe to availability of `count` units.
    ///
    /// The returned watch carries the current estimate and re-checks on
    /// every fresher snapshot and, while unavailable, exactly at the
    /// predicted retry instant. One timer per subscription; the background
    /// task is aborted when the watch is dropped.
    pub fn watch(&self, count: f64) -> AvailabilityWatch {
        let inner = Arc::clone(&self.inner);
        let initial = inner.check_at(now_ms(), count).ok;
        let (tx, rx) = watch::channel(initial);

        let task = tokio::spawn(async move {
            loop {
                // Register for change notifications before computing, so an
                // observe() racing with the check is never missed.
                let notified = inner.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let estimate = inner.check_at(now_ms(), count);
                tx.send_if_modified(|available| {
                    if *available != estimate.ok {
                        *available = estimate.ok;
                        true
                    } else {
                        false
                    }
                });

                match estimate.retry_at {
                    Some(retry_at) => {
                        let delay = (retry_at - now_ms()).max(1) as u64;
                        tokio::select! {
                            _ = notified.as_mut() => {}
                            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        }
                    }
                    // Available: nothing to do until the snapshot changes.
                    None => notified.as_mut().await,
                }
            }
        });

        AvailabilityWatch { rx, task }
    }
}

/// A live availability subscription produced by [`ClientEstimator::watch`].
pub struct AvailabilityWatch {
    rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl AvailabilityWatch {
    /// The most recently estimated availability.
    pub fn is_available(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the availability estimate to change.
    pub async fn changed(&mut self) {
        // The sender lives in the background task; it only goes away when
        // this watch is dropped, so an error here just means teardown.
        let _ = self.rx.changed().await;
    }

    /// A cloneable receiver for wiring into UI state.
    pub fn receiver(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

impl Drop for AvailabilityWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
