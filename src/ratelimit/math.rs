//! Pure rate math shared by the server-side limiter and the client-side
//! estimator.
//!
//! [`compute`] is side-effect-free: given a prior shard state, a resolved
//! configuration, a timestamp, and a unit count, it derives the shard's
//! current value (refill or window rollover included), whether the count can
//! be consumed, and, on rejection, how long until it could be. Both the
//! limiter service and the client estimator call the exact same function,
//! which is what keeps their predictions in agreement.

use crate::ratelimit::config::{LimiterKind, ResolvedConfig};
use crate::store::ShardState;
use crate::time::{Milliseconds, Timestamp};

/// Outcome of one rate-math evaluation against a single shard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateMathResult {
    /// The shard value after refill/rollover and, if accepted, after
    /// subtracting the requested count.
    pub value: f64,
    /// Timestamp to persist: the evaluation instant for token buckets, the
    /// window start for fixed windows.
    pub ts: Timestamp,
    /// Delay until the count could be afforded. `None` means the consumption
    /// was accepted, even when the accepted value is negative within the
    /// reservation budget.
    pub retry_after: Option<Milliseconds>,
    /// The derived window start, fixed windows only.
    pub window_start: Option<Timestamp>,
}

impl RateMathResult {
    /// Whether the requested count was accepted.
    pub fn accepted(&self) -> bool {
        self.retry_after.is_none()
    }

    /// The persistable shard state for this result.
    pub fn state(&self) -> ShardState {
        ShardState {
            value: self.value,
            ts: self.ts,
        }
    }
}

/// Evaluate a shard at `now` and attempt to consume `count` units.
///
/// A `count` of zero is a valid probe: refill and window rollover are still
/// applied, nothing is subtracted. Rejection never subtracts; the returned
/// value then reflects bookkeeping only (refill applied, window rolled) and
/// `retry_after` says when the count would fit.
pub fn compute(
    existing: Option<&ShardState>,
    config: &ResolvedConfig,
    now: Timestamp,
    count: f64,
) -> RateMathResult {
    match config.kind {
        LimiterKind::TokenBucket => compute_token_bucket(existing, config, now, count),
        LimiterKind::FixedWindow => compute_fixed_window(existing, config, now, count),
    }
}

fn compute_token_bucket(
    existing: Option<&ShardState>,
    config: &ResolvedConfig,
    now: Timestamp,
    count: f64,
) -> RateMathResult {
    let capacity = config.capacity_per_shard();
    let rate = config.rate_per_shard();

    let value = match existing {
        None => capacity,
        Some(state) => {
            // Clamped so a state written by a marginally-ahead clock never
            // drains the bucket.
            let elapsed = (now - state.ts).max(0) as f64;
            let refill = elapsed * rate / config.period_ms;
            (state.value + refill).min(capacity)
        }
    };

    if value - count >= -config.max_reserved_per_shard() {
        RateMathResult {
            value: value - count,
            ts: now,
            retry_after: None,
            window_start: None,
        }
    } else {
        RateMathResult {
            value,
            ts: now,
            retry_after: Some((count - value) * config.period_ms / rate),
            window_start: None,
        }
    }
}

fn compute_fixed_window(
    existing: Option<&ShardState>,
    config: &ResolvedConfig,
    now: Timestamp,
    count: f64,
) -> RateMathResult {
    let capacity = config.capacity_per_shard();
    let period = config.period_ms;

    let (value, window_start) = match existing {
        None => match config.start_ms {
            // An explicit epoch anchors the window grid; land on the grid
            // boundary at or before `now`.
            Some(start) if start <= now => (capacity, advance_window(start, now, period)),
            _ => (capacity, now),
        },
        Some(state) => {
            if now >= state.ts && ((now - state.ts) as f64) < period {
                (state.value, state.ts)
            } else if now < state.ts {
                // State written by a marginally-ahead clock; treat as the
                // current window.
                (state.value, state.ts)
            } else {
                // Crossed one or more boundaries: advance by whole periods,
                // value resets to full capacity.
                (capacity, advance_window(state.ts, now, period))
            }
        }
    };

    if value - count >= -config.max_reserved_per_shard() {
        RateMathResult {
            value: value - count,
            ts: window_start,
            retry_after: None,
            window_start: Some(window_start),
        }
    } else {
        RateMathResult {
            value,
            ts: window_start,
            retry_after: Some(window_start as Milliseconds + period - now as Milliseconds),
            window_start: Some(window_start),
        }
    }
}

/// The window-grid boundary at or before `now`, anchored at `anchor`.
fn advance_window(anchor: Timestamp, now: Timestamp, period_ms: f64) -> Timestamp {
    let periods = ((now - anchor) as f64 / period_ms).floor();
    anchor + (periods * period_ms) as Timestamp
}
