//! Core limiter service: shard selection, atomic consume, sampling peek.

use parking_lot::RwLock;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::LimitsConfig;
use crate::error::{FloodgateError, Result};
use crate::store::ShardStore;
use crate::time::{now_ms, Milliseconds, Timestamp};

use super::config::{LimiterKind, RateLimitConfig, ResolvedConfig};
use super::math::{self, RateMathResult};

/// Rows deleted per batch during a staleness sweep. Keeps each storage
/// round-trip bounded; the sweep loops until exhausted.
const SWEEP_BATCH_SIZE: usize = 100;

/// Options for a single consumption.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOptions {
    /// Units to consume.
    pub count: f64,
    /// Allow the shard to go negative up to the configured `max_reserved`,
    /// accepting immediately and owing the deficit to future refill.
    pub reserve: bool,
    /// Surface rejection as [`FloodgateError::RateLimited`] instead of a
    /// normal `ok = false` status.
    pub throw_on_reject: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            count: 1.0,
            reserve: false,
            throw_on_reject: false,
        }
    }
}

/// Outcome of a consume or check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// Whether the consumption was accepted.
    pub ok: bool,
    /// On rejection: delay until the count would fit. On an accepted
    /// reservation: delay until the owed deficit clears, for callers that
    /// schedule delayed execution.
    pub retry_after: Option<Milliseconds>,
}

/// A point-in-time observation of one shard, consumed by the client-side
/// estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Projected shard value at `ts`.
    pub value: f64,
    /// Reference timestamp of the observation, in server time.
    pub ts: Timestamp,
    /// Index of the observed shard.
    pub shard: u32,
    /// Resolved configuration; for fixed windows without an explicit start,
    /// `start_ms` is back-filled from the observed window so repeated peeks
    /// stay on one grid.
    pub config: ResolvedConfig,
}

/// The rate limiter service.
///
/// Generic over the storage adapter; all state lives behind [`ShardStore`],
/// the service itself is stateless apart from the named-limiter registry.
pub struct RateLimiter<S> {
    store: S,
    limits: RwLock<LimitsConfig>,
}

impl<S: ShardStore> RateLimiter<S> {
    /// Create a limiter service over a storage adapter.
    pub fn new(store: S) -> Self {
        Self {
            store,
            limits: RwLock::new(LimitsConfig::default()),
        }
    }

    /// Create a limiter service with a pre-loaded named-limiter registry.
    pub fn with_limits(store: S, limits: LimitsConfig) -> Self {
        Self {
            store,
            limits: RwLock::new(limits),
        }
    }

    /// Replace the named-limiter registry.
    pub fn set_limits(&self, limits: LimitsConfig) {
        *self.limits.write() = limits;
    }

    /// The current named-limiter registry.
    pub fn limits(&self) -> LimitsConfig {
        self.limits.read().clone()
    }

    /// Look up the registered configuration for a limiter name.
    pub fn named_config(&self, name: &str) -> Result<RateLimitConfig> {
        self.limits
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FloodgateError::Config(format!("no limiter named {name:?}")))
    }

    /// The storage adapter backing this service.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Authoritative server time, for client clock-skew probes.
    pub fn server_time(&self) -> Timestamp {
        now_ms()
    }

    /// Consume units from a limiter, atomically per shard.
    pub async fn consume(
        &self,
        name: &str,
        key: Option<&str>,
        config: &RateLimitConfig,
        options: ConsumeOptions,
    ) -> Result<RateLimitStatus> {
        self.consume_at(name, key, config, options, now_ms()).await
    }

    /// [`consume`](Self::consume) at an explicit timestamp, for replay and
    /// deterministic tests.
    pub async fn consume_at(
        &self,
        name: &str,
        key: Option<&str>,
        config: &RateLimitConfig,
        options: ConsumeOptions,
        now: Timestamp,
    ) -> Result<RateLimitStatus> {
        let resolved = config.resolve()?;
        validate_count(options.count)?;

        // Without reservation the acceptance budget is zero: a non-reserving
        // caller may never drive a shard negative.
        let effective = if options.reserve {
            resolved.clone()
        } else {
            resolved.without_reservation()
        };

        let shard = pick_shard(resolved.shards);
        trace!(
            name = name,
            key = ?key,
            shard = shard,
            count = options.count,
            reserve = options.reserve,
            "Consuming rate limit units"
        );

        let count = options.count;
        let result = self
            .store
            .update(name, key, shard, move |existing| {
                let result = math::compute(existing.as_ref(), &effective, now, count);
                // Accepted or not, the refill/rollover bookkeeping persists.
                (Some(result.state()), result)
            })
            .await?;

        if result.accepted() {
            let retry_after = if options.reserve && result.value < 0.0 {
                Some(deficit_delay(&resolved, &result, now))
            } else {
                None
            };
            Ok(RateLimitStatus {
                ok: true,
                retry_after,
            })
        } else {
            debug!(
                name = name,
                key = ?key,
                shard = shard,
                retry_after = result.retry_after,
                "Rate limit exceeded"
            );
            if options.throw_on_reject {
                Err(FloodgateError::RateLimited {
                    name: name.to_string(),
                    key: key.map(str::to_string),
                    retry_after_ms: result.retry_after.unwrap_or_default(),
                })
            } else {
                Ok(RateLimitStatus {
                    ok: false,
                    retry_after: result.retry_after,
                })
            }
        }
    }

    /// Consume against a limiter registered in the named-limiter registry.
    pub async fn consume_named(
        &self,
        name: &str,
        key: Option<&str>,
        options: ConsumeOptions,
    ) -> Result<RateLimitStatus> {
        let config = self.named_config(name)?;
        self.consume(name, key, &config, options).await
    }

    /// Read-only availability probe: runs the rate math but never writes.
    pub async fn check(
        &self,
        name: &str,
        key: Option<&str>,
        config: &RateLimitConfig,
        count: f64,
    ) -> Result<RateLimitStatus> {
        self.check_at(name, key, config, count, now_ms()).await
    }

    /// [`check`](Self::check) at an explicit timestamp.
    pub async fn check_at(
        &self,
        name: &str,
        key: Option<&str>,
        config: &RateLimitConfig,
        count: f64,
        now: Timestamp,
    ) -> Result<RateLimitStatus> {
        let resolved = config.resolve()?;
        validate_count(count)?;

        let shard = pick_shard(resolved.shards);
        let existing = self.store.read(name, key, shard).await?;
        let result = math::compute(
            existing.as_ref(),
            &resolved.without_reservation(),
            now,
            count,
        );

        Ok(RateLimitStatus {
            ok: result.accepted(),
            retry_after: result.retry_after,
        })
    }

    /// Check against a limiter registered in the named-limiter registry.
    pub async fn check_named(
        &self,
        name: &str,
        key: Option<&str>,
        count: f64,
    ) -> Result<RateLimitStatus> {
        let config = self.named_config(name)?;
        self.check(name, key, &config, count).await
    }

    /// Sample shards and return an optimistic snapshot for client-side
    /// estimation.
    ///
    /// Samples `sample_shards` distinct shard indices uniformly without
    /// replacement, projects every sample to the same reference timestamp
    /// (the max `ts` among them), and returns the shard with the highest
    /// projected value. Picking the least-constrained observed shard
    /// deliberately overestimates availability; for a UI hint a false
    /// "available" is preferable to a false "unavailable" caused by sampling
    /// one hot shard.
    pub async fn peek(
        &self,
        name: &str,
        key: Option<&str>,
        config: &RateLimitConfig,
        sample_shards: u32,
    ) -> Result<Snapshot> {
        self.peek_at(name, key, config, sample_shards, now_ms())
            .await
    }

    /// [`peek`](Self::peek) at an explicit timestamp.
    pub async fn peek_at(
        &self,
        name: &str,
        key: Option<&str>,
        config: &RateLimitConfig,
        sample_shards: u32,
        now: Timestamp,
    ) -> Result<Snapshot> {
        let resolved = config.resolve()?;

        let amount = sample_shards.clamp(1, resolved.shards) as usize;
        let sampled: Vec<u32> =
            index::sample(&mut rand::thread_rng(), resolved.shards as usize, amount)
                .iter()
                .map(|i| i as u32)
                .collect();

        let states = self.store.read_many(name, key, &sampled).await?;

        // Absent shards are full; they carry no timestamp, so the reference
        // instant is the newest observed one, falling back to `now`.
        let t_ref = states
            .iter()
            .flatten()
            .map(|state| state.ts)
            .max()
            .unwrap_or(now);

        let mut best_shard = sampled[0];
        let mut best = math::compute(states[0].as_ref(), &resolved, t_ref, 0.0);
        for (shard, state) in sampled.iter().zip(states.iter()).skip(1) {
            let projected = math::compute(state.as_ref(), &resolved, t_ref, 0.0);
            if projected.value > best.value {
                best = projected;
                best_shard = *shard;
            }
        }

        trace!(
            name = name,
            key = ?key,
            shard = best_shard,
            value = best.value,
            sampled = amount,
            "Peeked rate limit state"
        );

        let mut config_out = resolved;
        if config_out.kind == LimiterKind::FixedWindow && config_out.start_ms.is_none() {
            config_out.start_ms = best.window_start;
        }

        Ok(Snapshot {
            value: best.value,
            ts: best.ts,
            shard: best_shard,
            config: config_out,
        })
    }

    /// Delete all shard rows for one limiter identity.
    pub async fn reset(&self, name: &str, key: Option<&str>) -> Result<()> {
        debug!(name = name, key = ?key, "Resetting rate limit state");
        self.store.delete_all(name, key).await
    }

    /// Sweep shard rows whose last write is older than `before` (default:
    /// now), in bounded batches until exhausted. Returns the number of rows
    /// deleted.
    pub async fn clear_all(&self, before: Option<Timestamp>) -> Result<u64> {
        let cutoff = before.unwrap_or_else(now_ms);
        let mut total = 0u64;
        loop {
            let sweep = self
                .store
                .delete_older_than(cutoff, SWEEP_BATCH_SIZE)
                .await?;
            total += sweep.deleted;
            if !sweep.more {
                break;
            }
            // Long sweeps reschedule between batches instead of holding the
            // executor.
            tokio::task::yield_now().await;
        }
        debug!(cutoff = cutoff, deleted = total, "Cleared stale shard rows");
        Ok(total)
    }
}

/// Uniform random shard pick; hot keys spread their writes across shards.
fn pick_shard(shards: u32) -> u32 {
    if shards == 1 {
        0
    } else {
        rand::thread_rng().gen_range(0..shards)
    }
}

fn validate_count(count: f64) -> Result<()> {
    if !count.is_finite() || count < 0.0 {
        return Err(FloodgateError::Config(format!(
            "count must be a non-negative finite number, got {count}"
        )));
    }
    Ok(())
}

/// Delay until an accepted reservation's deficit clears.
fn deficit_delay(config: &ResolvedConfig, result: &RateMathResult, now: Timestamp) -> Milliseconds {
    match config.kind {
        LimiterKind::TokenBucket => -result.value * config.period_ms / config.rate_per_shard(),
        // A fixed window forgives the whole deficit at the next boundary.
        LimiterKind::FixedWindow => {
            let window_start = result.window_start.unwrap_or(result.ts);
            window_start as Milliseconds + config.period_ms - now as Milliseconds
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ShardState};

    const NOW: Timestamp = 1_700_000_000_000;

    fn bucket_config() -> RateLimitConfig {
        RateLimitConfig::TokenBucket {
            rate: 10.0,
            period_ms: 60_000.0,
            capacity: None,
            max_reserved: None,
            shards: None,
        }
    }

    fn window_config() -> RateLimitConfig {
        RateLimitConfig::FixedWindow {
            rate: 10.0,
            period_ms: 60_000.0,
            capacity: None,
            max_reserved: None,
            shards: None,
            start_ms: None,
        }
    }

    fn limiter() -> RateLimiter<MemoryStore> {
        RateLimiter::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_consume_then_peek_reflects_decrement() {
        let limiter = limiter();
        let config = bucket_config();

        let status = limiter
            .consume_at(
                "sendMessage",
                None,
                &config,
                ConsumeOptions {
                    count: 4.0,
                    ..Default::default()
                },
                NOW,
            )
            .await
            .unwrap();
        assert!(status.ok);
        assert_eq!(status.retry_after, None);

        // Same instant: no phantom refill between consume and peek.
        let snapshot = limiter
            .peek_at("sendMessage", None, &config, 1, NOW)
            .await
            .unwrap();
        assert_eq!(snapshot.value, 6.0);
        assert_eq!(snapshot.ts, NOW);
        assert_eq!(snapshot.shard, 0);
    }

    #[tokio::test]
    async fn test_rejected_consume_persists_refill_only() {
        let limiter = limiter();
        let config = bucket_config();

        limiter
            .store()
            .write(
                "sendMessage",
                None,
                0,
                ShardState {
                    value: 5.0,
                    ts: NOW - 30_000,
                },
            )
            .await
            .unwrap();

        let status = limiter
            .consume_at(
                "sendMessage",
                None,
                &config,
                ConsumeOptions {
                    count: 15.0,
                    ..Default::default()
                },
                NOW,
            )
            .await
            .unwrap();
        assert!(!status.ok);
        assert_eq!(status.retry_after, Some(30_000.0));

        // Refill was applied and persisted; the rejected delta was not.
        let row = limiter
            .store()
            .read("sendMessage", None, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.value, 10.0);
        assert_eq!(row.ts, NOW);
    }

    #[tokio::test]
    async fn test_fixed_window_rejection_reports_time_left() {
        let limiter = limiter();
        let config = window_config();

        limiter
            .store()
            .write(
                "sendEmail",
                Some("user-1"),
                0,
                ShardState {
                    value: 5.0,
                    ts: NOW - 30_000,
                },
            )
            .await
            .unwrap();

        let status = limiter
            .consume_at(
                "sendEmail",
                Some("user-1"),
                &config,
                ConsumeOptions {
                    count: 8.0,
                    ..Default::default()
                },
                NOW,
            )
            .await
            .unwrap();
        assert!(!status.ok);
        assert_eq!(status.retry_after, Some(30_000.0));

        let row = limiter
            .store()
            .read("sendEmail", Some("user-1"), 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.value, 5.0);
        assert_eq!(row.ts, NOW - 30_000);
    }

    #[tokio::test]
    async fn test_reservation_goes_negative_and_reports_deficit_delay() {
        let limiter = limiter();
        let config = RateLimitConfig::TokenBucket {
            rate: 10.0,
            period_ms: 60_000.0,
            capacity: None,
            max_reserved: Some(10.0),
            shards: None,
        };

        let status = limiter
            .consume_at(
                "startWorkflow",
                None,
                &config,
                ConsumeOptions {
                    count: 15.0,
                    reserve: true,
                    ..Default::default()
                },
                NOW,
            )
            .await
            .unwrap();
        assert!(status.ok);
        // Deficit of 5 at 1 token per 6s clears in 30s.
        assert_eq!(status.retry_after, Some(30_000.0));

        let row = limiter
            .store()
            .read("startWorkflow", None, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.value, -5.0);
    }

    #[tokio::test]
    async fn test_reservation_beyond_budget_is_rejected() {
        let limiter = limiter();
        let config = RateLimitConfig::TokenBucket {
            rate: 10.0,
            period_ms: 60_000.0,
            capacity: None,
            max_reserved: Some(2.0),
            shards: None,
        };

        let status = limiter
            .consume_at(
                "startWorkflow",
                None,
                &config,
                ConsumeOptions {
                    count: 20.0,
                    reserve: true,
                    ..Default::default()
                },
                NOW,
            )
            .await
            .unwrap();
        assert!(!status.ok);
        assert_eq!(status.retry_after, Some(60_000.0));
    }

    #[tokio::test]
    async fn test_throw_on_reject_surfaces_error() {
        let limiter = limiter();
        let config = bucket_config();

        let err = limiter
            .consume_at(
                "sendMessage",
                Some("user-1"),
                &config,
                ConsumeOptions {
                    count: 25.0,
                    throw_on_reject: true,
                    ..Default::default()
                },
                NOW,
            )
            .await
            .unwrap_err();

        match err {
            FloodgateError::RateLimited {
                ref name,
                ref key,
                retry_after_ms,
            } => {
                assert_eq!(name, "sendMessage");
                assert_eq!(key.as_deref(), Some("user-1"));
                assert_eq!(retry_after_ms, 90_000.0);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_never_writes() {
        let limiter = limiter();
        let config = bucket_config();

        let first = limiter
            .check_at("sendMessage", None, &config, 1.0, NOW)
            .await
            .unwrap();
        let second = limiter
            .check_at("sendMessage", None, &config, 1.0, NOW)
            .await
            .unwrap();

        assert!(first.ok);
        assert_eq!(first, second);
        assert_eq!(limiter.store().row_count(), 0);
    }

    #[tokio::test]
    async fn test_check_reports_rejection_without_mutation() {
        let limiter = limiter();
        let config = bucket_config();

        limiter
            .store()
            .write("sendMessage", None, 0, ShardState { value: 2.0, ts: NOW })
            .await
            .unwrap();

        let status = limiter
            .check_at("sendMessage", None, &config, 5.0, NOW)
            .await
            .unwrap();
        assert!(!status.ok);
        assert_eq!(status.retry_after, Some(18_000.0));

        let row = limiter
            .store()
            .read("sendMessage", None, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.value, 2.0);
        assert_eq!(row.ts, NOW);
    }

    #[tokio::test]
    async fn test_zero_count_probe_is_accepted() {
        let limiter = limiter();
        let status = limiter
            .consume_at(
                "sendMessage",
                None,
                &bucket_config(),
                ConsumeOptions {
                    count: 0.0,
                    ..Default::default()
                },
                NOW,
            )
            .await
            .unwrap();
        assert!(status.ok);
    }

    #[tokio::test]
    async fn test_negative_count_rejected_before_storage() {
        let limiter = limiter();
        let err = limiter
            .consume_at(
                "sendMessage",
                None,
                &bucket_config(),
                ConsumeOptions {
                    count: -1.0,
                    ..Default::default()
                },
                NOW,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
        assert_eq!(limiter.store().row_count(), 0);
    }

    #[tokio::test]
    async fn test_sharded_consume_touches_one_shard() {
        let limiter = limiter();
        let config = RateLimitConfig::TokenBucket {
            rate: 10.0,
            period_ms: 60_000.0,
            capacity: None,
            max_reserved: None,
            shards: Some(5),
        };

        let status = limiter
            .consume_at("sendMessage", None, &config, ConsumeOptions::default(), NOW)
            .await
            .unwrap();
        assert!(status.ok);
        assert_eq!(limiter.store().row_count(), 1);
    }

    #[tokio::test]
    async fn test_peek_sampling_stays_in_range_and_picks_best() {
        let limiter = limiter();
        let config = RateLimitConfig::TokenBucket {
            rate: 10.0,
            period_ms: 60_000.0,
            capacity: Some(50.0),
            max_reserved: None,
            shards: Some(5),
        };

        // Distinct values per shard; shard 3 is the least constrained.
        for shard in 0..5u32 {
            let value = if shard == 3 { 9.0 } else { shard as f64 };
            limiter
                .store()
                .write("sendMessage", None, shard, ShardState { value, ts: NOW })
                .await
                .unwrap();
        }

        for _ in 0..50 {
            let snapshot = limiter
                .peek_at("sendMessage", None, &config, 3, NOW)
                .await
                .unwrap();
            assert!(snapshot.shard < 5);
        }

        // Sampling every shard always lands on the maximum.
        let snapshot = limiter
            .peek_at("sendMessage", None, &config, 5, NOW)
            .await
            .unwrap();
        assert_eq!(snapshot.shard, 3);
        assert_eq!(snapshot.value, 9.0);
    }

    #[tokio::test]
    async fn test_peek_backfills_fixed_window_start() {
        let limiter = limiter();
        let window_start = NOW - 20_000;

        limiter
            .store()
            .write(
                "sendEmail",
                None,
                0,
                ShardState {
                    value: 4.0,
                    ts: window_start,
                },
            )
            .await
            .unwrap();

        let snapshot = limiter
            .peek_at("sendEmail", None, &window_config(), 1, NOW)
            .await
            .unwrap();
        assert_eq!(snapshot.config.start_ms, Some(window_start));
        assert_eq!(snapshot.value, 4.0);
        assert_eq!(snapshot.ts, window_start);
    }

    #[tokio::test]
    async fn test_peek_assumes_full_capacity_for_absent_shards() {
        let limiter = limiter();
        let snapshot = limiter
            .peek_at("sendMessage", None, &bucket_config(), 1, NOW)
            .await
            .unwrap();
        assert_eq!(snapshot.value, 10.0);
        assert_eq!(snapshot.ts, NOW);
    }

    #[tokio::test]
    async fn test_reset_deletes_identity() {
        let limiter = limiter();
        let config = bucket_config();

        limiter
            .consume_at(
                "sendMessage",
                Some("user-1"),
                &config,
                ConsumeOptions::default(),
                NOW,
            )
            .await
            .unwrap();
        limiter
            .consume_at(
                "sendMessage",
                Some("user-2"),
                &config,
                ConsumeOptions::default(),
                NOW,
            )
            .await
            .unwrap();
        assert_eq!(limiter.store().row_count(), 2);

        limiter.reset("sendMessage", Some("user-1")).await.unwrap();
        assert_eq!(limiter.store().row_count(), 1);
        assert!(limiter
            .store()
            .read("sendMessage", Some("user-1"), 0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_clear_all_sweeps_in_batches() {
        let limiter = limiter();
        for shard in 0..250u32 {
            limiter
                .store()
                .write("bulk", None, shard, ShardState { value: 1.0, ts: 0 })
                .await
                .unwrap();
        }

        let deleted = limiter.clear_all(Some(now_ms() + 1)).await.unwrap();
        assert_eq!(deleted, 250);
        assert_eq!(limiter.store().row_count(), 0);
    }

    #[tokio::test]
    async fn test_named_registry_lookup() {
        let mut limits = LimitsConfig::default();
        limits
            .limits
            .insert("sendMessage".to_string(), bucket_config());
        let limiter = RateLimiter::with_limits(MemoryStore::new(), limits);

        let status = limiter
            .consume_named("sendMessage", Some("user-1"), ConsumeOptions::default())
            .await
            .unwrap();
        assert!(status.ok);

        let err = limiter
            .consume_named("unknown", None, ConsumeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
    }

    #[tokio::test]
    async fn test_server_time_is_current() {
        let limiter = limiter();
        let before = now_ms();
        let reported = limiter.server_time();
        let after = now_ms();
        assert!(reported >= before && reported <= after);
    }
}
