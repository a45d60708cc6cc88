//! Storage contract for shard records.
//!
//! The engine is storage-agnostic: it operates on a keyed table of shard
//! rows, `(name, key, shard) -> {value, ts}`, through the [`ShardStore`]
//! trait. One conforming adapter ships with the crate ([`MemoryStore`]);
//! adapters for durable stores implement the same contract on top of their
//! native single-row atomicity primitive.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::time::Timestamp;

pub use memory::MemoryStore;

/// Persisted state of a single shard of a named limiter.
///
/// `ts` carries a different meaning per algorithm: the last-update instant
/// for token buckets, the window start for fixed windows. An absent row is
/// equivalent to a fresh shard at full per-shard capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShardState {
    /// Current unit count for this shard. May be negative up to the
    /// per-shard reservation budget.
    pub value: f64,
    /// Last-update instant (token bucket) or window start (fixed window).
    pub ts: Timestamp,
}

/// Outcome of one batch of a staleness sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Rows deleted by this batch.
    pub deleted: u64,
    /// Whether rows older than the cutoff remain. The caller loops or
    /// reschedules until this is false.
    pub more: bool,
}

/// Storage adapter for shard rows.
///
/// The single concurrency-sensitive obligation is that writes to one shard
/// are linearizable: two concurrent read-modify-write cycles on the same
/// `(name, key, shard)` must not lose an update. [`ShardStore::update`] is
/// that cycle made explicit; adapters whose `read`/`write` pairs already run
/// inside one transaction may keep the default implementation, anything else
/// overrides it with a native atomic primitive (entry lock, compare-and-swap,
/// single-row transaction). Across different shards there is no ordering
/// guarantee.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Read one shard row. `Ok(None)` means the shard has never been written.
    async fn read(&self, name: &str, key: Option<&str>, shard: u32) -> Result<Option<ShardState>>;

    /// Read several shard rows, preserving the order of `shards` in the
    /// returned vector.
    async fn read_many(
        &self,
        name: &str,
        key: Option<&str>,
        shards: &[u32],
    ) -> Result<Vec<Option<ShardState>>> {
        let mut out = Vec::with_capacity(shards.len());
        for &shard in shards {
            out.push(self.read(name, key, shard).await?);
        }
        Ok(out)
    }

    /// Upsert one shard row.
    async fn write(
        &self,
        name: &str,
        key: Option<&str>,
        shard: u32,
        state: ShardState,
    ) -> Result<()>;

    /// Atomically read, transform, and conditionally write one shard row.
    ///
    /// `apply` receives the current row (or `None`) and returns the row to
    /// write plus an arbitrary output handed back to the caller. Returning
    /// `None` leaves the row untouched.
    async fn update<T, F>(&self, name: &str, key: Option<&str>, shard: u32, apply: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(Option<ShardState>) -> (Option<ShardState>, T) + Send,
    {
        let existing = self.read(name, key, shard).await?;
        let (next, out) = apply(existing);
        if let Some(state) = next {
            self.write(name, key, shard, state).await?;
        }
        Ok(out)
    }

    /// Delete every shard row belonging to one limiter identity.
    async fn delete_all(&self, name: &str, key: Option<&str>) -> Result<()>;

    /// Delete up to `limit` rows whose last write is older than `cutoff_ts`.
    ///
    /// Backed by a secondary index on the last-write timestamp so a sweep
    /// never scans live rows.
    async fn delete_older_than(&self, cutoff_ts: Timestamp, limit: usize) -> Result<SweepOutcome>;
}
