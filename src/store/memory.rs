//! In-process shard store backed by a concurrent hash map.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::Result;
use crate::time::{now_ms, Timestamp};

use super::{ShardState, ShardStore, SweepOutcome};

/// Full identity of one shard row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    name: String,
    key: Option<String>,
    shard: u32,
}

impl RowKey {
    fn new(name: &str, key: Option<&str>, shard: u32) -> Self {
        Self {
            name: name.to_string(),
            key: key.map(str::to_string),
            shard,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Row {
    state: ShardState,
    /// Last-write instant, the sweep index for [`ShardStore::delete_older_than`].
    updated_at: Timestamp,
}

/// An in-process [`ShardStore`] adapter.
///
/// Rows live in a sharded concurrent map; `update` runs its closure under the
/// row's entry lock, which is the per-shard serialization point the engine
/// requires. Suitable for single-process deployments and as the reference
/// adapter in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: DashMap<RowKey, Row>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shard rows currently materialized.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[async_trait]
impl ShardStore for MemoryStore {
    async fn read(&self, name: &str, key: Option<&str>, shard: u32) -> Result<Option<ShardState>> {
        Ok(self
            .rows
            .get(&RowKey::new(name, key, shard))
            .map(|row| row.state))
    }

    async fn write(
        &self,
        name: &str,
        key: Option<&str>,
        shard: u32,
        state: ShardState,
    ) -> Result<()> {
        self.rows.insert(
            RowKey::new(name, key, shard),
            Row {
                state,
                updated_at: now_ms(),
            },
        );
        Ok(())
    }

    async fn update<T, F>(&self, name: &str, key: Option<&str>, shard: u32, apply: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(Option<ShardState>) -> (Option<ShardState>, T) + Send,
    {
        // The entry guard holds the map's bucket lock for the full
        // read-modify-write, so concurrent updates to one shard serialize.
        match self.rows.entry(RowKey::new(name, key, shard)) {
            Entry::Occupied(mut occupied) => {
                let (next, out) = apply(Some(occupied.get().state));
                if let Some(state) = next {
                    *occupied.get_mut() = Row {
                        state,
                        updated_at: now_ms(),
                    };
                }
                Ok(out)
            }
            Entry::Vacant(vacant) => {
                let (next, out) = apply(None);
                if let Some(state) = next {
                    vacant.insert(Row {
                        state,
                        updated_at: now_ms(),
                    });
                }
                Ok(out)
            }
        }
    }

    async fn delete_all(&self, name: &str, key: Option<&str>) -> Result<()> {
        self.rows
            .retain(|row_key, _| !(row_key.name == name && row_key.key.as_deref() == key));
        Ok(())
    }

    async fn delete_older_than(&self, cutoff_ts: Timestamp, limit: usize) -> Result<SweepOutcome> {
        let stale: Vec<RowKey> = self
            .rows
            .iter()
            .filter(|row| row.value().updated_at < cutoff_ts)
            .take(limit)
            .map(|row| row.key().clone())
            .collect();

        let mut deleted = 0u64;
        for row_key in stale {
            if self.rows.remove(&row_key).is_some() {
                deleted += 1;
            }
        }

        let more = self
            .rows
            .iter()
            .any(|row| row.value().updated_at < cutoff_ts);

        Ok(SweepOutcome { deleted, more })
    }
}
