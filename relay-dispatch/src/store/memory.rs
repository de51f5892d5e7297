use super::{BoundedIncr, CounterStore};
use crate::error::StoreResult;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{HashMap, HashSet};

/// Process-local store for single-instance deployments and tests.
///
/// Each operation holds the key's shard lock for its whole read-modify-write, which gives
/// the same per-key atomicity the Redis scripts provide.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, i64>,
    sets: DashMap<String, HashSet<String>>,
    hashes: DashMap<String, HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the counter key exists at all.
    pub fn has_counter(&self, key: &str) -> bool {
        self.counters.contains_key(key)
    }

    /// Number of live counter keys.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_below(&self, key: &str, limit: i64) -> StoreResult<BoundedIncr> {
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if current >= limit {
                    return Ok(BoundedIncr::AtLimit(current));
                }
                *entry.get_mut() = current + 1;
                Ok(BoundedIncr::Incremented(current + 1))
            }
            Entry::Vacant(entry) => {
                if limit <= 0 {
                    return Ok(BoundedIncr::AtLimit(0));
                }
                entry.insert(1);
                Ok(BoundedIncr::Incremented(1))
            }
        }
    }

    async fn decr_delete_at_zero(&self, key: &str) -> StoreResult<i64> {
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let next = *entry.get() - 1;
                if next <= 0 {
                    entry.remove();
                } else {
                    *entry.get_mut() = next;
                }
                Ok(next)
            }
            // DECR on a missing key yields -1, which is then deleted.
            Entry::Vacant(_) => Ok(-1),
        }
    }

    async fn counter(&self, key: &str) -> StoreResult<i64> {
        Ok(self.counters.get(key).map(|v| *v).unwrap_or(0))
    }

    async fn set_add_card(&self, key: &str, member: &str) -> StoreResult<(bool, u64)> {
        let mut set = self.sets.entry(key.to_string()).or_default();
        let added = set.insert(member.to_string());
        Ok((added, set.len() as u64))
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        match self.sets.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(member);
                if entry.get().is_empty() {
                    entry.remove();
                }
                Ok(removed)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn set_card(&self, key: &str) -> StoreResult<u64> {
        Ok(self.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        match self.hashes.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(field).is_some();
                if entry.get().is_empty() {
                    entry.remove();
                }
                Ok(removed)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
