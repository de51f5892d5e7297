//! Store doubles for failure and timing scenarios.

use crate::error::{StoreError, StoreResult};
use crate::store::{BoundedIncr, CounterStore, MemoryStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub(crate) struct FlakyStore {
    pub(crate) inner: MemoryStore,
    counters_down: AtomicBool,
    sets_down: AtomicBool,
    hashes_down: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_counters(&self, down: bool) {
        self.counters_down.store(down, Ordering::SeqCst);
    }

    pub(crate) fn fail_sets(&self, down: bool) {
        self.sets_down.store(down, Ordering::SeqCst);
    }

    pub(crate) fn fail_hashes(&self, down: bool) {
        self.hashes_down.store(down, Ordering::SeqCst);
    }

    pub(crate) fn fail_all(&self) {
        self.fail_counters(true);
        self.fail_sets(true);
        self.fail_hashes(true);
    }

    fn check(flag: &AtomicBool) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn incr_below(&self, key: &str, limit: i64) -> StoreResult<BoundedIncr> {
        Self::check(&self.counters_down)?;
        self.inner.incr_below(key, limit).await
    }

    async fn decr_delete_at_zero(&self, key: &str) -> StoreResult<i64> {
        Self::check(&self.counters_down)?;
        self.inner.decr_delete_at_zero(key).await
    }

    async fn counter(&self, key: &str) -> StoreResult<i64> {
        Self::check(&self.counters_down)?;
        self.inner.counter(key).await
    }

    async fn set_add_card(&self, key: &str, member: &str) -> StoreResult<(bool, u64)> {
        Self::check(&self.sets_down)?;
        self.inner.set_add_card(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        Self::check(&self.sets_down)?;
        self.inner.set_remove(key, member).await
    }

    async fn set_card(&self, key: &str) -> StoreResult<u64> {
        Self::check(&self.sets_down)?;
        self.inner.set_card(key).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Self::check(&self.hashes_down)?;
        self.inner.hash_get(key, field).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        Self::check(&self.hashes_down)?;
        self.inner.hash_set(key, field, value).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        Self::check(&self.hashes_down)?;
        self.inner.hash_delete(key, field).await
    }

    async fn ping(&self) -> StoreResult<()> {
        Self::check(&self.counters_down)?;
        self.inner.ping().await
    }
}

/// Memory store whose first counter release stalls for `delay`.
pub(crate) struct SlowFirstRelease {
    pub(crate) inner: MemoryStore,
    delay: Duration,
    releases: AtomicUsize,
}

impl SlowFirstRelease {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            releases: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CounterStore for SlowFirstRelease {
    async fn incr_below(&self, key: &str, limit: i64) -> StoreResult<BoundedIncr> {
        self.inner.incr_below(key, limit).await
    }

    async fn decr_delete_at_zero(&self, key: &str) -> StoreResult<i64> {
        if self.releases.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.decr_delete_at_zero(key).await
    }

    async fn counter(&self, key: &str) -> StoreResult<i64> {
        self.inner.counter(key).await
    }

    async fn set_add_card(&self, key: &str, member: &str) -> StoreResult<(bool, u64)> {
        self.inner.set_add_card(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.set_remove(key, member).await
    }

    async fn set_card(&self, key: &str) -> StoreResult<u64> {
        self.inner.set_card(key).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.inner.hash_get(key, field).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.inner.hash_set(key, field, value).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.inner.hash_delete(key, field).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }
}
