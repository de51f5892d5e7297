//! Shared key-value store the coordination layer runs on.
//!
//! Every operation touches a single key and is atomic on its own; nothing here needs a
//! multi-key transaction.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::StoreResult;
use crate::types::ThreadId;
use async_trait::async_trait;

/// Result of an increment that refuses to pass a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedIncr {
    /// Counter was below the limit and now holds this value.
    Incremented(i64),
    /// Counter already held this value (>= limit) and was left untouched.
    AtLimit(i64),
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` unless its value is already `>= limit`. Missing keys count as 0.
    async fn incr_below(&self, key: &str, limit: i64) -> StoreResult<BoundedIncr>;

    /// Decrement `key`; the key is deleted when the result is `<= 0`. Returns the
    /// decremented value (negative when releasing a counter that was never taken).
    async fn decr_delete_at_zero(&self, key: &str) -> StoreResult<i64>;

    /// Current counter value, 0 when absent.
    async fn counter(&self, key: &str) -> StoreResult<i64>;

    /// Adds `member` and reads the set's cardinality in one atomic step. Returns whether
    /// the member was new and the cardinality after the add.
    async fn set_add_card(&self, key: &str, member: &str) -> StoreResult<(bool, u64)>;

    /// Returns true when the member was present.
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn set_card(&self, key: &str) -> StoreResult<u64>;

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Returns true when the field existed.
    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Key naming for everything the relay keeps in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim().trim_end_matches(':').to_string();
        Self { prefix }
    }

    /// Queued-or-in-flight depth for one thread.
    pub fn thread_depth(&self, thread_id: &ThreadId) -> String {
        format!("{}:depth:{}", self.prefix, thread_id)
    }

    /// Set of chat ids with outstanding work.
    pub fn active_chats(&self) -> String {
        format!("{}:active_chats", self.prefix)
    }

    /// Hash of chat id -> thread id.
    pub fn chat_threads(&self) -> String {
        format!("{}:chat_threads", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("threadrelay")
    }
}
