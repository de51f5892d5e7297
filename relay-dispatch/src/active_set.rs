use crate::error::StoreResult;
use crate::store::{CounterStore, KeySpace};
use relay_channels::ChatId;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// The chat was not in the set before this call.
    pub newly_active: bool,
    pub cardinality: u64,
}

/// Owner of the global set of chats with outstanding work.
#[derive(Clone)]
pub struct ActiveSetTracker {
    store: Arc<dyn CounterStore>,
    key: String,
    congestion_threshold: u64,
}

impl ActiveSetTracker {
    pub fn new(store: Arc<dyn CounterStore>, keys: &KeySpace, congestion_threshold: u64) -> Self {
        Self {
            store,
            key: keys.active_chats(),
            congestion_threshold: congestion_threshold.max(1),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(chat_id = %chat_id))]
    pub async fn mark_active(&self, chat_id: &ChatId) -> StoreResult<Activation> {
        let (newly_active, cardinality) =
            self.store.set_add_card(&self.key, chat_id.as_str()).await?;
        Ok(Activation {
            newly_active,
            cardinality,
        })
    }

    /// Whether the request that produced `activation` should get a congestion notice.
    ///
    /// Only the request that brought its chat into a crowded set is told; follow-up
    /// messages from a chat already in the set are not.
    pub fn should_warn(&self, activation: &Activation) -> bool {
        activation.newly_active && activation.cardinality >= self.congestion_threshold
    }

    /// Removes the chat. Callers invoke this once the chat has no units left in this process.
    #[tracing::instrument(level = "debug", skip_all, fields(chat_id = %chat_id))]
    pub async fn clear_if_drained(&self, chat_id: &ChatId) -> StoreResult<bool> {
        let removed = self.store.set_remove(&self.key, chat_id.as_str()).await?;
        tracing::debug!(removed, "chat left the active set");
        Ok(removed)
    }

    pub async fn cardinality(&self) -> StoreResult<u64> {
        self.store.set_card(&self.key).await
    }
}
