use crate::error::StoreResult;
use crate::store::{CounterStore, KeySpace};
use crate::types::ThreadId;
use relay_channels::ChatId;
use std::sync::Arc;

/// Maps a chat to the completion-service thread its conversation lives in.
#[derive(Clone)]
pub struct ThreadResolver {
    store: Arc<dyn CounterStore>,
    key: String,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn CounterStore>, keys: &KeySpace) -> Self {
        Self {
            store,
            key: keys.chat_threads(),
        }
    }

    /// Thread for `chat_id`, or `None` for a new conversation.
    ///
    /// Store failures resolve to `None`: a new conversation is always better than no reply.
    #[tracing::instrument(level = "debug", skip_all, fields(chat_id = %chat_id))]
    pub async fn resolve(&self, chat_id: &ChatId) -> Option<ThreadId> {
        match self.store.hash_get(&self.key, chat_id.as_str()).await {
            Ok(value) => value.filter(|v| !v.trim().is_empty()).map(ThreadId::new),
            Err(e) => {
                tracing::warn!(%e, "thread lookup failed; treating as new conversation");
                None
            }
        }
    }

    pub async fn remember(&self, chat_id: &ChatId, thread_id: &ThreadId) -> StoreResult<()> {
        self.store
            .hash_set(&self.key, chat_id.as_str(), thread_id.as_str())
            .await?;
        tracing::debug!(chat_id = %chat_id, thread_id = %thread_id, "thread recorded for chat");
        Ok(())
    }

    /// Drops the chat's thread so its next message opens a new conversation.
    pub async fn forget(&self, chat_id: &ChatId) -> StoreResult<bool> {
        self.store.hash_delete(&self.key, chat_id.as_str()).await
    }
}
