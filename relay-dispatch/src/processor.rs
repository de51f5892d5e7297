use crate::types::ThreadId;
use async_trait::async_trait;
use relay_channels::{ChatId, MessageId};
use uuid::Uuid;

/// One admitted unit of work, as handed to the [`RequestProcessor`].
#[derive(Debug, Clone)]
pub struct Job {
    pub unit_id: Uuid,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
    /// Thread known when the unit was admitted. A unit queued behind a conversation's
    /// first message sees `None` here and should look the thread up again when it runs.
    pub thread_id: Option<ThreadId>,
}

/// Executes one unit of work. The dispatcher only looks at success or failure.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process(&self, job: Job) -> anyhow::Result<()>;
}
