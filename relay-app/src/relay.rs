//! Request processor that turns one admitted message into a completion and relays it back.

use anyhow::Context;
use async_trait::async_trait;
use relay_channels::{ChannelAdapter, OutboundMessage, chunk_text};
use relay_dispatch::{Job, RequestProcessor, ThreadId, ThreadResolver};
use relay_llm::{CompletionRequest, CompletionService};
use std::sync::Arc;

pub struct CompletionRelay {
    completions: Arc<dyn CompletionService>,
    channel: Arc<dyn ChannelAdapter>,
    resolver: ThreadResolver,
    system_prompt: String,
    chunk_chars: usize,
}

impl CompletionRelay {
    pub fn new(
        completions: Arc<dyn CompletionService>,
        channel: Arc<dyn ChannelAdapter>,
        resolver: ThreadResolver,
        system_prompt: impl Into<String>,
        chunk_chars: usize,
    ) -> Self {
        Self {
            completions,
            channel,
            resolver,
            system_prompt: system_prompt.into(),
            chunk_chars: chunk_chars.max(1),
        }
    }
}

#[async_trait]
impl RequestProcessor for CompletionRelay {
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(unit_id = %job.unit_id, chat_id = %job.chat_id, message_id = %job.message_id)
    )]
    async fn process(&self, job: Job) -> anyhow::Result<()> {
        if let Err(e) = self.channel.send_typing(job.chat_id.as_str()).await {
            tracing::debug!(%e, "typing indicator not sent");
        }

        // A unit queued behind the chat's first message runs after that message created
        // the thread, so look again.
        let thread_id = match job.thread_id {
            Some(thread_id) => Some(thread_id),
            None => self.resolver.resolve(&job.chat_id).await,
        };

        let request = CompletionRequest::new(
            job.text.as_str(),
            thread_id.as_ref().map(|t| t.as_str().to_string()),
            self.system_prompt.as_str(),
        );
        let completion = self
            .completions
            .complete(&request)
            .await
            .context("completion request failed")?;

        let assigned = ThreadId::new(completion.thread_id.as_str());
        if thread_id.as_ref() != Some(&assigned) {
            match self.resolver.remember(&job.chat_id, &assigned).await {
                Ok(()) => tracing::info!(thread_id = %assigned, "conversation thread assigned"),
                Err(e) => tracing::warn!(%e, thread_id = %assigned, "failed to record thread for chat"),
            }
        }

        let chunks = chunk_text(&completion.text, self.chunk_chars);
        if chunks.is_empty() {
            tracing::warn!("completion returned no text; nothing relayed");
            return Ok(());
        }
        let total = chunks.len();
        let mut failed = 0usize;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let message = if index == 0 {
                OutboundMessage::reply(chunk, job.message_id.clone())
            } else {
                OutboundMessage::text(chunk)
            };
            if let Err(e) = self.channel.send(job.chat_id.as_str(), message).await {
                failed += 1;
                tracing::warn!(%e, chunk = index + 1, total, "failed to relay reply chunk");
            }
        }
        tracing::debug!(
            chunks = total,
            failed,
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            "reply relayed"
        );
        Ok(())
    }
}
