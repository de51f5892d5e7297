use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{Completion, CompletionRequest};
use async_trait::async_trait;

/// Anything that can answer one turn of a server-side conversation.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

#[derive(Clone)]
pub struct LlmClient {
    model: String,
    inner: OpenAiClient,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is empty".to_string()));
        }
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            model: model.to_string(),
            inner: OpenAiClient::new(http, api_key, model),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(model = %self.model, has_thread = request.thread_id.is_some())
    )]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        if request.prompt.trim().is_empty() {
            return Err(LlmError::InvalidInput("prompt is empty".to_string()));
        }
        let completion = self.inner.complete(request).await?;
        tracing::debug!(
            thread_id = %completion.thread_id,
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            "completion received"
        );
        Ok(completion)
    }
}
