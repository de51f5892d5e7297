use crate::error::{LlmError, Result};
use crate::types::{Completion, CompletionRequest, Usage};
use serde::{Deserialize, Serialize};

const OPENAI_CONVERSATIONS_URL: &str = "https://api.openai.com/v1/conversations";
const OPENAI_RESPONSES_URL: &str = "https://api.openai.com/v1/responses";

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let thread_id = match request.thread_id.as_deref() {
            Some(id) => id.to_string(),
            None => self.create_conversation().await?,
        };

        let req = OpenAiResponseRequest {
            model: self.model.clone(),
            instructions: Some(request.system_prompt.clone()).filter(|s| !s.trim().is_empty()),
            input: request.prompt.clone(),
            conversation: thread_id.clone(),
        };

        let response = self
            .http
            .post(OPENAI_RESPONSES_URL)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "openai responses status={status} body={body}"
            )));
        }

        let parsed: OpenAiResponse = serde_json::from_str(&body)?;
        completion_from_response(parsed, thread_id)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn create_conversation(&self) -> Result<String> {
        let response = self
            .http
            .post(OPENAI_CONVERSATIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "openai conversations status={status} body={body}"
            )));
        }

        let parsed: OpenAiConversation = serde_json::from_str(&body)?;
        if parsed.id.trim().is_empty() {
            return Err(LlmError::ResponseFormat(
                "openai conversation missing id".to_string(),
            ));
        }
        tracing::debug!(thread_id = %parsed.id, "conversation created");
        Ok(parsed.id)
    }
}

#[derive(Debug, Serialize)]
struct OpenAiResponseRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    input: String,
    conversation: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiConversation {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    output: Vec<OpenAiOutputItem>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<OpenAiResponseError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiOutputItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    content: Vec<OpenAiOutputContent>,
}

#[derive(Debug, Deserialize)]
struct OpenAiOutputContent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseError {
    #[serde(default)]
    message: String,
}

fn completion_from_response(v: OpenAiResponse, thread_id: String) -> Result<Completion> {
    if let Some(error) = v.error {
        return Err(LlmError::ResponseFormat(format!(
            "openai response error: {}",
            error.message
        )));
    }

    let text = v
        .output
        .iter()
        .filter(|item| item.kind == "message")
        .flat_map(|item| item.content.iter())
        .filter(|content| content.kind == "output_text")
        .filter_map(|content| content.text.as_deref())
        .collect::<Vec<_>>()
        .join("");

    if text.is_empty() {
        return Err(LlmError::ResponseFormat(
            "openai response has no output_text".to_string(),
        ));
    }

    let usage = v
        .usage
        .map(|u| Usage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
        })
        .unwrap_or_default();

    Ok(Completion {
        text,
        thread_id,
        usage,
    })
}
