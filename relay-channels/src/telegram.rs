use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

/// How updates reach the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelegramMode {
    /// Telegram POSTs each update to `/telegram/webhook`.
    #[default]
    Webhook,
    /// The adapter long-polls `getUpdates`.
    Poll,
}

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
    mode: TelegramMode,
    webhook_secret: Option<String>,
    inbound_tx: Arc<RwLock<Option<mpsc::Sender<InboundMessage>>>>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str, mode: TelegramMode) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("telegram bot token is empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            mode,
            webhook_secret: None,
            inbound_tx: Arc::new(RwLock::new(None)),
        })
    }

    /// Require Telegram's secret-token header on webhook deliveries.
    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn mode(&self) -> TelegramMode {
        self.mode
    }

    /// Router that accepts webhook deliveries at `/telegram/webhook`.
    pub fn webhook_router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/telegram/webhook", post(receive_webhook))
            .with_state(self)
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<()> {
        let url = self.api_url(method)?;
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} body={text}"
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.inbound_tx.write().await = Some(tx.clone());
        if self.mode == TelegramMode::Poll {
            let adapter = self.clone();
            tokio::spawn(async move {
                if let Err(e) = adapter.run_poll_loop(tx).await {
                    tracing::error!(%e, "telegram poll loop exited");
                }
            });
        }
        tracing::info!(mode = ?self.mode, "telegram adapter started");
        Ok(())
    }

    async fn send(&self, chat_id: &str, message: OutboundMessage) -> Result<()> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": message.content,
        });
        if let Some(reply_to) = message
            .reply_to_message_id
            .as_deref()
            .and_then(|id| id.parse::<i64>().ok())
        {
            body["reply_parameters"] = serde_json::json!({
                "message_id": reply_to,
                "allow_sending_without_reply": true,
            });
        }
        self.call("sendMessage", body).await
    }

    async fn send_typing(&self, chat_id: &str) -> Result<()> {
        self.call(
            "sendChatAction",
            serde_json::json!({ "chat_id": chat_id, "action": "typing" }),
        )
        .await
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn receive_webhook(
    State(adapter): State<Arc<TelegramAdapter>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    if let Some(expected) = adapter.webhook_secret.as_deref() {
        let provided = headers
            .get(TELEGRAM_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if provided != expected {
            tracing::warn!("telegram webhook rejected: secret token mismatch");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(error) => {
            // Acknowledge anyway; a non-2xx makes Telegram redeliver the same payload forever.
            tracing::warn!(%error, "telegram webhook payload parse failed; dropping update");
            return StatusCode::OK;
        }
    };

    let Some(inbound) = build_message_inbound(update.update_id, update.message.as_ref()) else {
        tracing::debug!(update_id = update.update_id, "telegram update carries no text message");
        return StatusCode::OK;
    };

    let tx = adapter.inbound_tx.read().await.clone();
    let Some(tx) = tx else {
        tracing::error!("telegram webhook received before adapter start");
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    if let Err(e) = tx.send(inbound).await {
        tracing::error!(%e, "telegram inbound queue closed");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramGetUpdatesResponse>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(%error, ?delay, "telegram getUpdates payload parse failed");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            consecutive_failures = 0;

            let mut updates = parsed.result;
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                if update.update_id < offset {
                    continue;
                }
                // Advance before conversion so a poison update is never replayed.
                offset = update.update_id.saturating_add(1);

                if let Some(inbound) = build_message_inbound(update.update_id, update.message.as_ref())
                {
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn build_message_inbound(
    update_id: i64,
    message: Option<&TelegramMessage>,
) -> Option<InboundMessage> {
    let message = message?;
    let chat = message.chat.as_ref()?;
    let content = message
        .text
        .as_deref()
        .or(message.caption.as_deref())
        .map(str::trim)
        .filter(|text| !text.is_empty())?
        .to_string();
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:message"));

    Some(InboundMessage {
        message_id: message_id.into(),
        channel_id: TELEGRAM_CHANNEL_ID.into(),
        sender_id: sender_id.into(),
        chat_id: chat.id.to_string().into(),
        is_group: chat.r#type != "private",
        content,
        metadata: serde_json::json!({
            "update_id": update_id,
            "from": message.from,
        }),
        received_at: Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TelegramUser {
    id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}
