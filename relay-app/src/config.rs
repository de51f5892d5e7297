//! ThreadRelay configuration loader.

use relay_channels::TelegramMode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub model: String,
    pub system_prompt: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub mode: TelegramMode,
    /// Expected `X-Telegram-Bot-Api-Secret-Token` on webhook deliveries.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    /// Process-local; only correct with a single instance.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "threadrelay".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_thread_depth")]
    pub max_thread_depth: i64,
    #[serde(default = "default_congestion_threshold")]
    pub congestion_threshold: u64,
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_rejected_notice")]
    pub rejected_notice: String,
    #[serde(default = "default_congestion_notice")]
    pub congestion_notice: String,
}

fn default_max_thread_depth() -> i64 {
    3
}

fn default_congestion_threshold() -> u64 {
    3
}

fn default_chunk_chars() -> usize {
    relay_channels::TELEGRAM_MAX_MESSAGE_CHARS
}

fn default_rejected_notice() -> String {
    "I'm still working on your earlier messages. Please wait for those replies before sending more."
        .to_string()
}

fn default_congestion_notice() -> String {
    "Lots of people are chatting with me right now, so my reply may take a little longer."
        .to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_thread_depth: default_max_thread_depth(),
            congestion_threshold: default_congestion_threshold(),
            chunk_chars: default_chunk_chars(),
            rejected_notice: default_rejected_notice(),
            congestion_notice: default_congestion_notice(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let cfg = Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("config {}: {e}", path.display()))?;
        Ok((cfg, path))
    }

    fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let mut cfg: RelayConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse: {e}"))?;
        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| env(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("THREADRELAY_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Some(v) = var("TELEGRAM_WEBHOOK_SECRET") {
            self.telegram.webhook_secret = Some(v);
        }
        if let Some(v) = var("REDIS_URL") {
            self.store.redis_url = v;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.dispatch.max_thread_depth < 1 {
            return Err(anyhow::anyhow!("dispatch.max_thread_depth must be >= 1"));
        }
        if self.dispatch.congestion_threshold < 1 {
            return Err(anyhow::anyhow!("dispatch.congestion_threshold must be >= 1"));
        }
        if self.dispatch.chunk_chars == 0
            || self.dispatch.chunk_chars > relay_channels::TELEGRAM_MAX_MESSAGE_CHARS
        {
            return Err(anyhow::anyhow!(
                "dispatch.chunk_chars must be in 1..={}",
                relay_channels::TELEGRAM_MAX_MESSAGE_CHARS
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err(anyhow::anyhow!("store.redis_url is required for the redis backend"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn openai_api_key(&self) -> anyhow::Result<&str> {
        self.keys
            .openai_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("keys.openai_api_key (or OPENAI_API_KEY) is required"))
    }

    pub fn telegram_bot_token(&self) -> anyhow::Result<&str> {
        let token = self.telegram.bot_token.trim();
        if token.is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token (or TELEGRAM_BOT_TOKEN) is required"
            ));
        }
        Ok(token)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".threadrelay").join("config.toml")
}
