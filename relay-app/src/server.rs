//! ThreadRelay server: store, dispatcher, Telegram adapter and the HTTP surface.

use crate::config::{RelayConfig, StoreBackend};
use crate::gateway::{Gateway, Notices};
use crate::relay::CompletionRelay;
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use relay_channels::{ChannelAdapter, OutboundMessage, TelegramAdapter, TelegramMode, chunk_text};
use relay_dispatch::{
    CounterStore, DispatchLimits, Dispatcher, KeySpace, MemoryStore, RedisStore, ThreadResolver,
};
use relay_llm::LlmClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub store: Arc<dyn CounterStore>,
    pub store_backend: StoreBackend,
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    cfg.openai_api_key()?;
    cfg.telegram_bot_token()?;
    let store = build_store(&cfg).await?;
    store
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("store ping failed: {e}"))?;
    tracing::info!(
        model = %cfg.general.model,
        store_backend = ?cfg.store.backend,
        telegram_mode = ?cfg.telegram.mode,
        bind_addr = %cfg.server.bind_addr,
        config_path = %path.display(),
        "config ok; store reachable"
    );
    Ok(())
}

/// Relays `message` to `chat_id` without going through the dispatcher.
pub async fn send_one_shot(config_path: Option<PathBuf>, chat_id: &str, message: &str) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let adapter = TelegramAdapter::new(cfg.telegram_bot_token()?, cfg.telegram.mode)?;
    let chunks = chunk_text(message, cfg.dispatch.chunk_chars);
    if chunks.is_empty() {
        return Err(anyhow::anyhow!("message is empty"));
    }
    for chunk in chunks {
        adapter.send(chat_id, OutboundMessage::text(chunk)).await?;
    }
    tracing::info!(chat_id, "message sent");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        model = %cfg.general.model,
        store_backend = ?cfg.store.backend,
        store_key_prefix = %cfg.store.key_prefix,
        telegram_mode = ?cfg.telegram.mode,
        telegram_webhook_secret_configured = cfg.telegram.webhook_secret.is_some(),
        dispatch_max_thread_depth = cfg.dispatch.max_thread_depth,
        dispatch_congestion_threshold = cfg.dispatch.congestion_threshold,
        dispatch_chunk_chars = cfg.dispatch.chunk_chars,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let store = build_store(&cfg).await?;
    let keys = KeySpace::new(cfg.store.key_prefix.clone());

    let telegram = Arc::new(
        TelegramAdapter::new(cfg.telegram_bot_token()?, cfg.telegram.mode)?
            .with_webhook_secret(cfg.telegram.webhook_secret.clone()),
    );
    let channel: Arc<dyn ChannelAdapter> = telegram.clone();
    let llm = Arc::new(LlmClient::new(cfg.openai_api_key()?, &cfg.general.model)?);

    let relay = Arc::new(CompletionRelay::new(
        llm,
        channel.clone(),
        ThreadResolver::new(store.clone(), &keys),
        cfg.general.system_prompt.clone(),
        cfg.dispatch.chunk_chars,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        keys,
        DispatchLimits {
            max_thread_depth: cfg.dispatch.max_thread_depth,
            congestion_threshold: cfg.dispatch.congestion_threshold,
        },
        relay,
    ));

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(1024);
    channel.start(inbound_tx).await?;

    let gateway = Arc::new(Gateway::new(
        dispatcher.clone(),
        channel.clone(),
        Notices {
            rejected: cfg.dispatch.rejected_notice.clone(),
            congestion: cfg.dispatch.congestion_notice.clone(),
        },
        inbound_rx,
    ));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!(channel = channel.channel_id(), "gateway started");

    let state = Arc::new(AppState {
        store,
        store_backend: cfg.store.backend,
        dispatcher,
        started_at,
    });

    let mut router = routes::router().layer(Extension(state));
    if telegram.mode() == TelegramMode::Webhook {
        router = router.merge(telegram.clone().webhook_router());
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri().path(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::debug!(
                method = %request.method(),
                uri = %request.uri().path(),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = router
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "threadrelay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    Ok(())
}

async fn build_store(cfg: &RelayConfig) -> Result<Arc<dyn CounterStore>> {
    match cfg.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&cfg.store.redis_url)
                .await
                .map_err(|e| anyhow::anyhow!("connect redis store: {e}"))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("in-memory store selected; depth limits hold for this process only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
