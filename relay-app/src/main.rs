//! ThreadRelay binary: relays Telegram chats to a threaded completion service.

mod commands;
mod config;
mod gateway;
mod relay;
mod routes;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "threadrelay", version, about = "Per-thread ordered chat relay")]
struct Cli {
    /// Config file (default: ~/.threadrelay/config.toml).
    #[arg(long, global = true, env = "THREADRELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay server (default).
    Serve,
    /// Validate config, credentials and store connectivity.
    Doctor,
    /// One-shot send of a message to a Telegram chat.
    Send { chat_id: String, message: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real deployments use the environment directly.
    let dotenv = dotenvy::dotenv();
    init_tracing()?;
    install_panic_hook();
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::Send { chat_id, message } => {
            server::send_one_shot(cli.config, &chat_id, &message).await
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(anyhow::anyhow!(
                "unsupported THREADRELAY_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            )),
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            "info,threadrelay=debug,relay_app=debug,relay_channels=debug,relay_dispatch=debug,relay_llm=debug,tower_http=info",
        )
    });
    let log_format = match std::env::var("THREADRELAY_LOG_FORMAT") {
        Ok(v) => LogFormat::parse(&v)?,
        Err(_) => LogFormat::Json,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);
    match log_format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }

    tracing::info!(log_format = ?log_format, "tracing initialized");
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(panic_location = %location, panic_payload = %payload, "panic captured");
        default_hook(info);
    }));
}
