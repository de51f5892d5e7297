//! Chat commands. They are answered directly and never enter the dispatch queue.

use relay_channels::ChatId;
use relay_dispatch::ThreadResolver;

const HELP_TEXT: &str = "Send me a message and I'll reply in this chat. Messages are answered \
in order; if you send several before I reply, I may ask you to wait.\n\
/reset starts a new conversation\n/help shows this text";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Reset,
    Unknown,
}

/// Parses `/name` or `/name@botname`; anything else is a normal message.
pub fn parse_command(input: &str) -> Option<Command> {
    let trimmed = input.trim();
    let rest = trimmed.strip_prefix('/')?;
    let name = rest.split_whitespace().next().unwrap_or_default();
    let name = name.split('@').next().unwrap_or_default();
    Some(match name.to_ascii_lowercase().as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "reset" | "new" => Command::Reset,
        _ => Command::Unknown,
    })
}

/// Returns the reply for a command message, or `None` when `input` is not a command.
#[tracing::instrument(level = "debug", skip_all, fields(chat_id = %chat_id))]
pub async fn handle_command(
    resolver: &ThreadResolver,
    chat_id: &ChatId,
    input: &str,
) -> Option<String> {
    let command = parse_command(input)?;
    let reply = match command {
        Command::Start | Command::Help => HELP_TEXT.to_string(),
        Command::Reset => match resolver.forget(chat_id).await {
            Ok(true) => "Conversation reset. Your next message starts fresh.".to_string(),
            Ok(false) => "There was no conversation to reset.".to_string(),
            Err(e) => {
                tracing::error!(%e, "failed to forget chat thread");
                "Couldn't reset the conversation right now. Please try again shortly.".to_string()
            }
        },
        Command::Unknown => "Unknown command. Supported: /start /help /reset".to_string(),
    };
    Some(reply)
}
