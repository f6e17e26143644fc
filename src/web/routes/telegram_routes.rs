use axum::{Json, Router, extract::State, routing::post};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::notifications::clients::{OutgoingMessage, TelegramBot};
use crate::services::connect_service::Platform;
use crate::web::{AppError, AppState};

pub fn create_telegram_router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(on_update))
}

#[derive(Debug, Deserialize)]
struct Update {
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    edited_message: Option<Message>,
    #[serde(default)]
    channel_post: Option<Message>,
    #[serde(default)]
    edited_channel_post: Option<Message>,
}

impl Update {
    fn into_message(self) -> Option<Message> {
        self.message
            .or(self.edited_message)
            .or(self.channel_post)
            .or(self.edited_channel_post)
    }
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    #[serde(default)]
    from: Option<Sender>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Sender {
    #[serde(default)]
    username: Option<String>,
}

/// Splits `/start <token>` or `/start@bot <token>` into the token, possibly empty.
/// Anything that is not a start command is `None`.
fn start_argument(text: &str) -> Option<&str> {
    let text = text.trim();
    let (command, argument) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
    let is_start = command == "/start" || command.starts_with("/start@");
    is_start.then(|| argument.trim())
}

async fn on_update(
    State(app_state): State<Arc<AppState>>,
    Json(update): Json<Update>,
) -> Result<Json<Value>, AppError> {
    let bot = app_state
        .dispatcher
        .registry()
        .default_telegram()
        .ok_or_else(|| AppError::ServiceUnavailable("telegram bot is not configured".to_string()))?;

    let Some(message) = update.into_message() else {
        return Ok(Json(json!({ "status": "not /start command" })));
    };
    let Some(token) = message.text.as_deref().and_then(start_argument) else {
        return Ok(Json(json!({ "status": "not /start command" })));
    };
    let chat_id = message.chat.id;

    if token.is_empty() {
        let help = if matches!(message.chat.kind.as_str(), "group" | "supergroup") {
            format!(
                "Send `/start@{} <connect token>` to connect your GitHub account",
                app_state.config.telegram_bot_username
            )
        } else {
            "Send `/start <connect token>` to connect your GitHub account".to_string()
        };
        reply(&bot, chat_id, message.message_id, &help, true).await;
        return Ok(Json(json!({ "status": "help sent" })));
    }

    let mut binding = Map::new();
    binding.insert("chat_id".to_string(), Value::from(chat_id));
    binding.insert(
        "telegram_username".to_string(),
        Value::from(message.from.and_then(|from| from.username).unwrap_or_default()),
    );

    match app_state.connect.redeem(token, Platform::Telegram, binding).await {
        Ok(()) => {
            reply(&bot, chat_id, message.message_id, "Connected!", false).await;
            Ok(Json(json!({ "status": "ok" })))
        }
        Err(e) => {
            debug!(chat_id, error = %e, "Telegram connect token rejected.");
            let text = format!("Invalid connect token: {token:?}");
            reply(&bot, chat_id, message.message_id, &text, false).await;
            Ok(Json(json!({ "error": "invalid connect token" })))
        }
    }
}

async fn reply(bot: &TelegramBot, chat_id: i64, reply_to: i64, text: &str, markdown: bool) {
    let message = OutgoingMessage {
        text,
        markdown,
        reply_to: Some(reply_to),
    };
    if let Err(e) = bot.send_message(chat_id, message).await {
        warn!(chat_id, error = %e, "Failed to reply on Telegram.");
    }
}
