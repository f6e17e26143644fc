use std::sync::Arc;

use async_trait::async_trait;

use super::{ConfigError, Notifier, SendError};
use crate::notifications::clients::{BotToken, ClientRegistry, OutgoingMessage, TelegramBot};
use crate::notifications::models::NotifierConfig;

pub const SERVICE: &str = "telegram";

/// Pushes notifications through the Telegram Bot API as MarkdownV2 text.
pub struct TelegramNotifier {
    bot: Arc<TelegramBot>,
    chat_id: i64,
}

impl TelegramNotifier {
    pub fn configure(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Self, ConfigError> {
        let chat_id = config
            .non_empty("chat_id")
            .ok_or(ConfigError::MissingField {
                service: SERVICE,
                field: "chat_id",
            })?
            .parse::<i64>()
            .map_err(|e| ConfigError::invalid(SERVICE, "chat_id", e))?;
        let bot = clients.telegram(&BotToken::from_setting(config.get("token")))?;
        Ok(Self { bot, chat_id })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn service(&self) -> &'static str {
        SERVICE
    }

    /// Title and body are expected to be MarkdownV2-escaped already.
    async fn send(&self, title: &str, body: &str) -> Result<(), SendError> {
        let text = format!("{title}\n{body}");
        self.bot
            .send_message(
                self.chat_id,
                OutgoingMessage {
                    text: &text,
                    markdown: true,
                    reply_to: None,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::clients::Endpoints;
    use httpmock::prelude::*;
    use reqwest::Client;
    use serde_json::json;

    fn clients(api: String, default_token: Option<&str>) -> ClientRegistry {
        ClientRegistry::new(
            Client::new(),
            Endpoints {
                telegram_api: api,
                ..Endpoints::default()
            },
            default_token.map(str::to_string),
            None,
        )
    }

    #[test]
    fn chat_id_must_be_numeric() {
        let config = NotifierConfig::new().with("service", SERVICE).with("chat_id", "@channel");
        let err = TelegramNotifier::configure(&config, &clients(String::new(), Some("1:a")))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidField { field: "chat_id", .. }));
    }

    #[test]
    fn chat_id_is_required() {
        let config = NotifierConfig::new().with("service", SERVICE);
        let err = TelegramNotifier::configure(&config, &clients(String::new(), Some("1:a")))
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "telegram: chat_id is empty");
    }

    #[test]
    fn default_token_without_a_shared_bot_fails() {
        let config = NotifierConfig::new().with("service", SERVICE).with("chat_id", "42");
        let err = TelegramNotifier::configure(&config, &clients(String::new(), None))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::DefaultBotUnavailable(SERVICE)));
    }

    #[tokio::test]
    async fn sends_title_and_body_as_one_markdown_message() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/bot999:own/sendMessage").json_body(json!({
                    "chat_id": -100123,
                    "text": "New GitHub Star on acme/widget\nbody",
                    "parse_mode": "MarkdownV2",
                    "disable_web_page_preview": true
                }));
                then.status(200).json_body(json!({ "ok": true, "result": {} }));
            })
            .await;

        let config = NotifierConfig::new()
            .with("service", SERVICE)
            .with("chat_id", "-100123")
            .with("token", "999:own");
        let notifier = TelegramNotifier::configure(&config, &clients(server.base_url(), None)).unwrap();
        notifier.send("New GitHub Star on acme/widget", "body").await.unwrap();
        mock.assert_async().await;
    }
}
