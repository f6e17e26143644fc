//! Long-lived chat-bot handles shared by every backend that talks to the same bot.
//!
//! The registry is built once at startup and passed to backend resolution; a
//! configuration that brings its own bot token gets an ad hoc handle instead.

use std::sync::Arc;

use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::senders::{ConfigError, SendError};
use crate::version::USER_AGENT;

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";
pub const DISCORD_API_URL: &str = "https://discord.com/api/v10";

/// Base URLs of the chat platforms, overridable for tests.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub telegram_api: String,
    pub discord_api: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            telegram_api: TELEGRAM_API_URL.to_string(),
            discord_api: DISCORD_API_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotToken {
    /// The process-wide bot configured at startup.
    Default,
    Custom(String),
}

impl BotToken {
    /// Empty or `default` selects the shared bot.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") | Some("default") => BotToken::Default,
            Some(token) => BotToken::Custom(token.to_string()),
        }
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    disable_web_page_preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
}

#[derive(Serialize)]
struct SetWebhook<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct TelegramReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// A Telegram message as the bot sends it.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage<'a> {
    pub text: &'a str,
    pub markdown: bool,
    pub reply_to: Option<i64>,
}

pub struct TelegramBot {
    http: Client,
    api_url: String,
    token: String,
}

impl TelegramBot {
    pub fn new(http: Client, api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            token: token.into(),
        }
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        message: OutgoingMessage<'_>,
    ) -> Result<(), SendError> {
        let payload = SendMessage {
            chat_id,
            text: message.text,
            parse_mode: message.markdown.then_some("MarkdownV2"),
            disable_web_page_preview: true,
            reply_to_message_id: message.reply_to,
        };
        self.call("sendMessage", &payload).await
    }

    /// Points the bot's updates at `url`.
    pub async fn set_webhook(&self, url: &str) -> Result<(), SendError> {
        self.call("setWebhook", &SetWebhook { url }).await
    }

    async fn call<T: Serialize + ?Sized>(&self, method: &str, payload: &T) -> Result<(), SendError> {
        let response = self
            .http
            .post(format!("{}/bot{}/{method}", self.api_url, self.token))
            .header(header::USER_AGENT, USER_AGENT)
            .json(payload)
            .send()
            .await?;
        let response = SendError::check_status("telegram", response).await?;

        let reply: TelegramReply = response.json().await?;
        if !reply.ok {
            return Err(SendError::Rejected {
                service: "telegram",
                reason: reply.description.unwrap_or_else(|| "ok=false".to_string()),
            });
        }
        Ok(())
    }
}

pub struct DiscordBot {
    http: Client,
    api_url: String,
    token: String,
}

impl DiscordBot {
    pub fn new(http: Client, api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            token: token.into(),
        }
    }

    /// `POST /channels/{id}/messages` with a prepared message body.
    pub async fn create_message(&self, channel_id: &str, message: &Value) -> Result<(), SendError> {
        let response = self
            .http
            .post(format!("{}/channels/{channel_id}/messages", self.api_url))
            .header(header::AUTHORIZATION, format!("Bot {}", self.token))
            .header(header::USER_AGENT, USER_AGENT)
            .json(message)
            .send()
            .await?;
        SendError::check_status("discord_bot", response).await?;
        Ok(())
    }
}

pub struct ClientRegistry {
    http: Client,
    endpoints: Endpoints,
    telegram: Option<Arc<TelegramBot>>,
    discord: Option<Arc<DiscordBot>>,
}

impl ClientRegistry {
    pub fn new(
        http: Client,
        endpoints: Endpoints,
        telegram_token: Option<String>,
        discord_token: Option<String>,
    ) -> Self {
        let telegram = telegram_token
            .filter(|token| !token.is_empty())
            .map(|token| Arc::new(TelegramBot::new(http.clone(), &endpoints.telegram_api, token)));
        let discord = discord_token
            .filter(|token| !token.is_empty())
            .map(|token| Arc::new(DiscordBot::new(http.clone(), &endpoints.discord_api, token)));
        Self {
            http,
            endpoints,
            telegram,
            discord,
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn default_telegram(&self) -> Option<Arc<TelegramBot>> {
        self.telegram.clone()
    }

    pub fn telegram(&self, token: &BotToken) -> Result<Arc<TelegramBot>, ConfigError> {
        match token {
            BotToken::Default => self
                .telegram
                .clone()
                .ok_or(ConfigError::DefaultBotUnavailable("telegram")),
            BotToken::Custom(token) => Ok(Arc::new(TelegramBot::new(
                self.http.clone(),
                &self.endpoints.telegram_api,
                token,
            ))),
        }
    }

    pub fn discord(&self, token: &BotToken) -> Result<Arc<DiscordBot>, ConfigError> {
        match token {
            BotToken::Default => self
                .discord
                .clone()
                .ok_or(ConfigError::DefaultBotUnavailable("discord_bot")),
            BotToken::Custom(token) => Ok(Arc::new(DiscordBot::new(
                self.http.clone(),
                &self.endpoints.discord_api,
                token,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn blank_and_default_tokens_select_the_shared_bot() {
        assert_eq!(BotToken::from_setting(None), BotToken::Default);
        assert_eq!(BotToken::from_setting(Some("")), BotToken::Default);
        assert_eq!(BotToken::from_setting(Some("default")), BotToken::Default);
        assert_eq!(
            BotToken::from_setting(Some("123:abc")),
            BotToken::Custom("123:abc".into())
        );
    }

    #[test]
    fn default_bot_is_shared_and_custom_bots_are_not() {
        let registry = ClientRegistry::new(
            Client::new(),
            Endpoints::default(),
            Some("111:shared".into()),
            None,
        );
        let a = registry.telegram(&BotToken::Default).unwrap();
        let b = registry.telegram(&BotToken::Default).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let custom = registry.telegram(&BotToken::Custom("222:own".into())).unwrap();
        assert!(!Arc::ptr_eq(&a, &custom));
    }

    #[test]
    fn missing_default_bot_is_a_config_error() {
        let registry = ClientRegistry::new(Client::new(), Endpoints::default(), None, None);
        assert!(matches!(
            registry.discord(&BotToken::Default),
            Err(ConfigError::DefaultBotUnavailable("discord_bot"))
        ));
    }

    #[tokio::test]
    async fn telegram_ok_false_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/bot111:shared/sendMessage");
                then.status(200)
                    .json_body(json!({ "ok": false, "description": "chat not found" }));
            })
            .await;

        let bot = TelegramBot::new(Client::new(), server.base_url(), "111:shared");
        let err = bot
            .send_message(42, OutgoingMessage { text: "hi", ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Rejected { reason, .. } if reason == "chat not found"));
    }

    #[tokio::test]
    async fn set_webhook_registers_the_update_url() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/bot111:shared/setWebhook")
                    .json_body(json!({ "url": "https://stargazer.example/api/webhook/telegram" }));
                then.status(200)
                    .json_body(json!({ "ok": true, "result": true, "description": "Webhook was set" }));
            })
            .await;

        let bot = TelegramBot::new(Client::new(), server.base_url(), "111:shared");
        bot.set_webhook("https://stargazer.example/api/webhook/telegram")
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
