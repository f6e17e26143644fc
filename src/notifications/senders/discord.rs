use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde_json::{Value, json};

use super::{ConfigError, Notifier, SendError};
use crate::notifications::clients::{BotToken, ClientRegistry, DiscordBot};
use crate::notifications::models::NotifierConfig;
use crate::version::USER_AGENT;

pub const WEBHOOK_SERVICE: &str = "discord_webhook";
pub const BOT_SERVICE: &str = "discord_bot";

const AUTHOR_URL: &str = "https://github.com/apps/stars-notifier";
const DEFAULT_USERNAME: &str = "Star++";
const DEFAULT_AVATAR: &str = "https://github-stargazer.vercel.app/avatar.png";
const DEFAULT_COLOR: u32 = 0xfd9a00;

/// Author block and accent color shared by both Discord backends.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EmbedStyle {
    username: String,
    avatar_url: String,
    color: u32,
}

impl EmbedStyle {
    fn from_config(service: &'static str, config: &NotifierConfig) -> Result<Self, ConfigError> {
        let color = match config.non_empty("color") {
            Some(hex) => parse_color(hex).map_err(|reason| ConfigError::invalid(service, "color", reason))?,
            None => DEFAULT_COLOR,
        };
        Ok(Self {
            username: config.non_empty("username").unwrap_or(DEFAULT_USERNAME).to_string(),
            avatar_url: config.non_empty("avatar_url").unwrap_or(DEFAULT_AVATAR).to_string(),
            color,
        })
    }

    fn message(&self, title: &str, body: &str) -> Value {
        json!({
            "embeds": [{
                "author": {
                    "name": self.username,
                    "icon_url": self.avatar_url,
                    "url": AUTHOR_URL,
                },
                "color": self.color,
                "title": title,
                "description": body,
            }]
        })
    }
}

/// `fd9a00` or `#fd9a00`, at most 24 bits.
fn parse_color(hex: &str) -> Result<u32, String> {
    let digits = hex.strip_prefix('#').unwrap_or(hex);
    let color = u32::from_str_radix(digits, 16).map_err(|e| format!("{hex:?} is not hex: {e}"))?;
    if color > 0xFF_FFFF {
        return Err(format!("{hex:?} is wider than RGB"));
    }
    Ok(color)
}

/// Discord snowflakes are unsigned 64-bit integers.
fn snowflake(service: &'static str, field: &'static str, config: &NotifierConfig) -> Result<String, ConfigError> {
    let value = config
        .non_empty(field)
        .ok_or(ConfigError::MissingField { service, field })?;
    value
        .parse::<u64>()
        .map_err(|e| ConfigError::invalid(service, field, e))?;
    Ok(value.to_string())
}

/// Posts one embed through an incoming webhook. Needs no bot.
pub struct DiscordWebhookNotifier {
    http: Client,
    url: String,
    style: EmbedStyle,
}

impl DiscordWebhookNotifier {
    pub fn configure(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Self, ConfigError> {
        let webhook_id = snowflake(WEBHOOK_SERVICE, "webhook_id", config)?;
        let webhook_token = config.non_empty("webhook_token").ok_or(ConfigError::MissingField {
            service: WEBHOOK_SERVICE,
            field: "webhook_token",
        })?;
        Ok(Self {
            http: clients.http().clone(),
            url: format!(
                "{}/webhooks/{webhook_id}/{webhook_token}",
                clients.endpoints().discord_api
            ),
            style: EmbedStyle::from_config(WEBHOOK_SERVICE, config)?,
        })
    }
}

#[async_trait]
impl Notifier for DiscordWebhookNotifier {
    fn service(&self) -> &'static str {
        WEBHOOK_SERVICE
    }

    async fn send(&self, title: &str, body: &str) -> Result<(), SendError> {
        let response = self
            .http
            .post(&self.url)
            .header(header::USER_AGENT, USER_AGENT)
            .json(&self.style.message(title, body))
            .send()
            .await?;
        SendError::check_status(WEBHOOK_SERVICE, response).await?;
        Ok(())
    }
}

/// Posts one embed into a channel as a bot user.
pub struct DiscordBotNotifier {
    bot: Arc<DiscordBot>,
    channel_id: String,
    style: EmbedStyle,
}

impl DiscordBotNotifier {
    pub fn configure(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Self, ConfigError> {
        let channel_id = snowflake(BOT_SERVICE, "channel_id", config)?;
        let style = EmbedStyle::from_config(BOT_SERVICE, config)?;
        let bot = clients.discord(&BotToken::from_setting(config.get("token")))?;
        Ok(Self {
            bot,
            channel_id,
            style,
        })
    }
}

#[async_trait]
impl Notifier for DiscordBotNotifier {
    fn service(&self) -> &'static str {
        BOT_SERVICE
    }

    async fn send(&self, title: &str, body: &str) -> Result<(), SendError> {
        self.bot
            .create_message(&self.channel_id, &self.style.message(title, body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::clients::Endpoints;
    use httpmock::prelude::*;

    fn clients(api: String) -> ClientRegistry {
        ClientRegistry::new(
            Client::new(),
            Endpoints {
                discord_api: api,
                ..Endpoints::default()
            },
            None,
            Some("shared-bot".into()),
        )
    }

    #[test]
    fn colors_parse_with_or_without_a_hash() {
        assert_eq!(parse_color("fd9a00"), Ok(0xfd9a00));
        assert_eq!(parse_color("#00FF00"), Ok(0x00ff00));
        assert!(parse_color("orange").is_err());
        assert!(parse_color("1000000").is_err());
    }

    #[test]
    fn style_defaults() {
        let style = EmbedStyle::from_config(BOT_SERVICE, &NotifierConfig::new()).unwrap();
        assert_eq!(style.username, "Star++");
        assert_eq!(style.avatar_url, DEFAULT_AVATAR);
        assert_eq!(style.color, DEFAULT_COLOR);
    }

    #[test]
    fn bad_color_names_the_field() {
        let config = NotifierConfig::new()
            .with("service", WEBHOOK_SERVICE)
            .with("webhook_id", "1")
            .with("webhook_token", "t")
            .with("color", "zz");
        let err = DiscordWebhookNotifier::configure(&config, &clients(String::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidField { field: "color", .. }));
    }

    #[test]
    fn webhook_token_is_required() {
        let config = NotifierConfig::new()
            .with("service", WEBHOOK_SERVICE)
            .with("webhook_id", "1");
        let err = DiscordWebhookNotifier::configure(&config, &clients(String::new()))
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "discord_webhook: webhook_token is empty");
    }

    #[tokio::test]
    async fn webhook_executes_with_one_embed() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/webhooks/123/secret")
                    .body_includes("\"title\":\"New GitHub Star on acme/widget\"")
                    .body_includes("\"color\":16620032");
                then.status(204);
            })
            .await;

        let config = NotifierConfig::new()
            .with("service", WEBHOOK_SERVICE)
            .with("webhook_id", "123")
            .with("webhook_token", "secret");
        let notifier = DiscordWebhookNotifier::configure(&config, &clients(server.base_url())).unwrap();
        notifier.send("New GitHub Star on acme/widget", "body").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn bot_posts_to_the_channel_with_bot_authorization() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/channels/456/messages")
                    .header("authorization", "Bot shared-bot");
                then.status(200).body("{}");
            })
            .await;

        let config = NotifierConfig::new()
            .with("service", BOT_SERVICE)
            .with("channel_id", "456");
        let notifier = DiscordBotNotifier::configure(&config, &clients(server.base_url())).unwrap();
        notifier.send("title", "body").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn bot_failure_carries_the_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/channels/456/messages");
                then.status(403).body("{\"message\":\"Missing Access\"}");
            })
            .await;

        let config = NotifierConfig::new()
            .with("service", BOT_SERVICE)
            .with("channel_id", "456");
        let notifier = DiscordBotNotifier::configure(&config, &clients(server.base_url())).unwrap();
        let err = notifier.send("title", "body").await.unwrap_err();
        assert!(matches!(err, SendError::Status { service: BOT_SERVICE, .. }));
    }
}
