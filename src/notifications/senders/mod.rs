use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use super::clients::ClientRegistry;
use super::models::NotifierConfig;

pub mod bark;
pub mod discord;
pub mod telegram;
pub mod webhook;

use bark::BarkNotifier;
use discord::{DiscordBotNotifier, DiscordWebhookNotifier};
use telegram::TelegramNotifier;
use webhook::WebhookNotifier;

/// A notifier configuration that cannot be turned into a backend. Never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("service is empty")]
    MissingService,
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("{service}: {field} is empty")]
    MissingField {
        service: &'static str,
        field: &'static str,
    },
    #[error("{service}: invalid {field}: {reason}")]
    InvalidField {
        service: &'static str,
        field: &'static str,
        reason: String,
    },
    #[error("{0}: no default bot is configured on this server")]
    DefaultBotUnavailable(&'static str),
    #[error("{service}: invalid body template: {reason}")]
    Template {
        service: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(service: &'static str, field: &'static str, reason: impl ToString) -> Self {
        ConfigError::InvalidField {
            service,
            field,
            reason: reason.to_string(),
        }
    }
}

/// One backend's outbound call failed.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{service} returned non-success status: {status}. Body: {body}")]
    Status {
        service: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("{service} rejected the message: {reason}")]
    Rejected {
        service: &'static str,
        reason: String,
    },
    #[error("Templating error: {0}")]
    Template(String),
    #[error("send task failed: {0}")]
    Task(String),
}

impl SendError {
    /// Passes 2xx responses through and turns anything else into [`SendError::Status`].
    pub(crate) async fn check_status(
        service: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, SendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error body".to_string());
        Err(SendError::Status {
            service,
            status,
            body,
        })
    }
}

/// A configured outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn service(&self) -> &'static str;

    async fn send(&self, title: &str, body: &str) -> Result<(), SendError>;
}

/// The closed set of backend kinds.
pub enum Backend {
    Telegram(TelegramNotifier),
    DiscordWebhook(DiscordWebhookNotifier),
    DiscordBot(DiscordBotNotifier),
    Webhook(WebhookNotifier),
    Bark(BarkNotifier),
}

#[async_trait]
impl Notifier for Backend {
    fn service(&self) -> &'static str {
        match self {
            Backend::Telegram(n) => n.service(),
            Backend::DiscordWebhook(n) => n.service(),
            Backend::DiscordBot(n) => n.service(),
            Backend::Webhook(n) => n.service(),
            Backend::Bark(n) => n.service(),
        }
    }

    async fn send(&self, title: &str, body: &str) -> Result<(), SendError> {
        match self {
            Backend::Telegram(n) => n.send(title, body).await,
            Backend::DiscordWebhook(n) => n.send(title, body).await,
            Backend::DiscordBot(n) => n.send(title, body).await,
            Backend::Webhook(n) => n.send(title, body).await,
            Backend::Bark(n) => n.send(title, body).await,
        }
    }
}

type Constructor = fn(&NotifierConfig, &ClientRegistry) -> Result<Backend, ConfigError>;

fn build_telegram(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Backend, ConfigError> {
    TelegramNotifier::configure(config, clients).map(Backend::Telegram)
}

fn build_discord_webhook(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Backend, ConfigError> {
    DiscordWebhookNotifier::configure(config, clients).map(Backend::DiscordWebhook)
}

fn build_discord_bot(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Backend, ConfigError> {
    DiscordBotNotifier::configure(config, clients).map(Backend::DiscordBot)
}

fn build_webhook(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Backend, ConfigError> {
    WebhookNotifier::configure(config, clients).map(Backend::Webhook)
}

fn build_bark(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Backend, ConfigError> {
    BarkNotifier::configure(config, clients).map(Backend::Bark)
}

const REGISTRY: &[(&str, Constructor)] = &[
    (telegram::SERVICE, build_telegram),
    (discord::WEBHOOK_SERVICE, build_discord_webhook),
    (discord::BOT_SERVICE, build_discord_bot),
    (webhook::SERVICE, build_webhook),
    (bark::SERVICE, build_bark),
];

/// Builds the backend selected by the config's `service` key. Performs no I/O.
pub fn resolve(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Backend, ConfigError> {
    let service = config.service().ok_or(ConfigError::MissingService)?;
    let (_, construct) = REGISTRY
        .iter()
        .find(|(name, _)| *name == service)
        .ok_or_else(|| ConfigError::UnknownService(service.to_string()))?;
    construct(config, clients)
}

/// A resolved backend together with its position label, e.g. `webhook#2`.
#[derive(Clone)]
pub struct ResolvedBackend {
    pub label: String,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Error, Debug)]
#[error("{label}: {source}")]
pub struct ResolveError {
    pub label: String,
    #[source]
    pub source: ConfigError,
}

/// Resolves every config in order, stopping at the first one that is invalid.
pub fn resolve_all(
    configs: &[NotifierConfig],
    clients: &ClientRegistry,
) -> Result<Vec<ResolvedBackend>, ResolveError> {
    configs
        .iter()
        .enumerate()
        .map(|(index, config)| {
            let label = format!("{}#{}", config.service().unwrap_or("?"), index + 1);
            match resolve(config, clients) {
                Ok(backend) => Ok(ResolvedBackend {
                    label,
                    notifier: Arc::new(backend),
                }),
                Err(source) => Err(ResolveError { label, source }),
            }
        })
        .collect()
}
