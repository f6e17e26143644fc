use async_trait::async_trait;
use reqwest::{Client, Url, header};
use serde::{Deserialize, Serialize};

use super::{ConfigError, Notifier, SendError};
use crate::notifications::clients::ClientRegistry;
use crate::notifications::models::NotifierConfig;
use crate::version::USER_AGENT;

pub const SERVICE: &str = "bark";
pub const DEFAULT_SERVER: &str = "https://api.day.app";

#[derive(Serialize)]
struct Push<'a> {
    device_key: &'a str,
    title: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct PushReply {
    code: i64,
    #[serde(default)]
    message: String,
}

/// iOS push through a Bark server.
pub struct BarkNotifier {
    client: Client,
    push_url: String,
    device_key: String,
}

impl BarkNotifier {
    pub fn configure(config: &NotifierConfig, clients: &ClientRegistry) -> Result<Self, ConfigError> {
        let device_key = config.non_empty("device_token").ok_or(ConfigError::MissingField {
            service: SERVICE,
            field: "device_token",
        })?;
        let server = config.non_empty("server").unwrap_or(DEFAULT_SERVER);
        Url::parse(server).map_err(|e| ConfigError::invalid(SERVICE, "server", e))?;

        Ok(Self {
            client: clients.http().clone(),
            push_url: format!("{}/push", server.trim_end_matches('/')),
            device_key: device_key.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for BarkNotifier {
    fn service(&self) -> &'static str {
        SERVICE
    }

    async fn send(&self, title: &str, body: &str) -> Result<(), SendError> {
        let response = self
            .client
            .post(&self.push_url)
            .header(header::USER_AGENT, USER_AGENT)
            .json(&Push {
                device_key: &self.device_key,
                title,
                body,
            })
            .send()
            .await?;
        let reply: PushReply = SendError::check_status(SERVICE, response).await?.json().await?;
        if reply.code != 200 {
            return Err(SendError::Rejected {
                service: SERVICE,
                reason: reply.message,
            });
        }
        Ok(())
    }
}
