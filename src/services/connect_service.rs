//! Single-use connect tokens that bind a chat identity to a GitHub login.
//!
//! A token is stored as `{"platform": "<p>"}` until a bot redeems it, which
//! replaces the value with the chat binding (plus the platform tag). The value
//! expires ten minutes after the last write either way. Redemption is a read
//! followed by a write; two bots redeeming the same token at the same instant
//! can both pass the check, the later write wins.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{Cache, Expiration, Key, StoreError};

pub const CONNECT_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);
pub const ISSUE_WINDOW: Duration = Duration::from_secs(60);
pub const MAX_ISSUED_PER_WINDOW: i64 = 2;

const TOKEN_BYTES: usize = 32;
pub const PLATFORM_FIELD: &str = "platform";

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("connect token limit reached for {platform}; try again in a minute")]
    RateLimited { platform: Platform },
    #[error("connect token not found or expired")]
    NotFound,
    #[error("connect token already used")]
    AlreadyRedeemed,
    #[error("invalid connect payload: {0}")]
    InvalidPayload(String),
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("connect store unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Discord,
    Slack,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Discord => "discord",
            Platform::Slack => "slack",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Platform::Telegram),
            "discord" => Ok(Platform::Discord),
            "slack" => Ok(Platform::Slack),
            other => Err(ConnectError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Where a freshly issued token should be taken to be redeemed.
#[derive(Debug, Clone, Default)]
pub struct BotLinks {
    pub telegram_bot_username: String,
    pub discord_app_id: Option<String>,
}

impl BotLinks {
    fn urls(&self, platform: Platform, token: &str) -> (Option<String>, Option<String>) {
        match platform {
            Platform::Telegram => (
                Some(format!("https://t.me/{}?start={token}", self.telegram_bot_username)),
                Some(format!("https://t.me/{}?startgroup={token}", self.telegram_bot_username)),
            ),
            Platform::Discord => (
                self.discord_app_id.as_ref().map(|app_id| {
                    format!(
                        "https://discord.com/api/oauth2/authorize?client_id={app_id}&permissions=2048&scope=bot%20applications.commands"
                    )
                }),
                None,
            ),
            Platform::Slack => (None, None),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    /// Unix seconds.
    pub expire: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_group_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectStatus {
    /// Issued, no bot has redeemed it yet.
    Pending { platform: Option<String> },
    Ready(Map<String, Value>),
}

pub struct ConnectService {
    cache: Cache,
    links: BotLinks,
}

impl ConnectService {
    pub fn new(cache: Cache, links: BotLinks) -> Self {
        Self { cache, links }
    }

    pub async fn issue(&self, account: &str, platform: Platform) -> Result<IssuedToken, ConnectError> {
        // the increment claims a slot, so concurrent issues cannot both pass
        let issued = self
            .cache
            .incr_with_ttl(&count_key(account, platform), ISSUE_WINDOW)
            .await?;
        if issued > MAX_ISSUED_PER_WINDOW {
            warn!(account, %platform, issued, "Connect token rate limit hit.");
            return Err(ConnectError::RateLimited { platform });
        }

        let mut value = Map::new();
        value.insert(PLATFORM_FIELD.to_string(), Value::from(platform.as_str()));
        let value = Value::Object(value);
        // 256 random bits; a collision with a live token is regenerated
        let token = loop {
            let candidate = random_token();
            if self
                .cache
                .set_if_absent(&token_key(&candidate), &value, Expiration::After(CONNECT_TOKEN_TTL))
                .await?
            {
                break candidate;
            }
        };

        let expire = expiry_of(self.cache.now());
        let (bot_url, bot_group_url) = self.links.urls(platform, &token);
        info!(account, %platform, "Connect token issued.");
        Ok(IssuedToken {
            token,
            expire,
            bot_url,
            bot_group_url,
        })
    }

    /// Writes the bot's binding into an issued, unredeemed token for the same platform.
    pub async fn redeem(
        &self,
        token: &str,
        platform: Platform,
        payload: Map<String, Value>,
    ) -> Result<(), ConnectError> {
        if !payload.keys().any(|field| field != PLATFORM_FIELD) {
            return Err(ConnectError::InvalidPayload("payload carries no binding".into()));
        }
        let key = token_key(token);
        let stored: Map<String, Value> = self.cache.get(&key).await?.ok_or(ConnectError::NotFound)?;

        if stored.len() > 1 {
            debug!(%platform, "Connect token redeemed twice.");
            return Err(ConnectError::AlreadyRedeemed);
        }
        if stored.get(PLATFORM_FIELD).and_then(Value::as_str) != Some(platform.as_str()) {
            debug!(%platform, "Connect token redeemed from the wrong platform.");
            return Err(ConnectError::AlreadyRedeemed);
        }

        let mut result = payload;
        result.insert(PLATFORM_FIELD.to_string(), Value::from(platform.as_str()));
        self.cache
            .set(&key, &result, Expiration::After(CONNECT_TOKEN_TTL))
            .await?;
        info!(%platform, "Connect token redeemed.");
        Ok(())
    }

    pub async fn peek(&self, token: &str) -> Result<ConnectStatus, ConnectError> {
        let mut stored: Map<String, Value> = self
            .cache
            .get(&token_key(token))
            .await?
            .ok_or(ConnectError::NotFound)?;
        if stored.len() > 1 {
            return Ok(ConnectStatus::Ready(stored));
        }
        let platform = match stored.remove(PLATFORM_FIELD) {
            Some(Value::String(platform)) => Some(platform),
            _ => None,
        };
        Ok(ConnectStatus::Pending { platform })
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn token_key(token: &str) -> Key {
    Key::new(["connect", token])
}

fn count_key(account: &str, platform: Platform) -> Key {
    Key::new(["connect_token_count", account, platform.as_str()])
}

/// Unix seconds at which a token issued at `now` expires.
pub fn expiry_of(now: DateTime<Utc>) -> i64 {
    (now + TimeDelta::seconds(CONNECT_TOKEN_TTL.as_secs() as i64)).timestamp()
}
