use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{Expiration, Key, KvStore, StoreError};

/// Redis over HTTPS, speaking the Upstash / Vercel KV REST protocol: a command
/// is a JSON array of strings POSTed to the base URL, and `/multi-exec` runs a
/// list of commands as one transaction.
pub struct RestStore {
    http: Client,
    url: String,
    token: String,
}

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl RestStore {
    pub fn new(http: Client, url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        }
    }

    async fn command(&self, args: Vec<String>) -> Result<Value, StoreError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        let reply: Reply = serde_json::from_str(&body).map_err(|_| {
            StoreError::UnexpectedReply(format!("status {status}, body {body}"))
        })?;
        unwrap_reply(reply)
    }

    async fn transaction(&self, commands: Vec<Vec<String>>) -> Result<Vec<Value>, StoreError> {
        let response = self
            .http
            .post(format!("{}/multi-exec", self.url))
            .bearer_auth(&self.token)
            .json(&commands)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<Reply>(&body)
                .ok()
                .and_then(|reply| reply.error)
                .unwrap_or_else(|| format!("status {status}, body {body}"));
            return Err(StoreError::Command(message));
        }
        let replies: Vec<Reply> = serde_json::from_str(&body)
            .map_err(|_| StoreError::UnexpectedReply(body.clone()))?;
        replies.into_iter().map(unwrap_reply).collect()
    }
}

fn unwrap_reply(reply: Reply) -> Result<Value, StoreError> {
    match reply.error {
        Some(error) => Err(StoreError::Command(error)),
        None => Ok(reply.result.unwrap_or(Value::Null)),
    }
}

fn optional_text(value: Value) -> Result<Option<String>, StoreError> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text)),
        other => Err(StoreError::UnexpectedReply(other.to_string())),
    }
}

fn integer(value: Value) -> Result<i64, StoreError> {
    let parsed = match &value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| StoreError::UnexpectedReply(value.to_string()))
}

fn seconds(ttl: Duration) -> String {
    ttl.as_secs().max(1).to_string()
}

fn set_command(key: &Key, value: &str, expiration: Expiration) -> Vec<String> {
    let mut args = vec!["SET".to_owned(), key.to_string(), value.to_owned()];
    if let Some(ttl) = expiration.ttl() {
        args.push("EX".to_owned());
        args.push(seconds(ttl));
    }
    args
}

#[async_trait]
impl KvStore for RestStore {
    async fn get(&self, key: &Key) -> Result<Option<String>, StoreError> {
        optional_text(self.command(vec!["GET".into(), key.to_string()]).await?)
    }

    async fn set(&self, key: &Key, value: &str, expiration: Expiration) -> Result<(), StoreError> {
        self.command(set_command(key, value, expiration)).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &Key,
        value: &str,
        expiration: Expiration,
    ) -> Result<bool, StoreError> {
        let mut args = set_command(key, value, expiration);
        args.push("NX".to_owned());
        // SET .. NX replies "OK" on write and null when the key already exists
        Ok(!self.command(args).await?.is_null())
    }

    async fn delete(&self, key: &Key) -> Result<(), StoreError> {
        self.command(vec!["DEL".into(), key.to_string()]).await?;
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &Key, ttl: Duration) -> Result<i64, StoreError> {
        let key = key.to_string();
        let replies = self
            .transaction(vec![
                vec![
                    "SET".into(),
                    key.clone(),
                    "0".into(),
                    "EX".into(),
                    seconds(ttl),
                    "NX".into(),
                ],
                vec!["INCR".into(), key],
            ])
            .await?;
        match replies.into_iter().nth(1) {
            Some(value) => integer(value),
            None => Err(StoreError::UnexpectedReply("missing INCR reply".into())),
        }
    }

    async fn hget(&self, key: &Key, field: &str) -> Result<Option<String>, StoreError> {
        optional_text(
            self.command(vec!["HGET".into(), key.to_string(), field.to_owned()])
                .await?,
        )
    }

    async fn hget_all(&self, key: &Key) -> Result<HashMap<String, String>, StoreError> {
        let value = self.command(vec!["HGETALL".into(), key.to_string()]).await?;
        let items = match value {
            Value::Null => return Ok(HashMap::new()),
            Value::Array(items) => items,
            other => return Err(StoreError::UnexpectedReply(other.to_string())),
        };
        // flat [field, value, field, value, ...]
        let mut fields = HashMap::with_capacity(items.len() / 2);
        let mut items = items.into_iter();
        while let (Some(field), Some(value)) = (items.next(), items.next()) {
            match (field, value) {
                (Value::String(field), Value::String(value)) => {
                    fields.insert(field, value);
                }
                (field, value) => {
                    return Err(StoreError::UnexpectedReply(format!("{field}: {value}")));
                }
            }
        }
        Ok(fields)
    }

    async fn hset(&self, key: &Key, field: &str, value: &str) -> Result<(), StoreError> {
        self.command(vec![
            "HSET".into(),
            key.to_string(),
            field.to_owned(),
            value.to_owned(),
        ])
        .await?;
        Ok(())
    }

    async fn hdel(&self, key: &Key, field: &str) -> Result<(), StoreError> {
        self.command(vec!["HDEL".into(), key.to_string(), field.to_owned()])
            .await?;
        Ok(())
    }
}
