use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::notifications::service::{DEFAULT_DISPATCH_TIMEOUT, DEFAULT_MAX_IN_FLIGHT, DispatchOptions};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_TELEGRAM_BOT_USERNAME: &str = "gh_stargazer_bot";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const TELEGRAM_WEBHOOK_PATH: &str = "/api/webhook/telegram";

#[derive(Error, Debug)]
pub enum ServerConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("{0} must be set")]
    Missing(String),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub base_url: String,
    pub secret_key: String,
    pub github_app_id: i64,
    pub github_app_private_key: String,
    pub github_client_id: String,
    pub github_client_secret: String,
    pub kv_url: Option<String>,
    pub kv_token: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_bot_username: String,
    pub discord_bot_token: Option<String>,
    pub discord_app_id: Option<String>,
    pub log_dir: String,
    pub dispatch_timeout_secs: u64,
    pub dispatch_max_in_flight: usize,
}

impl ServerConfig {
    /// Loads `.env`, then the optional TOML file, then lets environment
    /// variables (the upper-cased field name) override the file.
    pub fn load(path: Option<&str>) -> Result<Self, ServerConfigError> {
        dotenv::dotenv().ok();
        let file = match path {
            Some(path) => read_file(path)?,
            None => toml::Table::new(),
        };
        Self::from_sources(&Sources {
            file,
            env: |name: &str| env::var(name).ok(),
        })
    }

    fn from_sources<E: Fn(&str) -> Option<String>>(sources: &Sources<E>) -> Result<Self, ServerConfigError> {
        Ok(ServerConfig {
            bind_addr: sources.value("bind_addr").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            base_url: sources.required("base_url")?,
            secret_key: sources.required("secret_key")?,
            github_app_id: sources.parsed("github_app_id")?.ok_or_else(|| missing("github_app_id"))?,
            github_app_private_key: sources.required("github_app_private_key")?,
            github_client_id: sources.required("github_client_id")?,
            github_client_secret: sources.required("github_client_secret")?,
            kv_url: sources.value("kv_url"),
            kv_token: sources.value("kv_token"),
            telegram_bot_token: sources.value("telegram_bot_token"),
            telegram_bot_username: sources
                .value("telegram_bot_username")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_BOT_USERNAME.to_string()),
            discord_bot_token: sources.value("discord_bot_token"),
            discord_app_id: sources.value("discord_app_id"),
            log_dir: sources.value("log_dir").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
            dispatch_timeout_secs: sources
                .parsed("dispatch_timeout_secs")?
                .unwrap_or(DEFAULT_DISPATCH_TIMEOUT.as_secs()),
            dispatch_max_in_flight: sources
                .parsed("dispatch_max_in_flight")?
                .unwrap_or(DEFAULT_MAX_IN_FLIGHT),
        })
    }

    /// Where Telegram delivers bot updates for this deployment.
    pub fn telegram_webhook_url(&self) -> String {
        format!("{}{TELEGRAM_WEBHOOK_PATH}", self.base_url.trim_end_matches('/'))
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            timeout: Duration::from_secs(self.dispatch_timeout_secs),
            max_in_flight: self.dispatch_max_in_flight,
        }
    }
}

fn read_file(path: &str) -> Result<toml::Table, ServerConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ServerConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    raw.parse::<toml::Table>().map_err(|source| ServerConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

fn missing(name: &str) -> ServerConfigError {
    ServerConfigError::Missing(name.to_uppercase())
}

struct Sources<E> {
    file: toml::Table,
    env: E,
}

impl<E: Fn(&str) -> Option<String>> Sources<E> {
    /// The environment wins over the file. Blank values count as unset.
    fn value(&self, name: &str) -> Option<String> {
        let from_env = (self.env)(&name.to_uppercase());
        let from_file = || match self.file.get(name)? {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        };
        from_env
            .filter(|value| !value.trim().is_empty())
            .or_else(from_file)
            .filter(|value| !value.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ServerConfigError> {
        self.value(name).ok_or_else(|| missing(name))
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>, ServerConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.value(name)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| ServerConfigError::Invalid {
                    name: name.to_uppercase(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}
