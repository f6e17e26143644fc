use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::cache::{Cache, Key, StoreError};
use crate::notifications::models::{NotifierConfig, Setting};
use crate::notifications::senders::{ResolveError, resolve_all};
use crate::notifications::service::{DispatchError, DispatchReport, Dispatcher};
use crate::services::installation_service::{InstallationError, InstallationService};

/// Upper bound on notifiers per (account, login), checked when settings are written.
pub const MAX_NOTIFIERS: usize = 10;

pub const TEST_TITLE: &str = "test";
pub const TEST_MESSAGE: &str = "this is a test message";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("at most {MAX_NOTIFIERS} notifiers are allowed, got {0}")]
    TooMany(usize),
    #[error("invalid notifier {0}")]
    Invalid(#[from] ResolveError),
    #[error(transparent)]
    Installation(#[from] InstallationError),
    #[error("settings store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Per-account notification settings, one entry per member login.
pub struct SettingsService {
    cache: Cache,
    installations: Arc<InstallationService>,
    dispatcher: Arc<Dispatcher>,
}

impl SettingsService {
    pub fn new(cache: Cache, installations: Arc<InstallationService>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            cache,
            installations,
            dispatcher,
        }
    }

    pub async fn get(&self, account: &str, login: &str) -> Result<Option<Setting>, SettingsError> {
        Ok(self.cache.hget(&settings_key(account), login).await?)
    }

    /// Every member's setting for the account, keyed by login.
    pub async fn all(&self, account: &str) -> Result<HashMap<String, Setting>, SettingsError> {
        Ok(self.cache.hget_all(&settings_key(account)).await?)
    }

    /// Validates and stores `login`'s setting for `account`. Nothing is sent.
    pub async fn save(&self, account: &str, login: &str, setting: &Setting) -> Result<(), SettingsError> {
        self.installations.ensure_associated(login, account).await?;
        self.validate(&setting.notify_settings)?;
        self.cache.hset(&settings_key(account), login, setting).await?;
        info!(
            account,
            login,
            notifiers = setting.notify_settings.len(),
            "Notification settings saved."
        );
        Ok(())
    }

    pub async fn delete(&self, account: &str, login: &str) -> Result<(), SettingsError> {
        self.cache.hdel(&settings_key(account), login).await?;
        info!(account, login, "Notification settings deleted.");
        Ok(())
    }

    pub fn validate(&self, configs: &[NotifierConfig]) -> Result<(), SettingsError> {
        if configs.len() > MAX_NOTIFIERS {
            return Err(SettingsError::TooMany(configs.len()));
        }
        resolve_all(configs, self.dispatcher.registry())?;
        Ok(())
    }

    /// Sends a fixed test notification through the given, not yet saved, notifiers.
    pub async fn send_test(&self, configs: &[NotifierConfig]) -> Result<DispatchReport, SettingsError> {
        if configs.len() > MAX_NOTIFIERS {
            return Err(SettingsError::TooMany(configs.len()));
        }
        Ok(self.dispatcher.dispatch(TEST_TITLE, TEST_MESSAGE, configs).await?)
    }
}

fn settings_key(account: &str) -> Key {
    Key::new(["settings", account])
}
