use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One configured notification channel: an untyped string map whose reserved
/// `service` key selects the backend. Everything else is backend-specific.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotifierConfig(BTreeMap<String, String>);

impl NotifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn service(&self) -> Option<&str> {
        self.non_empty("service")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The value for `key`, treating blank strings as absent.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|value| !value.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for NotifierConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// What one login wants done with events from one account's repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    #[serde(default)]
    pub notify_settings: Vec<NotifierConfig>,
    #[serde(default)]
    pub allow_repos: Vec<String>,
    #[serde(default)]
    pub mute_repos: Vec<String>,
}

impl Setting {
    /// Muted repositories always lose; an empty allow list admits everything else.
    pub fn is_allow_repo(&self, full_name: &str) -> bool {
        if self.mute_repos.iter().any(|repo| repo == full_name) {
            return false;
        }
        self.allow_repos.is_empty() || self.allow_repos.iter().any(|repo| repo == full_name)
    }
}
