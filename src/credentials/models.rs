use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Installation tokens are valid for one hour from minting.
pub const INSTALLATION_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// A delegated token is treated as expired this long before its recorded expiry.
const EXPIRY_DELTA_SECS: i64 = 10;

/// An OAuth user-to-server token, renewable through its refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedCredential {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absent when the issuing exchange attached no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl DelegatedCredential {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expiry {
            Some(expiry) => expiry - TimeDelta::seconds(EXPIRY_DELTA_SECS) > now,
            None => true,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|token| !token.is_empty())
    }
}

/// What a refresh exchange returns. The lifetime is relative; the caller stamps
/// it against its own clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
}

impl RefreshedToken {
    pub fn into_credential(self, now: DateTime<Utc>) -> DelegatedCredential {
        let expiry = self
            .expires_in
            .and_then(|ttl| TimeDelta::from_std(ttl).ok())
            .and_then(|delta| now.checked_add_signed(delta));
        DelegatedCredential {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token,
            expiry,
        }
    }
}

/// A token scoped to one app installation. `expires_at` (unix seconds) is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationCredential {
    pub token: String,
    pub expires_at: i64,
    pub installation_id: i64,
}

impl InstallationCredential {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now.timestamp()
    }
}
