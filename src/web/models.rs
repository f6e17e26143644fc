use serde::{Deserialize, Serialize};

use crate::notifications::models::NotifierConfig;
use crate::services::github_service::Installation;

/// The signed-in GitHub user, put into request extensions by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub login: String,
}

#[derive(Debug, Serialize)]
pub struct InstallationView {
    pub id: i64,
    pub account: String,
    pub account_type: String,
}

impl From<Installation> for InstallationView {
    fn from(installation: Installation) -> Self {
        Self {
            id: installation.id,
            account: installation.account.login,
            account_type: installation.account.account_type,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TestNotificationRequest {
    pub notify_settings: Vec<NotifierConfig>,
}

#[derive(Debug, Serialize)]
pub struct DeliveryResponse {
    pub delivered: Vec<String>,
}
