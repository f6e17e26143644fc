use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{Cache, Expiration, Key, StoreError};
use crate::credentials::{CredentialCache, CredentialError};
use crate::services::github_service::{GitHubApi, GitHubError, Installation, Repository};

/// How long the list of accounts a login can configure is trusted.
pub const ACCOUNTS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum InstallationError {
    #[error("app not installed to {account}, or you have no permission")]
    NotAssociated { account: String },
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("GitHub error: {0}")]
    GitHub(#[from] GitHubError),
    #[error("installation store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Which app installations a login can see, and what is inside them.
pub struct InstallationService {
    cache: Cache,
    credentials: Arc<CredentialCache>,
    github: GitHubApi,
}

impl InstallationService {
    pub fn new(cache: Cache, credentials: Arc<CredentialCache>, github: GitHubApi) -> Self {
        Self {
            cache,
            credentials,
            github,
        }
    }

    /// Lists the installations through the login's delegated token and
    /// refreshes the cached account list as a side effect.
    pub async fn installations(&self, login: &str) -> Result<Vec<Installation>, InstallationError> {
        let installations = self.fetch(login).await?;
        let accounts = account_logins(&installations);
        if let Err(e) = self
            .cache
            .set(&accounts_key(login), &accounts, Expiration::After(ACCOUNTS_TTL))
            .await
        {
            warn!(login, error = %e, "Failed to cache installation accounts.");
        }
        Ok(installations)
    }

    /// Account logins the app is installed on and `login` can access. Cached for a day.
    pub async fn accounts(&self, login: &str) -> Result<Vec<String>, InstallationError> {
        self.cache
            .get_or_create(&accounts_key(login), Expiration::After(ACCOUNTS_TTL), || async {
                let installations = self.fetch(login).await?;
                Ok::<_, InstallationError>(account_logins(&installations))
            })
            .await
    }

    pub async fn ensure_associated(&self, login: &str, account: &str) -> Result<(), InstallationError> {
        let accounts = self.accounts(login).await?;
        if accounts.iter().any(|a| a == account) {
            return Ok(());
        }
        debug!(login, account, "Account is not among the login's installations.");
        Err(InstallationError::NotAssociated {
            account: account.to_owned(),
        })
    }

    pub async fn repos(&self, installation_id: i64, page: u32) -> Result<Vec<Repository>, InstallationError> {
        let token = self.credentials.get_installation_token(installation_id).await?;
        Ok(self.github.installation_repos(&token, page).await?)
    }

    async fn fetch(&self, login: &str) -> Result<Vec<Installation>, InstallationError> {
        let token = self.credentials.get_delegated_token(login).await?;
        Ok(self.github.user_installations(&token).await?)
    }
}

fn account_logins(installations: &[Installation]) -> Vec<String> {
    installations
        .iter()
        .map(|installation| installation.account.login.clone())
        .collect()
}

fn accounts_key(login: &str) -> Key {
    Key::new(["installations", login])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::credentials::{DelegatedCredential, InstallationMinter, RefreshedToken, TokenRefresher};
    use async_trait::async_trait;
    use httpmock::prelude::*;
    use reqwest::Client;
    use serde_json::json;

    pub(crate) struct FixedMinter;

    #[async_trait]
    impl InstallationMinter for FixedMinter {
        async fn mint(&self, installation_id: i64) -> Result<String, GitHubError> {
            Ok(format!("ghs_{installation_id}"))
        }
    }

    pub(crate) struct NoRefresh;

    #[async_trait]
    impl TokenRefresher for NoRefresh {
        async fn refresh(&self, _: &str) -> Result<RefreshedToken, GitHubError> {
            Err(GitHubError::OAuth {
                error: "unsupported".into(),
                description: "not in tests".into(),
            })
        }
    }

    /// A service whose GitHub calls go to `api_url` and where `alice` is signed in.
    pub(crate) async fn signed_in_service(api_url: String) -> (Cache, InstallationService) {
        let cache = Cache::in_memory(Arc::new(ManualClock::starting_now()));
        let credentials = Arc::new(CredentialCache::new(
            cache.clone(),
            Arc::new(NoRefresh),
            Arc::new(FixedMinter),
        ));
        credentials
            .save_delegated_token(
                "alice",
                &DelegatedCredential {
                    access_token: "gho_alice".into(),
                    token_type: "bearer".into(),
                    refresh_token: None,
                    expiry: None,
                },
            )
            .await
            .unwrap();
        let github = GitHubApi::new(Client::new()).with_api_url(api_url);
        (cache.clone(), InstallationService::new(cache, credentials, github))
    }

    async fn mock_installations(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/user/installations")
                    .header("authorization", "Bearer gho_alice");
                then.status(200).json_body(json!({
                    "total_count": 2,
                    "installations": [
                        { "id": 1, "account": { "login": "alice", "type": "User" } },
                        { "id": 2, "account": { "login": "acme", "type": "Organization" } }
                    ]
                }));
            })
            .await
    }

    #[tokio::test]
    async fn accounts_are_fetched_once_then_cached() {
        let server = MockServer::start_async().await;
        let mock = mock_installations(&server).await;
        let (_, service) = signed_in_service(server.base_url()).await;

        assert_eq!(service.accounts("alice").await.unwrap(), vec!["alice", "acme"]);
        assert_eq!(service.accounts("alice").await.unwrap(), vec!["alice", "acme"]);
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn association_is_checked_against_installation_accounts() {
        let server = MockServer::start_async().await;
        mock_installations(&server).await;
        let (_, service) = signed_in_service(server.base_url()).await;

        service.ensure_associated("alice", "acme").await.unwrap();
        let err = service.ensure_associated("alice", "evil-corp").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "app not installed to evil-corp, or you have no permission"
        );
    }

    #[tokio::test]
    async fn unknown_login_surfaces_the_cache_miss() {
        let server = MockServer::start_async().await;
        let (_, service) = signed_in_service(server.base_url()).await;
        let err = service.accounts("mallory").await.unwrap_err();
        assert!(matches!(err, InstallationError::Credential(e) if e.is_cache_miss()));
    }

    #[tokio::test]
    async fn repos_use_the_installation_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/installation/repositories")
                    .header("authorization", "Bearer ghs_2");
                then.status(200).json_body(json!({
                    "total_count": 1,
                    "repositories": [{ "id": 9, "full_name": "acme/widget", "fork": false }]
                }));
            })
            .await;
        let (_, service) = signed_in_service(server.base_url()).await;

        let repos = service.repos(2, 1).await.unwrap();
        assert_eq!(repos[0].full_name, "acme/widget");
        mock.assert_async().await;
    }
}
