use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{InstallationMinter, RefreshedToken, TokenRefresher};
use crate::version::USER_AGENT;

pub const GITHUB_API_URL: &str = "https://api.github.com";
pub const GITHUB_WEB_URL: &str = "https://github.com";

const ACCEPT_GITHUB_JSON: &str = "application/vnd.github+json";
const INSTALLATIONS_PER_PAGE: usize = 100;
const REPOS_PER_PAGE: usize = 30;

#[derive(Error, Debug)]
pub enum GitHubError {
    #[error("GitHub request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("GitHub returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("GitHub OAuth error {error}: {description}")]
    OAuth { error: String, description: String },
    #[error("invalid GitHub App private key: {0}")]
    InvalidKey(String),
    #[error("signing the GitHub App JWT failed: {0}")]
    Signing(String),
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, GitHubError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    Err(GitHubError::Status { status, body })
}

// --- OAuth refresh ---

/// Renews delegated credentials against GitHub's OAuth token endpoint.
pub struct GitHubOAuth {
    http: Client,
    web_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenReply {
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl GitHubOAuth {
    pub fn new(http: Client, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            http,
            web_url: GITHUB_WEB_URL.to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn with_web_url(mut self, web_url: impl Into<String>) -> Self {
        self.web_url = web_url.into();
        self
    }
}

#[async_trait]
impl TokenRefresher for GitHubOAuth {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, GitHubError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let response = self
            .http
            .post(format!("{}/login/oauth/access_token", self.web_url))
            .form(&params)
            .header(header::ACCEPT, "application/json")
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;
        let reply: TokenReply = ensure_success(response).await?.json().await?;

        // GitHub reports refresh failures with a 200 and an `error` field
        if let Some(error) = reply.error {
            return Err(GitHubError::OAuth {
                error,
                description: reply.error_description.unwrap_or_default(),
            });
        }
        let access_token = reply.access_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            GitHubError::OAuth {
                error: "missing_access_token".to_string(),
                description: "token response carried no access_token".to_string(),
            }
        })?;

        Ok(RefreshedToken {
            access_token,
            token_type: reply.token_type.unwrap_or_else(|| "bearer".to_string()),
            refresh_token: reply.refresh_token,
            expires_in: reply
                .expires_in
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        })
    }
}

// --- App installation tokens ---

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct AccessTokenReply {
    token: String,
}

/// Authenticates as the GitHub App and mints installation tokens.
pub struct GitHubApp {
    http: Client,
    api_url: String,
    app_id: i64,
    key: EncodingKey,
}

impl GitHubApp {
    pub fn new(http: Client, app_id: i64, private_key_pem: &str) -> Result<Self, GitHubError> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| GitHubError::InvalidKey(e.to_string()))?;
        Ok(Self {
            http,
            api_url: GITHUB_API_URL.to_string(),
            app_id,
            key,
        })
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// A short-lived RS256 JWT identifying the app. Backdated a minute for clock drift;
    /// GitHub caps the lifetime at ten minutes.
    fn app_jwt(&self) -> Result<String, GitHubError> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 9 * 60,
            iss: self.app_id.to_string(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| GitHubError::Signing(e.to_string()))
    }
}

#[async_trait]
impl InstallationMinter for GitHubApp {
    async fn mint(&self, installation_id: i64) -> Result<String, GitHubError> {
        let jwt = self.app_jwt()?;
        let response = self
            .http
            .post(format!(
                "{}/app/installations/{installation_id}/access_tokens",
                self.api_url
            ))
            .bearer_auth(jwt)
            .header(header::ACCEPT, ACCEPT_GITHUB_JSON)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;
        let reply: AccessTokenReply = ensure_success(response).await?.json().await?;
        Ok(reply.token)
    }
}

// --- Token-authenticated reads ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
    #[serde(rename = "type", default)]
    pub account_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub id: i64,
    pub account: Account,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fork: bool,
}

#[derive(Deserialize)]
struct InstallationsPage {
    installations: Vec<Installation>,
}

#[derive(Deserialize)]
struct RepositoriesPage {
    repositories: Vec<Repository>,
}

#[derive(Clone)]
pub struct GitHubApi {
    http: Client,
    api_url: String,
}

impl GitHubApi {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            api_url: GITHUB_API_URL.to_string(),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// All installations of the app the user can access, following pagination.
    pub async fn user_installations(
        &self,
        user_token: &str,
    ) -> Result<Vec<Installation>, GitHubError> {
        let mut installations = Vec::new();
        let mut page = 1usize;
        loop {
            let response = self
                .http
                .get(format!("{}/user/installations", self.api_url))
                .query(&[
                    ("per_page", INSTALLATIONS_PER_PAGE.to_string()),
                    ("page", page.to_string()),
                ])
                .bearer_auth(user_token)
                .header(header::ACCEPT, ACCEPT_GITHUB_JSON)
                .header(header::USER_AGENT, USER_AGENT)
                .send()
                .await?;
            let batch: InstallationsPage = ensure_success(response).await?.json().await?;
            let fetched = batch.installations.len();
            installations.extend(batch.installations);
            if fetched < INSTALLATIONS_PER_PAGE {
                return Ok(installations);
            }
            page += 1;
        }
    }

    /// One page of repositories the installation token can see.
    pub async fn installation_repos(
        &self,
        installation_token: &str,
        page: u32,
    ) -> Result<Vec<Repository>, GitHubError> {
        let response = self
            .http
            .get(format!("{}/installation/repositories", self.api_url))
            .query(&[
                ("per_page", REPOS_PER_PAGE.to_string()),
                ("page", page.max(1).to_string()),
            ])
            .bearer_auth(installation_token)
            .header(header::ACCEPT, ACCEPT_GITHUB_JSON)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;
        let batch: RepositoriesPage = ensure_success(response).await?.json().await?;
        Ok(batch.repositories)
    }
}
