//! Cached GitHub credentials with lazy refresh.
//!
//! Two kinds live in the store: delegated (OAuth user) tokens under
//! `oauth:<login>` and installation tokens under `installation:<id>`. A
//! refreshed or freshly minted token is always written back before it is
//! handed out, and an expired token is never handed out.
//!
//! Refreshes for the same key are coalesced within this process. Separate
//! processes sharing one store can still refresh the same key concurrently;
//! both write and the last write wins, at the cost of one wasted remote call.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{Cache, Expiration, Key, StoreError};
use crate::services::github_service::GitHubError;

pub mod models;

pub use models::{
    DelegatedCredential, INSTALLATION_TOKEN_LIFETIME, InstallationCredential, RefreshedToken,
};

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("no delegated credential cached for {0}")]
    CacheMiss(String),
    #[error("delegated credential for {0} expired and carries no refresh token")]
    NotRenewable(String),
    #[error("refreshing the delegated credential for {login} failed: {source}")]
    RefreshFailed {
        login: String,
        #[source]
        source: GitHubError,
    },
    #[error("minting a token for installation {installation_id} failed: {source}")]
    MintFailed {
        installation_id: i64,
        #[source]
        source: GitHubError,
    },
    #[error("credential store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl CredentialError {
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, CredentialError::CacheMiss(_))
    }
}

/// Exchanges refresh material for a new delegated credential.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, GitHubError>;
}

/// Mints an installation token from app-level signing material.
#[async_trait]
pub trait InstallationMinter: Send + Sync {
    async fn mint(&self, installation_id: i64) -> Result<String, GitHubError>;
}

pub struct CredentialCache {
    cache: Cache,
    refresher: Arc<dyn TokenRefresher>,
    minter: Arc<dyn InstallationMinter>,
    in_flight: DashMap<Key, Arc<Mutex<()>>>,
}

impl CredentialCache {
    pub fn new(
        cache: Cache,
        refresher: Arc<dyn TokenRefresher>,
        minter: Arc<dyn InstallationMinter>,
    ) -> Self {
        Self {
            cache,
            refresher,
            minter,
            in_flight: DashMap::new(),
        }
    }

    /// Returns a usable access token for `login`, refreshing it when expired.
    ///
    /// A login with no stored credential is [`CredentialError::CacheMiss`]: a
    /// delegated token only ever comes from a prior OAuth exchange.
    pub async fn get_delegated_token(&self, login: &str) -> Result<String, CredentialError> {
        let key = delegated_key(login);
        let credential = self.load_delegated(&key, login).await?;
        if credential.is_valid(self.cache.now()) {
            return Ok(credential.access_token);
        }

        let flight = self.flight(&key);
        let result = {
            let _guard = flight.lock().await;
            // another task may have refreshed while we waited
            match self.load_delegated(&key, login).await {
                Ok(credential) if credential.is_valid(self.cache.now()) => {
                    Ok(credential.access_token)
                }
                Ok(credential) => self.refresh_delegated(&key, login, &credential).await,
                Err(err) => Err(err),
            }
        };
        drop(flight);
        self.land(&key);
        result
    }

    pub async fn save_delegated_token(
        &self,
        login: &str,
        credential: &DelegatedCredential,
    ) -> Result<(), CredentialError> {
        self.cache
            .set(&delegated_key(login), credential, Expiration::Never)
            .await?;
        Ok(())
    }

    /// Returns a token for the installation, minting one when none is cached or
    /// the cached one has expired.
    pub async fn get_installation_token(
        &self,
        installation_id: i64,
    ) -> Result<String, CredentialError> {
        let key = installation_key(installation_id);
        if let Some(token) = self.cached_installation(&key).await? {
            return Ok(token);
        }

        let flight = self.flight(&key);
        let result = {
            let _guard = flight.lock().await;
            match self.cached_installation(&key).await {
                Ok(Some(token)) => Ok(token),
                Ok(None) => self.mint_installation(&key, installation_id).await,
                Err(err) => Err(err),
            }
        };
        drop(flight);
        self.land(&key);
        result
    }

    async fn load_delegated(
        &self,
        key: &Key,
        login: &str,
    ) -> Result<DelegatedCredential, CredentialError> {
        self.cache
            .get::<DelegatedCredential>(key)
            .await?
            .ok_or_else(|| CredentialError::CacheMiss(login.to_owned()))
    }

    async fn refresh_delegated(
        &self,
        key: &Key,
        login: &str,
        stale: &DelegatedCredential,
    ) -> Result<String, CredentialError> {
        let refresh_token = stale
            .refresh_token()
            .ok_or_else(|| CredentialError::NotRenewable(login.to_owned()))?;

        debug!(login, "Refreshing delegated credential.");
        let refreshed = self.refresher.refresh(refresh_token).await.map_err(|source| {
            warn!(login, error = %source, "Delegated credential refresh failed.");
            CredentialError::RefreshFailed {
                login: login.to_owned(),
                source,
            }
        })?;
        let mut fresh = refreshed.into_credential(self.cache.now());
        // GitHub may omit the refresh token when it is not rotated
        if fresh.refresh_token().is_none() {
            fresh.refresh_token = stale.refresh_token.clone();
        }

        self.cache.set(key, &fresh, Expiration::Never).await?;
        info!(login, "Delegated credential refreshed.");
        Ok(fresh.access_token)
    }

    async fn cached_installation(&self, key: &Key) -> Result<Option<String>, CredentialError> {
        let cached = self.cache.get::<InstallationCredential>(key).await?;
        Ok(cached
            .filter(|credential| credential.is_valid(self.cache.now()))
            .map(|credential| credential.token))
    }

    async fn mint_installation(
        &self,
        key: &Key,
        installation_id: i64,
    ) -> Result<String, CredentialError> {
        debug!(installation_id, "Minting installation token.");
        let token = self
            .minter
            .mint(installation_id)
            .await
            .map_err(|source| {
                warn!(installation_id, error = %source, "Installation token mint failed.");
                CredentialError::MintFailed {
                    installation_id,
                    source,
                }
            })?;

        let credential = InstallationCredential {
            token,
            expires_at: self.cache.now().timestamp() + INSTALLATION_TOKEN_LIFETIME.as_secs() as i64,
            installation_id,
        };
        self.cache.set(key, &credential, Expiration::Never).await?;
        info!(installation_id, expires_at = credential.expires_at, "Installation token minted.");
        Ok(credential.token)
    }

    fn flight(&self, key: &Key) -> Arc<Mutex<()>> {
        self.in_flight.entry(key.clone()).or_default().clone()
    }

    /// Forgets the per-key lock once no other task holds or awaits it.
    fn land(&self, key: &Key) {
        self.in_flight
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn delegated_key(login: &str) -> Key {
    Key::new(["oauth", login])
}

fn installation_key(installation_id: i64) -> Key {
    Key::new(["installation", &installation_id.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Clock, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeDelta;

    struct CountingMinter {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingMinter {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0), fail: false }
        }

        fn failing() -> Self {
            Self { calls: AtomicUsize::new(0), fail: true }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InstallationMinter for CountingMinter {
        async fn mint(&self, installation_id: i64) -> Result<String, GitHubError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail {
                return Err(GitHubError::Status {
                    status: reqwest::StatusCode::UNAUTHORIZED,
                    body: "bad jwt".into(),
                });
            }
            Ok(format!("ghs_{installation_id}_{n}"))
        }
    }

    struct StubRefresher {
        calls: AtomicUsize,
        reply: Option<RefreshedToken>,
    }

    #[async_trait]
    impl TokenRefresher for StubRefresher {
        async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, GitHubError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(refresh_token, "ghr_old");
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.reply.clone().ok_or_else(|| GitHubError::OAuth {
                error: "bad_refresh_token".into(),
                description: "The refresh token passed is incorrect or expired.".into(),
            })
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        cache: Cache,
        minter: Arc<CountingMinter>,
        refresher: Arc<StubRefresher>,
        credentials: CredentialCache,
    }

    fn fixture(minter: CountingMinter, reply: Option<RefreshedToken>) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = Cache::in_memory(clock.clone());
        let minter = Arc::new(minter);
        let refresher = Arc::new(StubRefresher { calls: AtomicUsize::new(0), reply });
        let credentials = CredentialCache::new(cache.clone(), refresher.clone(), minter.clone());
        Fixture { clock, cache, minter, refresher, credentials }
    }

    fn expiring_credential(fix: &Fixture, access: &str, in_secs: i64) -> DelegatedCredential {
        DelegatedCredential {
            access_token: access.into(),
            token_type: "bearer".into(),
            refresh_token: Some("ghr_old".into()),
            expiry: Some(fix.clock.now() + TimeDelta::seconds(in_secs)),
        }
    }

    #[tokio::test]
    async fn fresh_store_is_a_cache_miss_not_an_empty_token() {
        let fix = fixture(CountingMinter::new(), None);
        let err = fix.credentials.get_delegated_token("alice").await.unwrap_err();
        assert!(err.is_cache_miss());
        assert_eq!(fix.refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_delegated_token_is_served_from_cache() {
        let fix = fixture(CountingMinter::new(), None);
        let credential = expiring_credential(&fix, "gho_live", 3600);
        fix.credentials.save_delegated_token("alice", &credential).await.unwrap();

        let token = fix.credentials.get_delegated_token("alice").await.unwrap();
        assert_eq!(token, "gho_live");
        assert_eq!(fix.refresher.calls.load(Ordering::SeqCst), 0);
    }

    fn refreshed(access: &str, expires_in: Option<Duration>) -> RefreshedToken {
        RefreshedToken {
            access_token: access.into(),
            token_type: "bearer".into(),
            refresh_token: None,
            expires_in,
        }
    }

    #[tokio::test]
    async fn expired_delegated_token_is_refreshed_and_persisted() {
        let reply = refreshed("gho_new", Some(Duration::from_secs(8 * 3600)));
        let fix = fixture(CountingMinter::new(), Some(reply));
        let stale = expiring_credential(&fix, "gho_old", -1);
        fix.credentials.save_delegated_token("alice", &stale).await.unwrap();

        let token = fix.credentials.get_delegated_token("alice").await.unwrap();
        assert_eq!(token, "gho_new");

        let stored: DelegatedCredential = fix
            .cache
            .get(&Key::new(["oauth", "alice"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.access_token, "gho_new");
        // the unrotated refresh token is kept
        assert_eq!(stored.refresh_token.as_deref(), Some("ghr_old"));
        assert_eq!(stored.expiry, Some(fix.clock.now() + TimeDelta::hours(8)));
    }

    #[tokio::test]
    async fn concurrent_refreshes_for_one_login_coalesce() {
        let fix = fixture(CountingMinter::new(), Some(refreshed("gho_new", None)));
        let stale = expiring_credential(&fix, "gho_old", -1);
        fix.credentials.save_delegated_token("alice", &stale).await.unwrap();

        let (a, b, c) = tokio::join!(
            fix.credentials.get_delegated_token("alice"),
            fix.credentials.get_delegated_token("alice"),
            fix.credentials.get_delegated_token("alice"),
        );
        assert_eq!(a.unwrap(), "gho_new");
        assert_eq!(b.unwrap(), "gho_new");
        assert_eq!(c.unwrap(), "gho_new");
        assert_eq!(fix.refresher.calls.load(Ordering::SeqCst), 1);
        assert!(fix.credentials.in_flight.is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_never_returns_the_stale_token() {
        let fix = fixture(CountingMinter::new(), None);
        let stale = expiring_credential(&fix, "gho_old", -1);
        fix.credentials.save_delegated_token("alice", &stale).await.unwrap();

        let err = fix.credentials.get_delegated_token("alice").await.unwrap_err();
        assert!(matches!(err, CredentialError::RefreshFailed { .. }));
    }

    #[tokio::test]
    async fn expired_token_without_refresh_material_is_not_renewable() {
        let fix = fixture(CountingMinter::new(), None);
        let mut stale = expiring_credential(&fix, "gho_old", -1);
        stale.refresh_token = None;
        fix.credentials.save_delegated_token("alice", &stale).await.unwrap();

        let err = fix.credentials.get_delegated_token("alice").await.unwrap_err();
        assert!(matches!(err, CredentialError::NotRenewable(login) if login == "alice"));
        assert_eq!(fix.refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn installation_token_is_reused_within_the_hour() {
        let fix = fixture(CountingMinter::new(), None);

        let first = fix.credentials.get_installation_token(42).await.unwrap();
        fix.clock.advance(Duration::from_secs(59 * 60));
        let second = fix.credentials.get_installation_token(42).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fix.minter.calls(), 1);
    }

    #[tokio::test]
    async fn installation_token_is_reminted_after_the_hour_and_cached_first() {
        let fix = fixture(CountingMinter::new(), None);
        let first = fix.credentials.get_installation_token(42).await.unwrap();

        fix.clock.advance(INSTALLATION_TOKEN_LIFETIME);
        let second = fix.credentials.get_installation_token(42).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(fix.minter.calls(), 2);

        let stored: InstallationCredential = fix
            .cache
            .get(&Key::new(["installation", "42"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.token, second);
        assert_eq!(
            stored.expires_at,
            fix.clock.now().timestamp() + INSTALLATION_TOKEN_LIFETIME.as_secs() as i64
        );
    }

    #[tokio::test]
    async fn concurrent_mints_for_one_installation_coalesce() {
        let fix = fixture(CountingMinter::new(), None);
        let (a, b, c) = tokio::join!(
            fix.credentials.get_installation_token(7),
            fix.credentials.get_installation_token(7),
            fix.credentials.get_installation_token(7),
        );
        let a = a.unwrap();
        assert_eq!(a, b.unwrap());
        assert_eq!(a, c.unwrap());
        assert_eq!(fix.minter.calls(), 1);
        assert!(fix.credentials.in_flight.is_empty());
    }

    #[tokio::test]
    async fn mint_failure_is_propagated_and_nothing_is_cached() {
        let fix = fixture(CountingMinter::failing(), None);
        let err = fix.credentials.get_installation_token(9).await.unwrap_err();
        assert!(matches!(err, CredentialError::MintFailed { installation_id: 9, .. }));
        assert!(
            fix.cache
                .get::<InstallationCredential>(&Key::new(["installation", "9"]))
                .await
                .unwrap()
                .is_none()
        );
    }
}
