//! Key-value storage shared by the credential cache, connect tokens and settings.
//!
//! Every key lives under the [`KEY_PREFIX`] namespace and carries at least two
//! segments (`<category>:<id...>`). Single-key operations are atomic in the
//! backing store; there are no multi-key transactions, so read-then-write
//! sequences built on top of this module may interleave across processes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub mod clock;
pub mod memory;
pub mod rest;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
pub use rest::RestStore;

pub const KEY_PREFIX: &str = "github_stargazer";

/// Applied by [`Expiration::Default`].
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(10 * 60);

/// A namespaced store key, rendered as `github_stargazer:<segment>:<segment>...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(String);

impl Key {
    /// Builds a key from its segments. Fewer than two segments fails to compile.
    pub fn new<const N: usize>(segments: [&str; N]) -> Self {
        const { assert!(N >= 2, "a cache key needs at least two segments") };
        let mut rendered = String::from(KEY_PREFIX);
        for segment in segments {
            rendered.push(':');
            rendered.push_str(segment);
        }
        Key(rendered)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Ten minutes.
    Default,
    Never,
    After(Duration),
}

impl Expiration {
    pub fn ttl(self) -> Option<Duration> {
        match self {
            Expiration::Default => Some(DEFAULT_EXPIRATION),
            Expiration::Never => None,
            Expiration::After(ttl) => Some(ttl),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("kv request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("kv command failed: {0}")]
    Command(String),
    #[error("kv returned an unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("{0} holds the wrong kind of value")]
    WrongType(String),
    #[error("{key} does not hold valid JSON: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The primitive operations of the remote key-value store.
///
/// An absent key is `Ok(None)` (or an empty map), never an error.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &Key) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &Key, value: &str, expiration: Expiration) -> Result<(), StoreError>;

    /// Writes only when the key does not exist yet. Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &Key,
        value: &str,
        expiration: Expiration,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, key: &Key) -> Result<(), StoreError>;

    /// Increments a counter. The TTL window starts when the counter is created;
    /// later increments do not extend it.
    async fn incr_with_ttl(&self, key: &Key, ttl: Duration) -> Result<i64, StoreError>;

    async fn hget(&self, key: &Key, field: &str) -> Result<Option<String>, StoreError>;

    async fn hget_all(&self, key: &Key) -> Result<HashMap<String, String>, StoreError>;

    async fn hset(&self, key: &Key, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hdel(&self, key: &Key, field: &str) -> Result<(), StoreError>;
}

/// JSON-typed facade over a [`KvStore`], plus the clock every TTL decision is made against.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl Cache {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// An in-process cache, used when no remote store is configured and in tests.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(MemoryStore::new(clock.clone())), clock)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &Key) -> Result<Option<T>, StoreError> {
        match self.store.get(key).await? {
            Some(raw) => decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &Key,
        value: &T,
        expiration: Expiration,
    ) -> Result<(), StoreError> {
        let raw = encode(key, value)?;
        self.store.set(key, &raw, expiration).await
    }

    pub async fn set_if_absent<T: Serialize + ?Sized>(
        &self,
        key: &Key,
        value: &T,
        expiration: Expiration,
    ) -> Result<bool, StoreError> {
        let raw = encode(key, value)?;
        self.store.set_if_absent(key, &raw, expiration).await
    }

    pub async fn delete(&self, key: &Key) -> Result<(), StoreError> {
        self.store.delete(key).await
    }

    pub async fn incr_with_ttl(&self, key: &Key, ttl: Duration) -> Result<i64, StoreError> {
        self.store.incr_with_ttl(key, ttl).await
    }

    pub async fn hget<T: DeserializeOwned>(
        &self,
        key: &Key,
        field: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.store.hget(key, field).await? {
            Some(raw) => decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn hget_all<T: DeserializeOwned>(
        &self,
        key: &Key,
    ) -> Result<HashMap<String, T>, StoreError> {
        self.store
            .hget_all(key)
            .await?
            .into_iter()
            .map(|(field, raw)| decode(key, &raw).map(|value| (field, value)))
            .collect()
    }

    pub async fn hset<T: Serialize + ?Sized>(
        &self,
        key: &Key,
        field: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = encode(key, value)?;
        self.store.hset(key, field, &raw).await
    }

    pub async fn hdel(&self, key: &Key, field: &str) -> Result<(), StoreError> {
        self.store.hdel(key, field).await
    }

    /// Returns the cached value, or runs `create` on a miss and caches its result.
    /// Store failures other than a miss are returned without calling `create`.
    pub async fn get_or_create<T, E, F, Fut>(
        &self,
        key: &Key,
        expiration: Expiration,
        create: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StoreError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let value = create().await?;
        self.set(key, &value, expiration).await?;
        Ok(value)
    }
}

fn encode<T: Serialize + ?Sized>(key: &Key, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(key: &Key, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Gadget {
        name: String,
        hits: u32,
    }

    fn cache() -> Cache {
        Cache::in_memory(Arc::new(ManualClock::starting_now()))
    }

    #[test]
    fn key_renders_prefix_and_segments() {
        let key = Key::new(["connect_token_count", "alice", "telegram"]);
        assert_eq!(key.as_str(), "github_stargazer:connect_token_count:alice:telegram");
        assert_eq!(Key::new(["oauth", "bob"]).to_string(), "github_stargazer:oauth:bob");
    }

    #[test]
    fn expiration_ttls() {
        assert_eq!(Expiration::Default.ttl(), Some(DEFAULT_EXPIRATION));
        assert_eq!(Expiration::Never.ttl(), None);
        assert_eq!(
            Expiration::After(Duration::from_secs(5)).ttl(),
            Some(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn typed_values_survive_the_store() {
        let cache = cache();
        let key = Key::new(["gadget", "1"]);
        assert!(cache.get::<Gadget>(&key).await.unwrap().is_none());

        let gadget = Gadget { name: "widget".into(), hits: 3 };
        cache.set(&key, &gadget, Expiration::Never).await.unwrap();
        assert_eq!(cache.get::<Gadget>(&key).await.unwrap(), Some(gadget));
    }

    #[tokio::test]
    async fn malformed_json_is_a_codec_error() {
        let cache = cache();
        let key = Key::new(["gadget", "broken"]);
        cache.store().set(&key, "{not json", Expiration::Never).await.unwrap();

        let err = cache.get::<Gadget>(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::Codec { .. }));
    }

    #[tokio::test]
    async fn get_or_create_only_creates_on_miss() {
        let cache = cache();
        let key = Key::new(["installations", "alice"]);

        let first: Vec<String> = cache
            .get_or_create(&key, Expiration::Default, || async {
                Ok::<_, StoreError>(vec!["acme".to_string()])
            })
            .await
            .unwrap();
        assert_eq!(first, vec!["acme"]);

        let second: Vec<String> = cache
            .get_or_create(&key, Expiration::Default, || async {
                Ok::<_, StoreError>(vec!["other".to_string()])
            })
            .await
            .unwrap();
        assert_eq!(second, vec!["acme"]);
    }

    #[tokio::test]
    async fn get_or_create_propagates_creation_errors_without_caching() {
        let cache = cache();
        let key = Key::new(["installations", "bob"]);

        let result: Result<Vec<String>, StoreError> = cache
            .get_or_create(&key, Expiration::Default, || async {
                Err(StoreError::Command("upstream down".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.store().get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hash_values_are_typed_per_field() {
        let cache = cache();
        let key = Key::new(["settings", "acme"]);
        cache.hset(&key, "alice", &Gadget { name: "a".into(), hits: 1 }).await.unwrap();
        cache.hset(&key, "bob", &Gadget { name: "b".into(), hits: 2 }).await.unwrap();

        let all: HashMap<String, Gadget> = cache.hget_all(&key).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["bob"].hits, 2);

        cache.hdel(&key, "alice").await.unwrap();
        assert!(cache.hget::<Gadget>(&key, "alice").await.unwrap().is_none());
    }
}
