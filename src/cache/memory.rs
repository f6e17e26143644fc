use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::{Clock, Expiration, Key, KvStore, StoreError};

enum Slot {
    Text(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store with Redis-like semantics. Each key is guarded by its
/// dashmap shard, so single-key operations are atomic.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Removes every entry whose TTL has passed, returning how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Sweeps on a fixed period until the store is dropped. Keys nobody reads
    /// again would otherwise stay resident past their TTL.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired in-memory entries.");
                }
            }
        })
    }

    /// Drops the key if its TTL has passed and returns the current time.
    fn purge_expired(&self, key: &Key) -> DateTime<Utc> {
        let now = self.clock.now();
        self.entries.remove_if(key.as_str(), |_, entry| !entry.is_live(now));
        now
    }
}

fn expires_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}

fn deadline(now: DateTime<Utc>, expiration: Expiration) -> Option<DateTime<Utc>> {
    expiration.ttl().and_then(|ttl| expires_after(now, ttl))
}

fn wrong_type(key: &Key) -> StoreError {
    StoreError::WrongType(key.to_string())
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &Key) -> Result<Option<String>, StoreError> {
        self.purge_expired(key);
        match self.entries.get(key.as_str()) {
            Some(entry) => match &entry.slot {
                Slot::Text(value) => Ok(Some(value.clone())),
                Slot::Hash(_) => Err(wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &Key, value: &str, expiration: Expiration) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.entries.insert(
            key.as_str().to_owned(),
            Entry {
                slot: Slot::Text(value.to_owned()),
                expires_at: deadline(now, expiration),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &Key,
        value: &str,
        expiration: Expiration,
    ) -> Result<bool, StoreError> {
        let now = self.purge_expired(key);
        match self.entries.entry(key.as_str().to_owned()) {
            MapEntry::Occupied(_) => Ok(false),
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    slot: Slot::Text(value.to_owned()),
                    expires_at: deadline(now, expiration),
                });
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &Key) -> Result<(), StoreError> {
        self.entries.remove(key.as_str());
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &Key, ttl: Duration) -> Result<i64, StoreError> {
        let now = self.purge_expired(key);
        let mut entry = self
            .entries
            .entry(key.as_str().to_owned())
            .or_insert_with(|| Entry {
                slot: Slot::Text("0".to_owned()),
                expires_at: expires_after(now, ttl),
            });
        match &mut entry.slot {
            Slot::Text(value) => {
                let current: i64 = value
                    .parse()
                    .map_err(|_| StoreError::Command(format!("{key} is not an integer")))?;
                let next = current + 1;
                *value = next.to_string();
                Ok(next)
            }
            Slot::Hash(_) => Err(wrong_type(key)),
        }
    }

    async fn hget(&self, key: &Key, field: &str) -> Result<Option<String>, StoreError> {
        self.purge_expired(key);
        match self.entries.get(key.as_str()) {
            Some(entry) => match &entry.slot {
                Slot::Hash(fields) => Ok(fields.get(field).cloned()),
                Slot::Text(_) => Err(wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn hget_all(&self, key: &Key) -> Result<HashMap<String, String>, StoreError> {
        self.purge_expired(key);
        match self.entries.get(key.as_str()) {
            Some(entry) => match &entry.slot {
                Slot::Hash(fields) => Ok(fields.clone()),
                Slot::Text(_) => Err(wrong_type(key)),
            },
            None => Ok(HashMap::new()),
        }
    }

    async fn hset(&self, key: &Key, field: &str, value: &str) -> Result<(), StoreError> {
        self.purge_expired(key);
        let mut entry = self
            .entries
            .entry(key.as_str().to_owned())
            .or_insert_with(|| Entry {
                slot: Slot::Hash(HashMap::new()),
                expires_at: None,
            });
        match &mut entry.slot {
            Slot::Hash(fields) => {
                fields.insert(field.to_owned(), value.to_owned());
                Ok(())
            }
            Slot::Text(_) => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &Key, field: &str) -> Result<(), StoreError> {
        self.purge_expired(key);
        let emptied = match self.entries.get_mut(key.as_str()) {
            Some(mut entry) => match &mut entry.slot {
                Slot::Hash(fields) => {
                    fields.remove(field);
                    fields.is_empty()
                }
                Slot::Text(_) => return Err(wrong_type(key)),
            },
            None => false,
        };
        // an emptied hash disappears, as in Redis
        if emptied {
            self.entries.remove_if(key.as_str(), |_, entry| {
                matches!(&entry.slot, Slot::Hash(fields) if fields.is_empty())
            });
        }
        Ok(())
    }
}
