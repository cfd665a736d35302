use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{sync::Arc, time::Duration};
use tokio::time::{self, Instant};
use tracing::{debug, info};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The four TTL-aware operations a lease needs from its backing store.
///
/// Semantics follow Redis: `set` with `only_if_absent` is `SET NX EX`,
/// `expire` and `delete` are no-ops on a missing key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns whether the value was written.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        only_if_absent: bool,
    ) -> StoreResult<bool>;

    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;
}

/// Same capability for clients whose calls block the current thread.
///
/// Wrap an implementation in [`crate::blocking::Blocking`] to use it from
/// async code.
pub trait SyncKeyValueStore: Send + Sync + 'static {
    fn set(&self, key: &str, value: &str, ttl_seconds: u64, only_if_absent: bool)
        -> StoreResult<bool>;

    fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()>;

    fn delete(&self, key: &str) -> StoreResult<()>;

    fn exists(&self, key: &str) -> StoreResult<bool>;
}

#[async_trait]
impl<S> KeyValueStore for Arc<S>
where
    S: KeyValueStore + ?Sized,
{
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        (**self).set(key, value, ttl_seconds, only_if_absent).await
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()> {
        (**self).expire(key, ttl_seconds).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        (**self).delete(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        (**self).exists(key).await
    }
}

fn deadline(now: Instant, ttl_seconds: u64) -> StoreResult<Instant> {
    now.checked_add(Duration::from_secs(ttl_seconds))
        .ok_or(StoreError::TtlOutOfRange(ttl_seconds))
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

impl StoredValue {
    // Redis treats a key as live up to and including its deadline
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// In-process TTL store with Redis-like semantics.
///
/// Deadlines are taken from tokio's clock, so tests can drive expiry with a
/// paused runtime. Expired entries are invisible to every operation even
/// before the sweeper removes them.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_expiry_task(self, every: Duration) {
        tokio::spawn(async move {
            let mut interval = time::interval(every);
            info!("Started memory store expiry task ({:?} interval)", every);

            loop {
                interval.tick().await;
                self.cleanup_expired();
            }
        });
    }

    fn cleanup_expired(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired(now));

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Expired {} keys from memory store", removed);
        }
    }

    /// Value currently stored under `key`, if it has not expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Time left before `key` expires.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.expires_at - now)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_now(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let stored = StoredValue {
            value: value.to_string(),
            expires_at: deadline(now, ttl_seconds)?,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(stored);
                Ok(true)
            }
            Entry::Occupied(mut entry) => {
                // An expired key counts as absent
                if only_if_absent && !entry.get().is_expired(now) {
                    Ok(false)
                } else {
                    entry.insert(stored);
                    Ok(true)
                }
            }
        }
    }

    fn expire_now(&self, key: &str, ttl_seconds: u64) -> StoreResult<()> {
        let now = Instant::now();
        let expires_at = deadline(now, ttl_seconds)?;
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = expires_at;
            }
        }
        Ok(())
    }

    fn delete_now(&self, key: &str) {
        self.entries.remove(key);
    }

    fn exists_now(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        self.set_now(key, value, ttl_seconds, only_if_absent)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()> {
        self.expire_now(key, ttl_seconds)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.delete_now(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.exists_now(key))
    }
}

impl SyncKeyValueStore for MemoryStore {
    fn set(&self, key: &str, value: &str, ttl_seconds: u64, only_if_absent: bool)
        -> StoreResult<bool> {
        self.set_now(key, value, ttl_seconds, only_if_absent)
    }

    fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()> {
        self.expire_now(key, ttl_seconds)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.delete_now(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.exists_now(key))
    }
}
