use crate::{
    error::StoreError,
    store::{KeyValueStore, MemoryStore, StoreResult},
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Memory store with switchable failures and call counters.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing_sets: AtomicUsize,
    fail_expire: AtomicBool,
    fail_delete: AtomicBool,
    set_calls: AtomicUsize,
    expire_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_sets(&self, count: usize) {
        self.failing_sets.store(count, Ordering::SeqCst);
    }

    pub fn fail_expires(&self, fail: bool) {
        self.fail_expire.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn expire_calls(&self) -> usize {
        self.expire_calls.load(Ordering::SeqCst)
    }

    fn unavailable(op: &str) -> StoreError {
        StoreError::Unavailable(format!("{} refused by test store", op))
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failing_sets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Self::unavailable("SET"));
        }
        KeyValueStore::set(&self.inner, key, value, ttl_seconds, only_if_absent).await
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()> {
        self.expire_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_expire.load(Ordering::SeqCst) {
            return Err(Self::unavailable("EXPIRE"));
        }
        KeyValueStore::expire(&self.inner, key, ttl_seconds).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Self::unavailable("DEL"));
        }
        KeyValueStore::delete(&self.inner, key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        KeyValueStore::exists(&self.inner, key).await
    }
}
