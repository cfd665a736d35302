//! Bridge for store clients whose calls block the calling thread.

use crate::{
    error::StoreError,
    store::{KeyValueStore, StoreResult, SyncKeyValueStore},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task;

/// Runs every call of a [`SyncKeyValueStore`] on tokio's blocking pool so the
/// renewal task and the guarded code keep making progress while a store call
/// is in flight.
#[derive(Clone)]
pub struct Blocking<S> {
    inner: Arc<S>,
}

impl<S: SyncKeyValueStore> Blocking<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn run<T, F>(&self, call: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> StoreResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        task::spawn_blocking(move || call(&inner))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl<S: SyncKeyValueStore> KeyValueStore for Blocking<S> {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |store| store.set(&key, &value, ttl_seconds, only_if_absent))
            .await
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()> {
        let key = key.to_string();
        self.run(move |store| store.expire(&key, ttl_seconds)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.run(move |store| store.delete(&key)).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.run(move |store| store.exists(&key)).await
    }
}
