use crate::{
    config::{validate_timings, LockConfig},
    error::{LockError, Result},
    store::KeyValueStore,
};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Value written under a held key. Only its presence is ever checked.
pub const MARKER: &str = "True";

/// One store key used as a mutual-exclusion token.
///
/// The store's TTL is authoritative. `acquired_at` is local bookkeeping used
/// only to refuse a release that probably comes too late.
pub struct Lease<S: KeyValueStore + ?Sized> {
    key: String,
    store: Arc<S>,
    ttl_seconds: u64,
    acquisition_timeout: Duration,
    retry_interval: Duration,
    acquired_at: Mutex<Option<Instant>>,
}

impl<S: KeyValueStore + ?Sized> Lease<S> {
    pub fn new(
        key: impl Into<String>,
        store: Arc<S>,
        ttl_seconds: u64,
        acquisition_timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Self> {
        validate_timings(ttl_seconds, acquisition_timeout, retry_interval)?;

        Ok(Self {
            key: key.into(),
            store,
            ttl_seconds,
            acquisition_timeout,
            retry_interval,
            acquired_at: Mutex::new(None),
        })
    }

    pub fn from_config(key: impl Into<String>, store: Arc<S>, config: &LockConfig) -> Result<Self> {
        Self::new(
            key,
            store,
            config.ttl_seconds,
            config.acquisition_timeout,
            config.retry_interval,
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn acquisition_timeout(&self) -> Duration {
        self.acquisition_timeout
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// When the lease was last acquired or renewed.
    pub fn acquired_at(&self) -> Option<Instant> {
        *self.acquired_at_slot()
    }

    /// True when more than one TTL has passed since the last acquire or renew.
    pub fn is_stale(&self) -> bool {
        self.acquired_at()
            .map(|at| at.elapsed() > self.ttl())
            .unwrap_or(false)
    }

    fn acquired_at_slot(&self) -> MutexGuard<'_, Option<Instant>> {
        self.acquired_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_acquired(&self) {
        *self.acquired_at_slot() = Some(Instant::now());
    }

    /// Writes `marker` under the key with the lease TTL, retrying every
    /// `retry_interval` until it lands or `acquisition_timeout` has passed.
    ///
    /// With `exclusive_only` the write only succeeds if the key is absent.
    /// Returns `Ok(false)` on timeout. If no attempt ever got an answer from
    /// the store, the last store error is returned instead.
    pub async fn try_acquire(&self, marker: &str, exclusive_only: bool) -> Result<bool> {
        let started = Instant::now();
        let mut attempts: u32 = 0;
        let mut reached_store = false;
        let mut last_error = None;

        loop {
            attempts += 1;
            match self
                .store
                .set(&self.key, marker, self.ttl_seconds, exclusive_only)
                .await
            {
                Ok(true) => {
                    self.mark_acquired();
                    info!(
                        "Lock acquired: {} (attempt {}, ttl {}s)",
                        self.key, attempts, self.ttl_seconds
                    );
                    return Ok(true);
                }
                Ok(false) => {
                    reached_store = true;
                    debug!("Lock {} is held elsewhere, attempt {}", self.key, attempts);
                }
                Err(e) => {
                    warn!("Store error acquiring {} (attempt {}): {}", self.key, attempts, e);
                    last_error = Some(e);
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.acquisition_timeout {
                break;
            }
            time::sleep(self.retry_interval.min(self.acquisition_timeout - elapsed)).await;
        }

        match last_error {
            Some(e) if !reached_store => Err(e.into()),
            _ => {
                debug!(
                    "Gave up acquiring {} after {} attempts in {:?}",
                    self.key,
                    attempts,
                    started.elapsed()
                );
                Ok(false)
            }
        }
    }

    /// Pushes the key's expiry out to a full TTL without touching its value.
    ///
    /// The store ignores this if the key is gone, and ownership is not
    /// checked: a key taken over by someone else gets refreshed too.
    pub async fn renew(&self) -> Result<()> {
        self.store.expire(&self.key, self.ttl_seconds).await?;
        self.mark_acquired();
        debug!("Lock renewed: {} (ttl {}s)", self.key, self.ttl_seconds);
        Ok(())
    }

    /// Deletes the key.
    ///
    /// Fails with [`LockError::LostLease`] without touching the store when the
    /// last acquire or renew is more than one TTL old, and with
    /// [`LockError::NotHeld`] when this lease never acquired the key. Deleting
    /// an already missing key is fine, so a second release is a no-op.
    pub async fn release(&self) -> Result<()> {
        let acquired_at = self.acquired_at().ok_or_else(|| LockError::NotHeld {
            key: self.key.clone(),
        })?;

        let elapsed = acquired_at.elapsed();
        if elapsed > self.ttl() {
            return Err(LockError::LostLease {
                key: self.key.clone(),
                elapsed,
                ttl: self.ttl(),
            });
        }

        self.store.delete(&self.key).await?;
        info!("Lock released: {}", self.key);
        Ok(())
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.store.exists(&self.key).await?)
    }
}

impl<S: KeyValueStore + ?Sized> fmt::Debug for Lease<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("acquisition_timeout", &self.acquisition_timeout)
            .field("retry_interval", &self.retry_interval)
            .field("acquired_at", &self.acquired_at())
            .finish()
    }
}
