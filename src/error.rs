use std::time::Duration;

use thiserror::Error;

/// Failures talking to the backing key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Blocking worker failed: {0}")]
    Worker(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("TTL of {0}s is out of range")]
    TtlOutOfRange(u64),
}

/// Unified error type for lease and guard operations.
///
/// `AcquisitionFailed` is the only variant a caller is expected to recover
/// from routinely (treat it as "resource busy"). `LostLease` signals that the
/// local bookkeeping thinks the lease outlived its TTL before release; the key
/// may already belong to someone else, so callers should log it and move on.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Failed to acquire lock {key} within {waited:?}")]
    AcquisitionFailed { key: String, waited: Duration },

    #[error("Lost lock {key} before releasing ({elapsed:?} since last renewal, ttl {ttl:?})")]
    LostLease {
        key: String,
        elapsed: Duration,
        ttl: Duration,
    },

    #[error("Lock {key} is not held by this lease")]
    NotHeld { key: String },

    #[error("Renewal of lock {key} failed: {source}")]
    RenewalFailed {
        key: String,
        #[source]
        source: Box<LockError>,
    },

    #[error("Renewal task for lock {key} panicked")]
    RenewalTaskPanicked { key: String },

    #[error("Renewal task for lock {key} stopped while the guard was active")]
    RenewalStopped { key: String },

    #[error("Heartbeat guard for {key} has already been used")]
    GuardReused { key: String },

    #[error("Invalid lock configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl LockError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// True when the lock simply could not be obtained in time.
    pub fn is_busy(&self) -> bool {
        matches!(self, LockError::AcquisitionFailed { .. })
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Store(StoreError::Redis(err))
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
