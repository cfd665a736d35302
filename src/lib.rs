//! Distributed mutual exclusion over a TTL key-value store.
//!
//! A [`Lease`] is a single store key that one holder at a time owns. A
//! [`HeartbeatGuard`] holds a lease across a block of async work and keeps it
//! alive from a background task, releasing it when the work ends, fails, or is
//! cancelled.
//!
//! ```no_run
//! use heartbeat_lock::{HeartbeatGuard, Lease, LockConfig, LockError};
//!
//! # async fn example() -> Result<(), LockError> {
//! let config = LockConfig::from_env().map_err(|e| LockError::invalid_config(e.to_string()))?;
//! let lease = Lease::connect("nightly-report", &config).await?;
//! let mut guard = HeartbeatGuard::with_default_period(lease)?;
//!
//! guard
//!     .run(|| async {
//!         // only one process runs this at a time
//!         Ok::<_, LockError>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod config;
pub mod error;
pub mod guard;
pub mod lease;
pub mod redis_store;
pub mod store;

#[cfg(test)]
mod testing;

pub use blocking::Blocking;
pub use config::LockConfig;
pub use error::{LockError, Result, StoreError};
pub use guard::{GuardState, HeartbeatGuard};
pub use lease::{Lease, MARKER};
pub use redis_store::RedisStore;
pub use store::{KeyValueStore, MemoryStore, SyncKeyValueStore};
