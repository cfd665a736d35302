//! Scoped lease acquisition with background renewal.
//!
//! A [`HeartbeatGuard`] acquires its lease on entry, renews it every `period`
//! from a spawned task while the guarded code runs, and on exit stops that
//! task, waits for it to finish, and only then releases the lease.

use crate::{
    config::validate_period,
    error::{LockError, Result},
    lease::{Lease, MARKER},
    store::KeyValueStore,
};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::{
    runtime::Handle,
    sync::oneshot,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Acquiring,
    Active,
    Exiting,
    Released,
    /// Acquisition did not succeed; nothing to clean up.
    Failed,
}

struct Renewal {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl Renewal {
    fn spawn<S>(lease: Arc<Lease<S>>, period: Duration) -> Self
    where
        S: KeyValueStore + ?Sized + 'static,
    {
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(heartbeat(lease, period, stopped));
        Self {
            stop: Some(stop),
            handle,
        }
    }

    /// Signals the task and waits until it has finished.
    async fn stop(&mut self, key: &str) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        finished(key, (&mut self.handle).await)
    }
}

fn finished(
    key: &str,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(result) => result,
        // Cancellation is how the task is expected to end when aborted
        Err(e) if e.is_cancelled() => Ok(()),
        Err(_) => Err(LockError::RenewalTaskPanicked {
            key: key.to_string(),
        }),
    }
}

/// Error for a renewal task that finished while its guard was still active.
///
/// The task only returns `Ok` once its stop signal fires or its sender is
/// dropped, and the guard holds the sender until after the join. An `Ok` here
/// therefore means the task was aborted from outside, which the guard never
/// does itself.
fn renewal_ended(
    key: &str,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> LockError {
    match finished(key, joined) {
        Err(e) => e,
        Ok(()) => LockError::RenewalStopped {
            key: key.to_string(),
        },
    }
}

async fn heartbeat<S>(
    lease: Arc<Lease<S>>,
    period: Duration,
    mut stopped: oneshot::Receiver<()>,
) -> Result<()>
where
    S: KeyValueStore + ?Sized,
{
    let mut ticks = time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            // Also fires if the guard was dropped and took the sender with it
            _ = &mut stopped => {
                debug!("Heartbeat for {} stopped", lease.key());
                return Ok(());
            }
            _ = ticks.tick() => {}
        }

        lease
            .renew()
            .await
            .map_err(|e| LockError::RenewalFailed {
                key: lease.key().to_string(),
                source: Box::new(e),
            })?;
    }
}

/// Holds a [`Lease`] for the duration of a scope and keeps it alive.
///
/// Single use: once a guard has been entered it can never be entered again.
/// Prefer [`HeartbeatGuard::run`], which performs the whole
/// enter/work/exit sequence and settles error precedence. [`enter`] and
/// [`exit`] are available for callers that need to split the scope.
///
/// Dropping an active guard (for example because the future driving it was
/// cancelled) stops the renewal task and releases the lease from a task
/// spawned on the current runtime.
///
/// [`enter`]: HeartbeatGuard::enter
/// [`exit`]: HeartbeatGuard::exit
pub struct HeartbeatGuard<S: KeyValueStore + ?Sized + 'static> {
    id: Uuid,
    period: Duration,
    lease: Arc<Lease<S>>,
    state: GuardState,
    renewal: Option<Renewal>,
}

impl<S: KeyValueStore + ?Sized + 'static> HeartbeatGuard<S> {
    pub fn new(period: Duration, lease: Lease<S>) -> Result<Self> {
        validate_period(period, lease.ttl())?;

        Ok(Self {
            id: Uuid::new_v4(),
            period,
            lease: Arc::new(lease),
            state: GuardState::Idle,
            renewal: None,
        })
    }

    /// Renews every half TTL.
    pub fn with_default_period(lease: Lease<S>) -> Result<Self> {
        let period = lease.ttl() / 2;
        Self::new(period, lease)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn lease(&self) -> &Lease<S> {
        &self.lease
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    /// True while the renewal task is still running.
    pub fn is_renewing(&self) -> bool {
        self.renewal
            .as_ref()
            .map(|renewal| !renewal.handle.is_finished())
            .unwrap_or(false)
    }

    /// Acquires the lease exclusively and starts renewing it.
    ///
    /// On failure the guard moves to [`GuardState::Failed`] and the key is
    /// left exactly as found.
    pub async fn enter(&mut self) -> Result<()> {
        if self.state != GuardState::Idle {
            return Err(LockError::GuardReused {
                key: self.lease.key().to_string(),
            });
        }

        self.state = GuardState::Acquiring;
        let started = Instant::now();

        match self.lease.try_acquire(MARKER, true).await {
            Ok(true) => {}
            Ok(false) => {
                self.state = GuardState::Failed;
                warn!(
                    "Guard {} failed to get lock {} within {:?}",
                    self.id,
                    self.lease.key(),
                    self.lease.acquisition_timeout()
                );
                return Err(LockError::AcquisitionFailed {
                    key: self.lease.key().to_string(),
                    waited: started.elapsed(),
                });
            }
            Err(e) => {
                self.state = GuardState::Failed;
                return Err(e);
            }
        }

        self.renewal = Some(Renewal::spawn(self.lease.clone(), self.period));
        self.state = GuardState::Active;
        info!(
            "Guard {} holds {}, renewing every {:?}",
            self.id,
            self.lease.key(),
            self.period
        );
        Ok(())
    }

    /// Stops renewal, waits for the task to finish, then releases the lease.
    ///
    /// Release is attempted even when the renewal task failed. If both fail,
    /// the renewal error is returned and the release error is logged. Calling
    /// `exit` on a guard that already exited, or never acquired, is a no-op.
    pub async fn exit(&mut self) -> Result<()> {
        match self.state {
            GuardState::Active | GuardState::Exiting => {}
            GuardState::Idle => {
                return Err(LockError::NotHeld {
                    key: self.lease.key().to_string(),
                })
            }
            GuardState::Acquiring => {
                // Acquisition was abandoned midway, so nothing was taken
                self.state = GuardState::Failed;
                return Ok(());
            }
            GuardState::Released | GuardState::Failed => return Ok(()),
        }

        self.state = GuardState::Exiting;

        let renewed = match self.renewal.as_mut() {
            Some(renewal) => renewal.stop(self.lease.key()).await,
            None => Ok(()),
        };
        self.renewal = None;

        let released = self.lease.release().await;
        self.state = GuardState::Released;
        info!("Guard {} exited {}", self.id, self.lease.key());

        match (renewed, released) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(renewal_err), Err(release_err)) => {
                warn!(
                    "Release of {} also failed after renewal error: {}",
                    self.lease.key(),
                    release_err
                );
                Err(renewal_err)
            }
        }
    }

    /// Runs `body` while holding the lease.
    ///
    /// - If the lease cannot be acquired, `body` never runs and the
    ///   acquisition error is returned.
    /// - If a renewal fails while `body` is running, `body` is dropped at its
    ///   current await point, the lease is released, and
    ///   [`LockError::RenewalFailed`] is returned.
    /// - Otherwise the guard exits after `body`. An error from `body` wins
    ///   over a cleanup error, which is then only logged.
    pub async fn run<F, Fut, T, E>(&mut self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LockError> + std::fmt::Display,
    {
        self.enter().await?;

        let mut body = Box::pin(body());
        let raced = match self.renewal.as_mut() {
            Some(renewal) => {
                tokio::select! {
                    outcome = &mut body => Ok(outcome),
                    joined = &mut renewal.handle => Err(joined),
                }
            }
            None => Ok((&mut body).await),
        };

        match raced {
            Ok(outcome) => {
                drop(body);
                let cleanup = self.exit().await;
                match (outcome, cleanup) {
                    (Ok(value), Ok(())) => Ok(value),
                    (Ok(_), Err(e)) => Err(e.into()),
                    (Err(e), Ok(())) => Err(e),
                    (Err(e), Err(cleanup_err)) => {
                        warn!(
                            "Cleanup of {} failed after guarded code failed ({}): {}",
                            self.lease.key(),
                            e,
                            cleanup_err
                        );
                        Err(e)
                    }
                }
            }
            Err(joined) => {
                // Renewal ended on its own: cancel the guarded code first
                drop(body);
                self.renewal = None;
                let failure = renewal_ended(self.lease.key(), joined);
                warn!("Guard {} cancelling guarded code: {}", self.id, failure);

                self.state = GuardState::Exiting;
                if let Err(e) = self.lease.release().await {
                    warn!("Release of {} after renewal failure failed: {}", self.lease.key(), e);
                }
                self.state = GuardState::Released;
                Err(failure.into())
            }
        }
    }
}

impl<S: KeyValueStore + ?Sized + 'static> fmt::Debug for HeartbeatGuard<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatGuard")
            .field("id", &self.id)
            .field("period", &self.period)
            .field("state", &self.state)
            .field("lease", &self.lease)
            .finish()
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Drop for HeartbeatGuard<S> {
    fn drop(&mut self) {
        if !matches!(self.state, GuardState::Active | GuardState::Exiting) {
            return;
        }

        // Dropping the renewal's stop sender ends the task even if nothing
        // below gets to run.
        let renewal = self.renewal.take();
        let lease = self.lease.clone();
        let id = self.id;

        match Handle::try_current() {
            Ok(handle) => {
                warn!("Guard {} dropped while holding {}, releasing in background", id, lease.key());
                handle.spawn(async move {
                    if let Some(mut renewal) = renewal {
                        if let Err(e) = renewal.stop(lease.key()).await {
                            warn!("Renewal of {} failed before background release: {}", lease.key(), e);
                        }
                    }
                    if let Err(e) = lease.release().await {
                        warn!("Background release of {} failed: {}", lease.key(), e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Guard {} dropped outside a runtime; {} will expire after {}s",
                    id,
                    lease.key(),
                    lease.ttl_seconds()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryStore, testing::FlakyStore};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn lease_on<S: KeyValueStore>(store: &Arc<S>, key: &str, ttl_seconds: u64) -> Lease<S> {
        Lease::new(
            key,
            store.clone(),
            ttl_seconds,
            Duration::from_secs(2),
            Duration::from_millis(200),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleans_up_if_nothing_happens() {
        let store = Arc::new(MemoryStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 2)).unwrap();

        guard.run(|| async { Ok::<_, LockError>(()) }).await.unwrap();

        assert_eq!(guard.state(), GuardState::Released);
        assert!(!guard.is_renewing());
        assert!(!guard.lease().exists().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_raises_if_error_occurs() {
        let store = Arc::new(MemoryStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 2)).unwrap();

        let result: anyhow::Result<()> = guard.run(|| async { Err(anyhow::anyhow!("Failed!")) }).await;

        assert_eq!(result.unwrap_err().to_string(), "Failed!");
        assert_eq!(guard.state(), GuardState::Released);
        assert!(!guard.is_renewing());
        assert!(store.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_can_run_things_in_the_foreground() {
        let store = Arc::new(MemoryStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 2)).unwrap();

        let held_throughout = guard
            .run(|| async {
                time::sleep(Duration::from_secs(5)).await;
                Ok::<_, LockError>(store.get("k").is_some())
            })
            .await
            .unwrap();

        assert!(held_throughout);
        assert!(store.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gets_lock() {
        let store = Arc::new(MemoryStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 4)).unwrap();
        let competitor = lease_on(&store, "k", 4);

        let competitor_won = guard
            .run(|| async { competitor.try_acquire(MARKER, true).await })
            .await
            .unwrap();

        assert!(!competitor_won);
        assert!(store.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_if_lock_is_acquired() {
        let store = Arc::new(MemoryStore::new());
        let holder = lease_on(&store, "k", 8);
        assert!(holder.try_acquire(MARKER, true).await.unwrap());

        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 8)).unwrap();
        let ran = AtomicBool::new(false);

        let err = guard
            .run(|| async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, LockError>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_busy());
        assert!(err.to_string().contains("Failed to acquire lock k"));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(guard.state(), GuardState::Failed);
        // The other holder's key is untouched
        assert!(store.get("k").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_holds_lock_past_ttl() {
        let store = Arc::new(MemoryStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(2), lease_on(&store, "k", 4)).unwrap();
        let competitor = lease_on(&store, "k", 4);

        guard
            .run(|| async {
                assert!(!competitor.try_acquire(MARKER, true).await?);

                // Should still have the lock after another five seconds
                time::sleep(Duration::from_secs(5)).await;
                assert!(!competitor.try_acquire(MARKER, true).await?);

                time::sleep(Duration::from_secs(5)).await;
                assert!(!competitor.try_acquire(MARKER, true).await?);
                Ok::<_, LockError>(())
            })
            .await
            .unwrap();

        assert!(store.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_stops_on_exit() {
        let store = Arc::new(FlakyStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 4)).unwrap();

        guard
            .run(|| async {
                time::sleep(Duration::from_millis(4500)).await;
                Ok::<_, LockError>(())
            })
            .await
            .unwrap();

        let renewals = store.expire_calls();
        assert_eq!(renewals, 4);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.expire_calls(), renewals);
        assert!(!guard.is_renewing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_failure_cancels_guarded_code() {
        let store = Arc::new(FlakyStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 4)).unwrap();
        let completed = AtomicBool::new(false);
        let started = Instant::now();

        store.fail_expires(true);
        let err = guard
            .run(|| async {
                time::sleep(Duration::from_secs(60)).await;
                completed.store(true, Ordering::SeqCst);
                Ok::<_, LockError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::RenewalFailed { .. }));
        assert!(!completed.load(Ordering::SeqCst));
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(guard.state(), GuardState::Released);
        assert!(store.inner.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_error_beats_cleanup_error() {
        let store = Arc::new(FlakyStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 4)).unwrap();

        let result: anyhow::Result<()> = guard
            .run(|| async {
                store.fail_deletes(true);
                Err(anyhow::anyhow!("boom"))
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "boom");
        assert_eq!(guard.state(), GuardState::Released);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_error_surfaces_when_body_succeeds() {
        let store = Arc::new(FlakyStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 4)).unwrap();

        let err = guard
            .run(|| async {
                store.fail_deletes(true);
                Ok::<_, LockError>(7)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::Store(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_enter_and_exit() {
        let store = Arc::new(MemoryStore::new());
        let mut guard = HeartbeatGuard::with_default_period(lease_on(&store, "k", 4)).unwrap();
        assert_eq!(guard.period(), Duration::from_secs(2));
        assert_eq!(guard.state(), GuardState::Idle);

        guard.enter().await.unwrap();
        assert_eq!(guard.state(), GuardState::Active);
        assert!(guard.is_renewing());
        assert!(store.get("k").is_some());

        time::sleep(Duration::from_secs(9)).await;
        assert!(store.get("k").is_some());

        guard.exit().await.unwrap();
        assert_eq!(guard.state(), GuardState::Released);
        assert!(store.get("k").is_none());

        // A second exit has nothing left to do
        guard.exit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_is_single_use() {
        let store = Arc::new(MemoryStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 2)).unwrap();

        guard.run(|| async { Ok::<_, LockError>(()) }).await.unwrap();

        let err = guard.enter().await.unwrap_err();
        assert!(matches!(err, LockError::GuardReused { .. }));
        assert!(store.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_before_enter_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 2)).unwrap();

        assert!(matches!(guard.exit().await, Err(LockError::NotHeld { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_active_guard_releases_lease() {
        let store = Arc::new(MemoryStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "k", 4)).unwrap();

        guard.enter().await.unwrap();
        assert!(store.get("k").is_some());

        drop(guard);
        time::sleep(Duration::from_millis(10)).await;

        assert!(store.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_still_cleans_up() {
        let store = Arc::new(MemoryStore::new());
        let guard_store = store.clone();

        let task = tokio::spawn(async move {
            let mut guard =
                HeartbeatGuard::new(Duration::from_secs(1), lease_on(&guard_store, "k", 4)).unwrap();
            guard
                .run(|| async {
                    time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, LockError>(())
                })
                .await
        });

        time::sleep(Duration::from_secs(3)).await;
        assert!(store.get("k").is_some());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        time::sleep(Duration::from_millis(10)).await;

        assert!(store.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guards_serialize_on_one_key() {
        let store = Arc::new(MemoryStore::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for _ in 0..3 {
            let lease = Lease::new(
                "shared",
                store.clone(),
                4,
                Duration::from_secs(10),
                Duration::from_millis(100),
            )
            .unwrap();
            let inside = inside.clone();
            let max_inside = max_inside.clone();

            tasks.push(tokio::spawn(async move {
                let mut guard = HeartbeatGuard::with_default_period(lease).unwrap();
                guard
                    .run(|| async {
                        let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now_inside, Ordering::SeqCst);
                        time::sleep(Duration::from_secs(1)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, LockError>(())
                    })
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debug_output() {
        let store = Arc::new(MemoryStore::new());
        let mut guard = HeartbeatGuard::new(Duration::from_secs(1), lease_on(&store, "jobs", 2)).unwrap();
        guard.enter().await.unwrap();

        let debug = format!("{:?}", guard);
        assert!(debug.contains("HeartbeatGuard"));
        assert!(debug.contains("Active"));
        assert!(debug.contains("jobs"));

        guard.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_aborted_renewal_task_is_reported_as_stopped() {
        let task = tokio::spawn(std::future::pending::<Result<()>>());
        task.abort();

        let err = renewal_ended("jobs", task.await);
        assert!(matches!(err, LockError::RenewalStopped { ref key } if key == "jobs"));
    }

    #[tokio::test]
    async fn test_failed_renewal_task_keeps_its_error() {
        let task = tokio::spawn(async {
            Err(LockError::RenewalFailed {
                key: "jobs".to_string(),
                source: Box::new(LockError::NotHeld { key: "jobs".to_string() }),
            })
        });

        assert!(matches!(renewal_ended("jobs", task.await), LockError::RenewalFailed { .. }));
    }

    #[test]
    fn test_period_must_be_shorter_than_ttl() {
        let store = Arc::new(MemoryStore::new());

        let err = HeartbeatGuard::new(Duration::from_secs(2), lease_on(&store, "k", 2)).unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig { .. }));
        assert!(HeartbeatGuard::new(Duration::ZERO, lease_on(&store, "k", 2)).is_err());
    }
}
