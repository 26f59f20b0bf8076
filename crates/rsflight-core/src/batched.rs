//! Call coalescing built on one [`BatchLock`] per key.
//!
//! A [`BatchedCallGroup`] offers the same deduplicated `call` as
//! [`CallGroup`](crate::CallGroup) but keeps no call-level bookkeeping:
//! every key owns a batch lock, the elected leader runs the work inline and
//! releases its [`Outcome`] to the followers of its batch.
//!
//! Because batches pipeline, a caller that arrives while a leader is working
//! waits for that leader and then joins the next batch. Work for a key thus
//! runs at most once per batch, and never started before a caller arrived.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::batch_lock::{BatchLock, Leader, Role};
use crate::config::GroupConfig;
use crate::outcome::Outcome;

/// Coalesces calls per key using one leader-election lock per key.
///
/// Unlike [`CallGroup`](crate::CallGroup), the work runs in the leader's own
/// task, so neither it nor its future needs to be `Send` or `'static`.
///
/// The per-key lock registry only grows; see
/// [`BatchedCallGroup::registered_keys`].
pub struct BatchedCallGroup<K, V, E>
where
    K: Hash + Eq,
{
    locks: DashMap<K, Arc<BatchLock<Outcome<V, E>>>>,
    config: GroupConfig,
}

impl<K, V, E> BatchedCallGroup<K, V, E>
where
    K: Hash + Eq,
    V: Clone,
    E: Clone,
{
    /// Creates a group with default settings.
    pub fn new() -> Self {
        Self::with_config(GroupConfig::default())
    }

    /// Creates a group with the given settings.
    pub fn with_config(config: GroupConfig) -> Self {
        Self {
            locks: DashMap::with_capacity(config.initial_capacity),
            config,
        }
    }

    /// Runs `work` for `key` if this caller leads its batch, otherwise waits
    /// for the batch leader and returns what it produced.
    ///
    /// Returns `Ok(None)` if the leader's future was dropped before the work
    /// finished.
    ///
    /// # Panics
    ///
    /// Panics with a [`PanicError`](crate::PanicError) payload if the batch's
    /// work panicked.
    pub async fn call<F, Fut>(&self, key: K, work: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let lock = self.lock_for(key);

        let leader = match lock.acquire().await {
            Role::Follower(outcome) => return outcome.settle(),
            Role::Leader(leader) => leader,
        };

        debug!(
            group = %self.config.name,
            followers = leader.followers(),
            "leading batch"
        );
        let handoff = Handoff {
            leader: Some(leader),
        };

        let started = Instant::now();
        let outcome = Outcome::capture(work).await;
        let elapsed = started.elapsed();

        if let Some(threshold) = self.config.slow_call_threshold() {
            if elapsed > threshold {
                warn!(
                    group = %self.config.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow call"
                );
            }
        }
        if let Some(message) = outcome.panic_message() {
            error!(
                group = %self.config.name,
                panic = message,
                "batch work panicked, re-raising in every caller"
            );
        }

        handoff.release(outcome.clone());
        outcome.settle()
    }

    /// Number of keys that have a batch lock.
    pub fn registered_keys(&self) -> usize {
        self.locks.len()
    }

    fn lock_for(&self, key: K) -> Arc<BatchLock<Outcome<V, E>>> {
        if let Some(lock) = self.locks.get(&key) {
            return Arc::clone(lock.value());
        }
        Arc::clone(self.locks.entry(key).or_default().value())
    }
}

impl<K, V, E> Default for BatchedCallGroup<K, V, E>
where
    K: Hash + Eq,
    V: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> std::fmt::Debug for BatchedCallGroup<K, V, E>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedCallGroup")
            .field("name", &self.config.name)
            .field("registered_keys", &self.locks.len())
            .finish()
    }
}

/// Releases the batch with [`Outcome::Exited`] if the leader's future is
/// dropped before the work finishes.
struct Handoff<'a, V, E> {
    leader: Option<Leader<'a, Outcome<V, E>>>,
}

impl<V, E> Handoff<'_, V, E> {
    fn release(mut self, outcome: Outcome<V, E>) {
        if let Some(leader) = self.leader.take() {
            leader.release(outcome);
        }
    }
}

impl<V, E> Drop for Handoff<'_, V, E> {
    fn drop(&mut self) {
        if let Some(leader) = self.leader.take() {
            leader.release(Outcome::Exited);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::sleep;

    use crate::PanicError;

    #[tokio::test]
    async fn test_call_returns_value_and_error() {
        let group = BatchedCallGroup::<&str, u32, String>::new();

        assert_eq!(group.call("ok", || async { Ok(7) }).await, Ok(Some(7)));
        assert_eq!(
            group.call("err", || async { Err("boom".to_string()) }).await,
            Err("boom".to_string())
        );
        assert_eq!(group.registered_keys(), 2);
    }

    #[tokio::test]
    async fn test_work_may_borrow_local_state() {
        let group = BatchedCallGroup::<u8, usize, ()>::new();
        let local = vec![1, 2, 3];

        let len = group.call(0, || async { Ok(local.len()) }).await;
        assert_eq!(len, Ok(Some(3)));
    }

    #[tokio::test]
    async fn test_waiting_batch_runs_work_once() {
        const CALLERS: usize = 5;
        let group = Arc::new(BatchedCallGroup::<&str, u32, String>::new());
        let runs = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(Notify::new());

        // Keeps the key busy so the next callers pile into one batch.
        let first = {
            let group = Arc::clone(&group);
            let runs = Arc::clone(&runs);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                group
                    .call("key", || async move {
                        gate.notified().await;
                        Ok(runs.fetch_add(1, Ordering::SeqCst) + 1)
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;

        let batch: Vec<_> = (0..CALLERS)
            .map(|_| {
                let group = Arc::clone(&group);
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    group
                        .call("key", || async move {
                            sleep(Duration::from_millis(10)).await;
                            Ok(runs.fetch_add(1, Ordering::SeqCst) + 1)
                        })
                        .await
                })
            })
            .collect();
        sleep(Duration::from_millis(10)).await;

        gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok(Some(1)));
        for handle in batch {
            assert_eq!(handle.await.unwrap(), Ok(Some(2)));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(group.registered_keys(), 1);
    }

    #[tokio::test]
    async fn test_error_reaches_every_batch_member() {
        const CALLERS: usize = 4;
        let group = Arc::new(BatchedCallGroup::<&str, u32, String>::new());
        let runs = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(Notify::new());

        let first = {
            let group = Arc::clone(&group);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                group
                    .call("key", || async move {
                        gate.notified().await;
                        Ok(0)
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;

        let batch: Vec<_> = (0..CALLERS)
            .map(|_| {
                let group = Arc::clone(&group);
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    group
                        .call("key", || async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_millis(10)).await;
                            Err("backend unavailable".to_string())
                        })
                        .await
                })
            })
            .collect();
        sleep(Duration::from_millis(10)).await;

        gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok(Some(0)));
        for handle in batch {
            assert_eq!(handle.await.unwrap(), Err("backend unavailable".to_string()));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_reaches_every_batch_member() {
        let group = Arc::new(BatchedCallGroup::<&str, u32, String>::new());
        let gate = Arc::new(Notify::new());

        let first = {
            let group = Arc::clone(&group);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                group
                    .call("key", || async move {
                        gate.notified().await;
                        Ok(0)
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;

        let batch: Vec<_> = (0..3)
            .map(|_| {
                let group = Arc::clone(&group);
                tokio::spawn(async move {
                    group
                        .call("key", || async {
                            if true {
                                panic!("bad batch");
                            }
                            Ok(0)
                        })
                        .await
                })
            })
            .collect();
        sleep(Duration::from_millis(10)).await;

        gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok(Some(0)));
        for handle in batch {
            let payload = handle.await.unwrap_err().into_panic();
            let panic = payload.downcast_ref::<PanicError>().unwrap();
            assert_eq!(panic.message(), "bad batch");
        }

        // The lock is usable again afterwards.
        assert_eq!(group.call("key", || async { Ok(9) }).await, Ok(Some(9)));
    }

    #[tokio::test]
    async fn test_cancelled_leader_exits_its_batch_silently() {
        let group = Arc::new(BatchedCallGroup::<&str, u32, String>::new());
        let gate = Arc::new(Notify::new());

        let first = {
            let group = Arc::clone(&group);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                group
                    .call("key", || async move {
                        gate.notified().await;
                        Ok(1)
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;

        // Leads the next batch and never finishes its work.
        let stuck_leader = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .call("key", || async {
                        std::future::pending::<()>().await;
                        Ok(2)
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(5)).await;
        let follower = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.call("key", || async { Ok(3) }).await })
        };
        sleep(Duration::from_millis(5)).await;

        gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok(Some(1)));
        sleep(Duration::from_millis(10)).await;

        stuck_leader.abort();
        assert!(stuck_leader.await.unwrap_err().is_cancelled());
        assert_eq!(follower.await.unwrap(), Ok(None));
    }
}
