//! Call coalescing: at most one in-flight execution per key.
//!
//! When several tasks ask a [`CallGroup`] for the same key while a call for
//! that key is running, only the first one starts the work. The others attach
//! to the running call and all of them receive the same result, together with
//! a [`Shared`] handle that reports whether the result went to more than one
//! caller.
//!
//! # Forgetting a key
//!
//! [`CallGroup::forget`] detaches a running call from its key. Callers already
//! attached still get that call's result, but the next caller for the key
//! starts a fresh call instead of waiting.
//!
//! # Panics
//!
//! If the work panics, the panic is re-raised in every attached caller, each
//! with its own [`PanicError`](crate::PanicError) payload.

mod response;
mod shared;

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::config::GroupConfig;
use crate::outcome::Outcome;

pub use response::{Pending, Response};
pub use shared::Shared;

use response::Delivery;

/// Identifies one call, independently of the key it was started under.
type CallId = u64;

/// An in-flight call.
struct Call<V, E> {
    /// Set when [`CallGroup::forget`] detached this call from its key.
    forgotten: bool,
    /// One receiver per attached caller.
    waiters: Vec<oneshot::Sender<Delivery<V, E>>>,
}

/// The group's in-flight bookkeeping. Every field is guarded by one mutex.
struct Table<K, V, E> {
    /// Live calls by key. Forgotten calls are no longer reachable from here.
    keys: HashMap<K, CallId>,
    /// Every call that has not completed yet, forgotten or not.
    calls: HashMap<CallId, Call<V, E>>,
    next_id: CallId,
}

struct Inner<K, V, E> {
    table: Mutex<Table<K, V, E>>,
    config: GroupConfig,
}

impl<K, V, E> Inner<K, V, E> {
    fn table(&self) -> MutexGuard<'_, Table<K, V, E>> {
        // Nothing panics while holding the lock; recover the table regardless.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A namespace of keyed work with duplicate suppression.
///
/// Cloning a `CallGroup` yields another handle onto the same in-flight table.
///
/// Work runs on its own Tokio task, so the group must be used from within a
/// Tokio runtime.
///
/// # Example
///
/// ```ignore
/// use rsflight_core::CallGroup;
///
/// let group: CallGroup<String, Vec<u8>, String> = CallGroup::new();
/// let response = group
///     .call("avatar:42".to_string(), || async { fetch_avatar(42).await })
///     .await;
/// if response.shared.is_shared() {
///     // another request received the same bytes
/// }
/// ```
pub struct CallGroup<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> CallGroup<K, V, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a group with default settings.
    pub fn new() -> Self {
        Self::with_config(GroupConfig::default())
    }

    /// Creates a group with the given settings.
    pub fn with_config(config: GroupConfig) -> Self {
        let table = Table {
            keys: HashMap::with_capacity(config.initial_capacity),
            calls: HashMap::with_capacity(config.initial_capacity),
            next_id: 0,
        };
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(table),
                config,
            }),
        }
    }

    /// Runs `work` for `key` unless a call for `key` is already in flight,
    /// and returns the result of whichever call this caller attached to.
    ///
    /// # Panics
    ///
    /// Panics if the work of the attached call panicked.
    pub async fn call<F, Fut>(&self, key: K, work: F) -> Response<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.call_detached(key, work).await
    }

    /// Like [`CallGroup::call`], but registers the caller immediately and
    /// returns a [`Pending`] that resolves to the result.
    ///
    /// `work` is never invoked if another call for `key` is in flight.
    pub fn call_detached<F, Fut>(&self, key: K, work: F) -> Pending<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let mut guard = self.inner.table();
        let table = &mut *guard;

        if let Some(&id) = table.keys.get(&key) {
            if let Some(call) = table.calls.get_mut(&id) {
                call.waiters.push(sender);
                debug!(
                    group = %self.inner.config.name,
                    call_id = id,
                    waiters = call.waiters.len(),
                    "joined in-flight call"
                );
                return Pending::new(receiver);
            }
        }

        let id = table.next_id;
        table.next_id += 1;
        table.keys.insert(key.clone(), id);
        table.calls.insert(
            id,
            Call {
                forgotten: false,
                waiters: vec![sender],
            },
        );
        drop(guard);

        debug!(group = %self.inner.config.name, call_id = id, "starting call");
        let flight = Flight {
            inner: Arc::clone(&self.inner),
            key,
            id,
            landed: false,
        };
        tokio::spawn(flight.run(work));

        Pending::new(receiver)
    }

    /// Detaches the in-flight call for `key`, if any.
    ///
    /// Callers already attached to it still receive its result. Any call for
    /// `key` made after `forget` returns starts new work.
    pub fn forget(&self, key: &K) {
        let mut guard = self.inner.table();
        let table = &mut *guard;

        if let Some(id) = table.keys.remove(key) {
            if let Some(call) = table.calls.get_mut(&id) {
                call.forgotten = true;
            }
            debug!(group = %self.inner.config.name, call_id = id, "forgot call");
        }
    }

    /// Returns `true` if a call for `key` is in flight and not forgotten.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inner.table().keys.contains_key(key)
    }

    /// Number of keys with a call in flight. Forgotten calls are not counted.
    pub fn in_flight_count(&self) -> usize {
        self.inner.table().keys.len()
    }
}

impl<K, V, E> Clone for CallGroup<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> Default for CallGroup<K, V, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> std::fmt::Debug for CallGroup<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.inner.table();
        f.debug_struct("CallGroup")
            .field("name", &self.inner.config.name)
            .field("in_flight", &table.keys.len())
            .field("running", &table.calls.len())
            .finish()
    }
}

/// Drives one call and delivers its outcome.
///
/// If the task is torn down before the work finishes, dropping the flight
/// delivers [`Outcome::Exited`] so no caller waits forever.
struct Flight<K, V, E>
where
    K: Hash + Eq,
{
    inner: Arc<Inner<K, V, E>>,
    key: K,
    id: CallId,
    landed: bool,
}

impl<K, V, E> Flight<K, V, E>
where
    K: Hash + Eq,
    V: Clone,
    E: Clone,
{
    async fn run<F, Fut>(mut self, work: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let started = Instant::now();
        let outcome = Outcome::capture(work).await;
        let elapsed = started.elapsed();

        if let Some(threshold) = self.inner.config.slow_call_threshold() {
            if elapsed > threshold {
                warn!(
                    group = %self.inner.config.name,
                    call_id = self.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow call"
                );
            }
        }
        if let Some(message) = outcome.panic_message() {
            error!(
                group = %self.inner.config.name,
                call_id = self.id,
                panic = message,
                "call panicked, re-raising in every caller"
            );
        }

        self.land(outcome);
    }

    /// Hands `outcome` to every attached caller.
    fn land(&mut self, outcome: Outcome<V, E>) {
        let callers = self.deliver(|| outcome.clone());
        debug!(
            group = %self.inner.config.name,
            call_id = self.id,
            callers,
            "call completed"
        );
    }
}

impl<K, V, E> Flight<K, V, E>
where
    K: Hash + Eq,
{
    /// Retires the call and sends each attached caller its own delivery.
    ///
    /// Returns the number of callers; `0` if the call was already retired.
    fn deliver(&mut self, mut outcome: impl FnMut() -> Outcome<V, E>) -> usize {
        self.landed = true;

        let call = {
            let mut table = self.inner.table();
            let Some(call) = table.calls.remove(&self.id) else {
                return 0;
            };
            // A forgotten call's key may already belong to a newer call.
            if !call.forgotten {
                table.keys.remove(&self.key);
            }
            call
        };

        let callers = call.waiters.len();
        for (sender, shared) in call.waiters.into_iter().zip(Shared::fan_out(callers)) {
            // A caller that stopped waiting has dropped its receiver. The
            // undelivered share is released when the delivery drops.
            let _ = sender.send(Delivery {
                outcome: outcome(),
                shared,
            });
        }
        callers
    }
}

impl<K, V, E> Drop for Flight<K, V, E>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        if self.landed {
            return;
        }
        let callers = self.deliver(|| Outcome::Exited);
        debug!(
            group = %self.inner.config.name,
            call_id = self.id,
            callers,
            "call exited before completing"
        );
    }
}
