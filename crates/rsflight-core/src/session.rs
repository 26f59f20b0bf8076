//! Shared resource lifecycles: create once, handle per caller, dispose once.
//!
//! A session for a key spans every caller that overlaps while its resource
//! is alive:
//!
//! ```text
//! Idle -> Creating -> Ready (handlers running) -> Disposing -> Idle
//! ```
//!
//! The first caller of a session starts `create`. Every caller, the first
//! included, then runs its own `handle` with the resource. When the last
//! attached caller finishes, `dispose` runs exactly once. Callers arriving
//! while a session is disposing wait for it to reach `Idle` and then start a
//! new session.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::config::GroupConfig;
use crate::error::PanicError;
use crate::outcome::Outcome;
use crate::wait::WaitHandle;

/// One resource lifetime.
struct Session<R, E> {
    created: WaitHandle<Outcome<Arc<R>, E>>,
    /// Resolved once the session has been disposed and unregistered.
    idle: WaitHandle<()>,
}

struct Entry<R, E> {
    session: Arc<Session<R, E>>,
    /// Callers attached and not yet done with the resource.
    active: usize,
    disposing: bool,
}

struct Inner<K, R, E> {
    sessions: Mutex<HashMap<K, Entry<R, E>>>,
    config: GroupConfig,
}

impl<K, R, E> Inner<K, R, E> {
    fn sessions(&self) -> MutexGuard<'_, HashMap<K, Entry<R, E>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of trying to join the session for a key.
enum Join<R, E> {
    /// Attached to a session; `true` if this caller started it.
    Attached(Arc<Session<R, E>>, bool),
    /// The key's session is being disposed.
    Retiring(Arc<Session<R, E>>),
}

/// Coalesces resource creation per key while letting every caller handle
/// the resource itself.
///
/// Cloning yields another handle onto the same sessions. `create` and
/// `dispose` run on their own Tokio tasks, so a caller giving up does not
/// interrupt them.
///
/// # Example
///
/// ```ignore
/// use rsflight_core::ResourceSession;
///
/// let exports: ResourceSession<String, PathBuf, String> = ResourceSession::new();
/// let bytes = exports
///     .use_resource(
///         report_id.clone(),
///         move || async move { render_report_to_temp_file(report_id).await },
///         |file| async move { stream_file(file?).await },
///         |file| async move { let _ = tokio::fs::remove_file(&*file).await; },
///     )
///     .await;
/// ```
pub struct ResourceSession<K, R, E> {
    inner: Arc<Inner<K, R, E>>,
}

impl<K, R, E> ResourceSession<K, R, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a session registry with default settings.
    pub fn new() -> Self {
        Self::with_config(GroupConfig::default())
    }

    /// Creates a session registry with the given settings.
    pub fn with_config(config: GroupConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::with_capacity(config.initial_capacity)),
                config,
            }),
        }
    }

    /// Joins the session for `key`, starting one with `create` if none is
    /// live, and runs `handle` with its resource.
    ///
    /// `handle` receives the resource or a clone of the error `create`
    /// returned. Once the last caller of the session is done, the `dispose`
    /// of that caller runs with the resource; the last caller waits for it
    /// before returning. Nothing is disposed when `create` failed.
    ///
    /// Returns `None` without calling `handle` if `create` was stopped
    /// before it finished, which happens when its runtime shuts down.
    ///
    /// Disposal normally runs on a spawned task. If the last caller is
    /// dropped outside any Tokio runtime, `dispose` runs inline on that
    /// thread instead, blocking it until `dispose` completes. `dispose` is
    /// skipped only if the runtime shuts down before the spawned disposal
    /// task gets to run.
    ///
    /// # Panics
    ///
    /// Panics with a [`PanicError`] payload if `create` panicked. A panic in
    /// `handle` propagates to this caller only; the session still disposes.
    #[instrument(skip_all, fields(group = %self.inner.config.name))]
    pub async fn use_resource<C, CFut, H, HFut, T, D, DFut>(
        &self,
        key: K,
        create: C,
        handle: H,
        dispose: D,
    ) -> Option<T>
    where
        C: FnOnce() -> CFut + Send + 'static,
        CFut: Future<Output = Result<R, E>> + Send + 'static,
        H: FnOnce(Result<Arc<R>, E>) -> HFut,
        HFut: Future<Output = T>,
        D: FnOnce(Arc<R>) -> DFut + Send + 'static,
        DFut: Future<Output = ()> + Send + 'static,
    {
        let (session, started) = loop {
            match self.join(&key) {
                Join::Attached(session, started) => break (session, started),
                Join::Retiring(session) => session.idle.wait().await,
            }
        };

        let mut attachment = Attachment {
            inner: Arc::clone(&self.inner),
            key,
            session: Arc::clone(&session),
            dispose: Some(Box::new(move |resource| dispose(resource).boxed())),
        };

        if started {
            debug!("session created");
            let creating = Creating {
                inner: Arc::clone(&self.inner),
                session: Arc::clone(&session),
            };
            tokio::spawn(creating.run(create));
        }

        let handled = match session.created.wait().await {
            Outcome::Returned(resource) => Some(handle(resource).await),
            Outcome::Panicked(panic) => panic.resume(),
            Outcome::Exited => None,
        };

        if let Some(disposal) = attachment.detach() {
            // Only fails if the runtime is shutting down.
            let _ = disposal.await;
        }
        handled
    }

    /// Number of keys whose session has not returned to idle.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions().len()
    }

    fn join(&self, key: &K) -> Join<R, E> {
        let mut sessions = self.inner.sessions();

        if let Some(entry) = sessions.get_mut(key) {
            if entry.disposing {
                return Join::Retiring(Arc::clone(&entry.session));
            }
            entry.active += 1;
            return Join::Attached(Arc::clone(&entry.session), false);
        }

        let session = Arc::new(Session {
            created: WaitHandle::new(),
            idle: WaitHandle::new(),
        });
        sessions.insert(
            key.clone(),
            Entry {
                session: Arc::clone(&session),
                active: 1,
                disposing: false,
            },
        );
        Join::Attached(session, true)
    }
}

impl<K, R, E> Clone for ResourceSession<K, R, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, R, E> Default for ResourceSession<K, R, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, R, E> std::fmt::Debug for ResourceSession<K, R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSession")
            .field("name", &self.inner.config.name)
            .field("active_sessions", &self.inner.sessions().len())
            .finish()
    }
}

/// Runs `create` for a session. Resolves the session with
/// [`Outcome::Exited`] if dropped before `create` finished.
struct Creating<K, R, E> {
    inner: Arc<Inner<K, R, E>>,
    session: Arc<Session<R, E>>,
}

impl<K, R, E> Creating<K, R, E> {
    async fn run<C, CFut>(self, create: C)
    where
        C: FnOnce() -> CFut,
        CFut: Future<Output = Result<R, E>>,
    {
        let config = &self.inner.config;
        let started = Instant::now();
        let outcome = Outcome::capture(create).await.map(Arc::new);
        let elapsed = started.elapsed();

        if let Some(threshold) = config.slow_call_threshold() {
            if elapsed > threshold {
                warn!(
                    group = %config.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow session create"
                );
            }
        }
        if let Some(message) = outcome.panic_message() {
            error!(
                group = %config.name,
                panic = message,
                "session create panicked, re-raising in every caller"
            );
        }

        self.session.created.resolve(outcome);
    }
}

impl<K, R, E> Drop for Creating<K, R, E> {
    fn drop(&mut self) {
        // No-op once `run` resolved the session.
        self.session.created.resolve(Outcome::Exited);
    }
}

/// A caller's `dispose`, boxed so attachments of different callers share a type.
type Dispose<R> = Box<dyn FnOnce(Arc<R>) -> BoxFuture<'static, ()> + Send>;

/// A caller's membership in a session. The last one to detach disposes it.
struct Attachment<K, R, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<K, R, E>>,
    key: K,
    session: Arc<Session<R, E>>,
    /// `None` once detached.
    dispose: Option<Dispose<R>>,
}

impl<K, R, E> Attachment<K, R, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Leaves the session. If this was the last caller, starts disposal and
    /// returns its task.
    fn detach(&mut self) -> Option<JoinHandle<()>> {
        let dispose = self.dispose.take()?;

        {
            let mut sessions = self.inner.sessions();
            let entry = sessions
                .get_mut(&self.key)
                .filter(|entry| Arc::ptr_eq(&entry.session, &self.session))?;
            entry.active -= 1;
            if entry.active > 0 {
                return None;
            }
            entry.disposing = true;
        }

        let retirement = Retirement {
            inner: Arc::clone(&self.inner),
            key: self.key.clone(),
            session: Arc::clone(&self.session),
        };
        match Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(retirement.dispose_with(dispose))),
            Err(_) => {
                debug!(
                    group = %self.inner.config.name,
                    "no runtime to dispose on, disposing inline"
                );
                futures::executor::block_on(retirement.dispose_with(dispose));
                None
            }
        }
    }
}

impl<K, R, E> Drop for Attachment<K, R, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Reached on panic or cancellation; the normal path detaches itself.
        let _ = self.detach();
    }
}

/// Unregisters a disposing session and wakes callers waiting for it, even
/// if the disposal task is dropped before it runs.
struct Retirement<K, R, E>
where
    K: Hash + Eq,
{
    inner: Arc<Inner<K, R, E>>,
    key: K,
    session: Arc<Session<R, E>>,
}

impl<K, R, E> Retirement<K, R, E>
where
    K: Hash + Eq,
{
    async fn dispose_with(self, dispose: Dispose<R>)
    where
        E: Clone,
    {
        let name = &self.inner.config.name;

        // Waits out a create that is still running when every caller left.
        if let Outcome::Returned(Ok(resource)) = self.session.created.wait().await {
            let disposal = AssertUnwindSafe(async move { dispose(resource).await })
                .catch_unwind()
                .await;
            if let Err(payload) = disposal {
                let panic = PanicError::from_payload(payload);
                error!(group = %name, panic = panic.message(), "session dispose panicked");
            }
        }

        debug!(group = %name, "session disposed");
    }
}

impl<K, R, E> Drop for Retirement<K, R, E>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        {
            let mut sessions = self.inner.sessions();
            let current = sessions
                .get(&self.key)
                .is_some_and(|entry| Arc::ptr_eq(&entry.session, &self.session));
            if current {
                sessions.remove(&self.key);
            }
        }
        self.session.idle.resolve(());
    }
}
