//! A one-shot broadcast cell: resolved once, awaited by any number of tasks.

use tokio::sync::{Notify, OnceCell};

/// A value that becomes available exactly once.
///
/// Every task awaiting [`WaitHandle::wait`] receives a clone of the value
/// passed to the first [`WaitHandle::resolve`].
#[derive(Debug)]
pub(crate) struct WaitHandle<T> {
    value: OnceCell<T>,
    notify: Notify,
}

impl<T> WaitHandle<T> {
    pub(crate) fn new() -> Self {
        Self {
            value: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    /// Publishes `value` and wakes every waiter.
    ///
    /// Returns `false` if the handle was already resolved; the first value wins.
    pub(crate) fn resolve(&self, value: T) -> bool {
        if self.value.set(value).is_err() {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// Waits until the handle is resolved and returns a clone of the value.
    pub(crate) async fn wait(&self) -> T
    where
        T: Clone,
    {
        loop {
            // Register before checking so a concurrent resolve cannot be missed.
            let notified = self.notify.notified();

            if let Some(value) = self.value.get() {
                return value.clone();
            }

            notified.await;
        }
    }
}
