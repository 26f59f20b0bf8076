//! What callers of a [`CallGroup`](super::CallGroup) receive.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::shared::Shared;
use crate::outcome::Outcome;

/// The result of a coalesced call as seen by one caller.
#[derive(Debug)]
pub struct Response<V, E> {
    /// `Ok(Some(value))` or `Err(error)` as returned by the work.
    ///
    /// `Ok(None)` means the work was stopped before it returned (its task
    /// was aborted or its runtime shut down).
    pub result: Result<Option<V>, E>,
    /// Whether other callers received the same result.
    pub shared: Shared,
}

/// Sent to each attached caller when a call completes.
pub(crate) struct Delivery<V, E> {
    pub(crate) outcome: Outcome<V, E>,
    pub(crate) shared: Shared,
}

impl<V, E> Delivery<V, E> {
    /// Re-raises a panic, otherwise builds the caller's response.
    fn into_response(self) -> Response<V, E> {
        Response {
            result: self.outcome.settle(),
            shared: self.shared,
        }
    }
}

/// A registered call whose result has not been collected yet.
///
/// Returned by [`CallGroup::call_detached`](super::CallGroup::call_detached).
/// The caller is attached as soon as `call_detached` returns; awaiting the
/// `Pending` only collects the result. Dropping it detaches nobody else and
/// does not stop the work.
///
/// # Panics
///
/// Polling panics with a [`PanicError`](crate::PanicError) payload if the work
/// panicked.
#[must_use = "a pending call does nothing unless awaited"]
pub struct Pending<V, E> {
    receiver: oneshot::Receiver<Delivery<V, E>>,
}

impl<V, E> Pending<V, E> {
    pub(crate) fn new(receiver: oneshot::Receiver<Delivery<V, E>>) -> Self {
        Self { receiver }
    }
}

impl<V, E> Future for Pending<V, E> {
    type Output = Response<V, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(delivery)) => Poll::Ready(delivery.into_response()),
            // The call was torn down without a delivery; nothing was returned.
            Poll::Ready(Err(_)) => Poll::Ready(Response {
                result: Ok(None),
                shared: Shared::solo(),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<V, E> std::fmt::Debug for Pending<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}
