//! The closed set of ways a unit of coalesced work can finish.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::error::PanicError;

/// How a unit of work finished.
///
/// The outcome is produced once by whoever ran the work and cloned to every
/// waiter, which then reproduces it locally with [`Outcome::settle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome<V, E> {
    /// The work returned a value or an ordinary error.
    Returned(Result<V, E>),
    /// The work panicked.
    Panicked(PanicError),
    /// The future driving the work was dropped before it finished.
    Exited,
}

impl<V, E> Outcome<V, E> {
    /// Runs `work` to completion, converting a panic into [`Outcome::Panicked`].
    ///
    /// Panics raised while *creating* the future are caught as well.
    pub(crate) async fn capture<F, Fut>(work: F) -> Self
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        match AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await
        {
            Ok(result) => Outcome::Returned(result),
            Err(payload) => Outcome::Panicked(PanicError::from_payload(payload)),
        }
    }

    /// Reproduces the outcome in the calling context.
    ///
    /// A panic is re-raised here; a silent exit yields `Ok(None)`.
    pub(crate) fn settle(self) -> Result<Option<V>, E> {
        match self {
            Outcome::Returned(result) => result.map(Some),
            Outcome::Panicked(panic) => panic.resume(),
            Outcome::Exited => Ok(None),
        }
    }

    /// Maps a returned value, leaving errors, panics and exits untouched.
    pub(crate) fn map<U>(self, f: impl FnOnce(V) -> U) -> Outcome<U, E> {
        match self {
            Outcome::Returned(result) => Outcome::Returned(result.map(f)),
            Outcome::Panicked(panic) => Outcome::Panicked(panic),
            Outcome::Exited => Outcome::Exited,
        }
    }

    /// Returns the panic message when the work panicked.
    pub(crate) fn panic_message(&self) -> Option<&str> {
        match self {
            Outcome::Panicked(panic) => Some(panic.message()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[tokio::test]
    async fn test_capture_returned_value() {
        let outcome = Outcome::<_, String>::capture(|| async { Ok(5) }).await;
        assert_eq!(outcome, Outcome::Returned(Ok(5)));
        assert_eq!(outcome.settle(), Ok(Some(5)));
    }

    #[tokio::test]
    async fn test_capture_returned_error() {
        let outcome = Outcome::<i32, _>::capture(|| async { Err("nope") }).await;
        assert_eq!(outcome.settle(), Err("nope"));
    }

    #[tokio::test]
    async fn test_capture_panic_inside_future() {
        let outcome = Outcome::<i32, ()>::capture(|| async {
            if true {
                panic!("inside");
            }
            Ok(0)
        })
        .await;
        assert_eq!(outcome.panic_message(), Some("inside"));
    }

    #[tokio::test]
    async fn test_capture_panic_while_building_future() {
        fn build() -> std::future::Ready<Result<i32, ()>> {
            panic!("before first poll")
        }

        let outcome = Outcome::capture(build).await;
        assert_eq!(outcome.panic_message(), Some("before first poll"));
    }

    #[test]
    fn test_map_only_touches_values() {
        let doubled = Outcome::<i32, ()>::Returned(Ok(4)).map(|v| v * 2);
        assert_eq!(doubled, Outcome::Returned(Ok(8)));

        let failed = Outcome::<i32, &str>::Returned(Err("no")).map(|v| v * 2);
        assert_eq!(failed, Outcome::Returned(Err("no")));

        assert_eq!(Outcome::<i32, ()>::Exited.map(|v| v * 2), Outcome::Exited);
    }

    #[test]
    fn test_settle_exited_is_silent() {
        assert_eq!(Outcome::<i32, ()>::Exited.settle(), Ok(None));
    }

    #[test]
    fn test_settle_panicked_reraises() {
        let outcome = Outcome::<i32, ()>::Panicked(PanicError::new("again"));
        let payload = catch_unwind(|| outcome.settle()).unwrap_err();
        let panic = payload.downcast_ref::<PanicError>().unwrap();
        assert_eq!(panic.message(), "again");
    }
}
