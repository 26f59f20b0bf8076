//! Reference-counted reporting of results handed to several callers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tells a caller whether its result was also delivered to other callers,
/// and lets the callers find out together when the last of them is done
/// with it.
///
/// Every caller attached to one call gets its own `Shared`; all of them
/// count down the same counter, which starts at the number of callers.
/// Dropping a `Shared` without calling [`release`](Shared::release) counts
/// as releasing it, so a caller that stopped waiting, or discarded its
/// response, never holds the others back from reaching `0`.
///
/// ```ignore
/// let response = group.call(key, || fetch(key)).await;
/// let payload = response.result?;
/// // ... use payload ...
/// if response.shared.release() == 0 {
///     cleanup(payload); // last consumer
/// }
/// ```
#[derive(Debug)]
pub struct Shared {
    shared: bool,
    /// `None` once released.
    remaining: Option<Arc<AtomicUsize>>,
}

impl Shared {
    /// Creates one handle per caller, all counting down from `callers`.
    pub(crate) fn fan_out(callers: usize) -> impl Iterator<Item = Shared> {
        let remaining = Arc::new(AtomicUsize::new(callers));
        let shared = callers > 1;
        (0..callers).map(move |_| Shared {
            shared,
            remaining: Some(Arc::clone(&remaining)),
        })
    }

    /// A handle for a result nobody else received.
    pub(crate) fn solo() -> Self {
        Self {
            shared: false,
            remaining: Some(Arc::new(AtomicUsize::new(1))),
        }
    }

    /// Returns `true` if more than one caller received this result.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Marks this caller as done with the result.
    ///
    /// Returns how many callers still hold it; `0` means this was the last.
    pub fn release(mut self) -> usize {
        self.count_down()
    }

    fn count_down(&mut self) -> usize {
        match self.remaining.take() {
            Some(remaining) => remaining.fetch_sub(1, Ordering::AcqRel) - 1,
            None => 0,
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.count_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solo_is_not_shared() {
        let shared = Shared::solo();
        assert!(!shared.is_shared());
        assert_eq!(shared.release(), 0);
    }

    #[test]
    fn test_single_caller_fan_out_is_not_shared() {
        let mut handles: Vec<_> = Shared::fan_out(1).collect();
        assert_eq!(handles.len(), 1);
        let only = handles.pop().unwrap();
        assert!(!only.is_shared());
        assert_eq!(only.release(), 0);
    }

    #[test]
    fn test_fan_out_counts_down_to_zero() {
        let handles: Vec<_> = Shared::fan_out(3).collect();
        assert!(handles.iter().all(Shared::is_shared));

        let remaining: Vec<_> = handles.into_iter().map(Shared::release).collect();
        assert_eq!(remaining, vec![2, 1, 0]);
    }

    #[test]
    fn test_dropped_handle_counts_as_released() {
        let mut handles: Vec<_> = Shared::fan_out(3).collect();
        drop(handles.pop());

        let remaining: Vec<_> = handles.into_iter().map(Shared::release).collect();
        assert_eq!(remaining, vec![1, 0]);
    }

    #[test]
    fn test_release_from_many_threads_reaches_zero_once() {
        let handles: Vec<_> = Shared::fan_out(16).collect();

        let zeros = std::thread::scope(|scope| {
            let joins: Vec<_> = handles
                .into_iter()
                .map(|shared| scope.spawn(move || shared.release()))
                .collect();
            joins
                .into_iter()
                .map(|join| join.join().unwrap())
                .filter(|&remaining| remaining == 0)
                .count()
        });

        assert_eq!(zeros, 1);
    }
}
