//! Leader-election lock that groups concurrent acquisitions into batches.
//!
//! Every call to [`BatchLock::acquire`] joins the batch that is currently
//! forming. The first caller of a batch is elected [`Leader`]: it waits for
//! the previous leader to finish, computes a value and hands it to the rest
//! of its batch with [`Leader::release`]. Everyone else is a follower and
//! receives that value without doing any work.
//!
//! # Pipelining
//!
//! A leader opens a fresh batch the moment it is elected. Callers arriving
//! while it works therefore join the *next* batch, whose first arrival
//! becomes the next leader and queues behind the current one. A caller never
//! receives a value whose computation started before it arrived.
//!
//! # Contract
//!
//! A [`Leader`] must be released. Dropping one without calling
//! [`Leader::release`] lets the next batch proceed but leaves the followers
//! of the abandoned batch waiting forever, just like a mutex that is never
//! unlocked. Cancelling [`BatchLock::acquire`] is always safe: followers of a
//! batch whose would-be leader was cancelled before election re-join a new
//! batch.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{Mutex, MutexGuard};

use crate::wait::WaitHandle;

/// What a batch's followers are woken with.
#[derive(Debug, Clone)]
enum Handoff<T> {
    Released(T),
    /// The elected caller was cancelled before it became leader.
    Abandoned,
}

/// One batch: the callers that loaded the same generation token.
struct Generation<T> {
    arrivals: AtomicUsize,
    handoff: WaitHandle<Handoff<T>>,
}

impl<T> Generation<T> {
    fn new() -> Self {
        Self {
            arrivals: AtomicUsize::new(0),
            handoff: WaitHandle::new(),
        }
    }
}

/// The role a caller was given by [`BatchLock::acquire`].
#[must_use = "a leader must release its batch"]
pub enum Role<'a, T> {
    /// The caller must compute the batch's value and release it.
    Leader(Leader<'a, T>),
    /// The batch's leader already produced this value.
    Follower(T),
}

impl<T> Role<'_, T> {
    /// Returns `true` if the caller was elected leader.
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }
}

impl<T: fmt::Debug> fmt::Debug for Role<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader(leader) => f.debug_tuple("Leader").field(leader).finish(),
            Role::Follower(value) => f.debug_tuple("Follower").field(value).finish(),
        }
    }
}

/// Exclusive right to produce the value for one batch.
#[must_use = "dropping a leader without releasing it strands its followers"]
pub struct Leader<'a, T> {
    batch: Arc<Generation<T>>,
    _leadership: MutexGuard<'a, ()>,
}

impl<T> Leader<'_, T> {
    /// Number of callers that have joined this batch as followers so far.
    pub fn followers(&self) -> usize {
        self.batch.arrivals.load(Ordering::Acquire).saturating_sub(1)
    }

    /// Hands `value` to every follower of this batch and gives up leadership.
    pub fn release(self, value: T) {
        self.batch.handoff.resolve(Handoff::Released(value));
        // `_leadership` is dropped after the followers were woken.
    }
}

impl<T> fmt::Debug for Leader<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leader")
            .field("followers", &self.followers())
            .finish()
    }
}

/// A caller that opened a batch and is waiting to become its leader.
///
/// If it is dropped before election, the batch is closed and its followers
/// are told to try again.
struct Candidacy<'a, T> {
    lock: &'a BatchLock<T>,
    generation: Arc<Generation<T>>,
    elected: bool,
}

impl<'a, T> Candidacy<'a, T> {
    fn elect(mut self, leadership: MutexGuard<'a, ()>) -> Leader<'a, T> {
        self.elected = true;
        // Callers from here on form the next batch.
        self.lock.current.store(Arc::new(Generation::new()));
        Leader {
            batch: Arc::clone(&self.generation),
            _leadership: leadership,
        }
    }
}

impl<T> Drop for Candidacy<'_, T> {
    fn drop(&mut self) {
        if self.elected {
            return;
        }
        self.lock
            .current
            .compare_and_swap(&self.generation, Arc::new(Generation::new()));
        self.generation.handoff.resolve(Handoff::Abandoned);
    }
}

/// A reusable batching leader-election lock.
///
/// `T` is the value a leader hands to its followers; followers receive
/// clones of it.
///
/// # Example
///
/// ```ignore
/// use rsflight_core::{BatchLock, Role};
///
/// let lock = BatchLock::new();
/// let snapshot = match lock.acquire().await {
///     Role::Leader(leader) => {
///         let snapshot = load_snapshot().await;
///         leader.release(snapshot.clone());
///         snapshot
///     }
///     Role::Follower(snapshot) => snapshot,
/// };
/// ```
pub struct BatchLock<T> {
    current: ArcSwap<Generation<T>>,
    leadership: Mutex<()>,
}

impl<T> BatchLock<T> {
    /// Creates a lock with an empty batch.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Generation::new()),
            leadership: Mutex::new(()),
        }
    }

    /// Number of callers that have joined the batch currently forming.
    pub fn waiting(&self) -> usize {
        self.current.load().arrivals.load(Ordering::Acquire)
    }
}

impl<T: Clone> BatchLock<T> {
    /// Joins the current batch.
    ///
    /// Returns [`Role::Leader`] to exactly one caller per batch, once every
    /// earlier leader has released; all other callers of the batch wait and
    /// get [`Role::Follower`] with the value their leader released.
    pub async fn acquire(&self) -> Role<'_, T> {
        loop {
            let generation = self.current.load_full();

            if generation.arrivals.fetch_add(1, Ordering::AcqRel) > 0 {
                match generation.handoff.wait().await {
                    Handoff::Released(value) => return Role::Follower(value),
                    Handoff::Abandoned => continue,
                }
            }

            let candidacy = Candidacy {
                lock: self,
                generation,
                elected: false,
            };
            let leadership = self.leadership.lock().await;
            return Role::Leader(candidacy.elect(leadership));
        }
    }
}

impl<T> Default for BatchLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BatchLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchLock")
            .field("waiting", &self.waiting())
            .finish()
    }
}
