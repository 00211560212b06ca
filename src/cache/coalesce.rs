//! Single-flight execution: at most one computation per key is in flight.
//!
//! The first caller for a key (the leader) starts the computation on its own
//! task; everyone arriving while it runs (followers) awaits the same shared
//! result. Because the computation does not live inside any caller's future,
//! dropping a caller, leader included, never cancels it for the others.
//!
//! A group is released when its computation finishes (successfully or not),
//! so the next caller always starts fresh and a failure is never replayed.
//! A group that stays idle, with no new joiners, for longer than the forget
//! period is released early so a stuck computation cannot block a key
//! forever; callers already waiting on it keep waiting for its result.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error};

/// Failure of a coalesced computation, delivered to every waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CoalesceError {
    #[error("coalesced computation panicked")]
    Panicked,

    #[error("coalesced computation was cancelled before completing")]
    Cancelled,
}

/// Whether a caller started the computation or joined one already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn is_leader(self) -> bool {
        self == Role::Leader
    }
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, CoalesceError>>>;

struct Group<T: Clone> {
    generation: u64,
    result: SharedResult<T>,
    /// Milliseconds since [`Coalescer::epoch`] of the last join.
    last_join: AtomicU64,
}

type Groups<T> = Arc<DashMap<String, Group<T>>>;

/// Removes a group when the task running its computation ends, however it
/// ends. Only the generation that created it is removed, so a group that was
/// forgotten and restarted under the same key is left alone.
struct Release<T: Clone> {
    groups: Groups<T>,
    key: String,
    generation: u64,
}

impl<T: Clone> Drop for Release<T> {
    fn drop(&mut self) {
        self.groups
            .remove_if(&self.key, |_, group| group.generation == self.generation);
    }
}

pub struct Coalescer<T: Clone> {
    groups: Groups<T>,
    next_generation: AtomicU64,
    forget_after: Duration,
    epoch: Instant,
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a coalescer whose idle groups are released after
    /// `forget_after`. A zero duration disables the forget timer: a group then
    /// lives exactly as long as its computation.
    pub fn new(forget_after: Duration) -> Self {
        Self {
            groups: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            forget_after,
            epoch: Instant::now(),
        }
    }

    /// Runs `computation` for `key`, or joins the one already running.
    ///
    /// Every caller of one group receives a clone of the same result. When
    /// this caller joined an existing group, `computation` is dropped unrun.
    pub async fn run<F>(&self, key: &str, computation: F) -> (Role, Result<T, CoalesceError>)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (role, result) = match self.groups.entry(key.to_owned()) {
            Entry::Occupied(occupied) => {
                let group = occupied.get();
                group.last_join.store(self.now_millis(), Ordering::Relaxed);
                (Role::Follower, group.result.clone())
            }
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let result = self.start(key, generation, computation);
                vacant.insert(Group {
                    generation,
                    result: result.clone(),
                    last_join: AtomicU64::new(self.now_millis()),
                });
                (Role::Leader, result)
            }
        };

        debug!(key, ?role, "joined coalescing group");
        (role, result.await)
    }

    /// Releases the group for `key` now, letting the next caller start over.
    /// Callers already waiting keep their result.
    pub fn forget(&self, key: &str) -> bool {
        self.groups.remove(key).is_some()
    }

    /// Number of keys with a group in flight.
    pub fn in_flight(&self) -> usize {
        self.groups.len()
    }

    fn start<F>(&self, key: &str, generation: u64, computation: F) -> SharedResult<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let release = Release {
            groups: Arc::clone(&self.groups),
            key: key.to_owned(),
            generation,
        };
        let forget = forget_when_idle(
            Arc::clone(&self.groups),
            key.to_owned(),
            generation,
            self.epoch,
            self.forget_after,
        );

        tokio::spawn(async move {
            let computation = AssertUnwindSafe(computation).catch_unwind();
            tokio::pin!(computation);
            // The forget timer lives inside the computation's task, so it
            // never outlasts the computation.
            let outcome = tokio::select! {
                outcome = &mut computation => outcome,
                () = forget => computation.await,
            };
            let outcome = outcome.map_err(|_| {
                error!(key = %release.key, "coalesced computation panicked");
                CoalesceError::Panicked
            });
            // The group goes away before anyone sees the result, so a waiter
            // that immediately retries starts a new computation.
            drop(release);
            let _ = sender.send(outcome);
        });

        receiver
            .map(|received| received.unwrap_or(Err(CoalesceError::Cancelled)))
            .boxed()
            .shared()
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Resolves once the group has gone `forget_after` without a join and has
/// been removed. Never resolves when the timer is disabled or the group is
/// already gone.
async fn forget_when_idle<T: Clone>(
    groups: Groups<T>,
    key: String,
    generation: u64,
    epoch: Instant,
    forget_after: Duration,
) {
    if forget_after.is_zero() {
        return std::future::pending().await;
    }
    loop {
        let last_join = groups
            .get(&key)
            .filter(|group| group.generation == generation)
            .map(|group| group.last_join.load(Ordering::Relaxed));
        let Some(last_join) = last_join else {
            return std::future::pending().await;
        };
        let deadline = epoch + Duration::from_millis(last_join) + forget_after;
        if Instant::now() >= deadline {
            if groups
                .remove_if(&key, |_, group| group.generation == generation)
                .is_some()
            {
                debug!(%key, "forgot idle coalescing group");
            }
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}
