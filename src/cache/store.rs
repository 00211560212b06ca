//! Concurrent key/value store with per-entry expiration.
//!
//! Every slot carries its own TTL. Expiry is checked lazily on access and
//! swept in bulk by [`TtlStore::sweep_expired`] (optionally from a background
//! task, see [`TtlStore::spawn_sweeper`]). An expired slot is never returned,
//! swept or not.
//!
//! Reads come in two flavours:
//!
//! - [`peek`](TtlStore::peek) leaves the slot untouched, so checking an entry
//!   never extends its lifetime.
//! - [`get`](TtlStore::get) touches the slot: recency is refreshed and the
//!   expiry slides forward by the slot's own TTL.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug)]
struct Slot<V> {
    value: V,
    ttl: Duration,
    expires_at: Instant,
    last_touched: Instant,
}

impl<V> Slot<V> {
    fn new(value: V, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            ttl,
            expires_at: now + ttl,
            last_touched: now,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    fn touch(&mut self, now: Instant) {
        self.last_touched = now;
        self.expires_at = now + self.ttl;
    }
}

/// A value read from the store together with its absolute expiry.
#[derive(Debug, Clone)]
pub struct Item<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Item<V> {
    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left until expiry, zero once the deadline has passed.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Concurrent TTL store.
///
/// All operations take `&self` and are safe for any number of concurrent
/// callers; no lock is held across an `.await` or returned to the caller.
#[derive(Debug)]
pub struct TtlStore<V> {
    slots: DashMap<String, Slot<V>>,
    max_entries: Option<usize>,
}

impl<V: Clone> Default for TtlStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TtlStore<V> {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            max_entries: None,
        }
    }

    /// Creates a store that holds at most `max_entries` live slots, evicting
    /// the least recently touched one when full.
    pub fn bounded(max_entries: usize) -> Self {
        Self {
            slots: DashMap::new(),
            max_entries: Some(max_entries.max(1)),
        }
    }

    /// Returns the live entry under `key` without refreshing it.
    pub fn peek(&self, key: &str) -> Option<Item<V>> {
        self.read(key, false)
    }

    /// Returns the live entry under `key`, refreshing its recency and expiry.
    pub fn get(&self, key: &str) -> Option<Item<V>> {
        self.read(key, true)
    }

    fn read(&self, key: &str, touch: bool) -> Option<Item<V>> {
        let now = Instant::now();
        if let Some(mut slot) = self.slots.get_mut(key) {
            if slot.is_live(now) {
                if touch {
                    slot.touch(now);
                }
                return Some(Item {
                    value: slot.value.clone(),
                    expires_at: slot.expires_at,
                });
            }
        }
        self.slots.remove_if(key, |_, slot| !slot.is_live(now));
        None
    }

    /// Stores `value` under `key` for `ttl`, replacing any previous slot.
    ///
    /// A zero `ttl` stores nothing and removes whatever was there.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        if ttl.is_zero() {
            self.slots.remove(&key);
            return;
        }
        let now = Instant::now();
        self.slots.insert(key, Slot::new(value, ttl, now));
        self.enforce_capacity();
    }

    /// Returns the live value under `key` (touching it), or stores and returns
    /// the value produced by `make`. Atomic per key: two concurrent callers
    /// never both run `make` for the same live slot.
    pub fn get_or_insert_with(&self, key: &str, ttl: Duration, make: impl FnOnce() -> V) -> V {
        self.replace_if(key, ttl, |_| false, make)
    }

    /// Like [`get_or_insert_with`](Self::get_or_insert_with), but a live value
    /// for which `stale` holds is replaced by `make` as well. The check and
    /// the replacement happen under one lock, so concurrent callers that find
    /// the same stale value replace it once and then share the replacement.
    pub fn replace_if(
        &self,
        key: &str,
        ttl: Duration,
        stale: impl FnOnce(&V) -> bool,
        make: impl FnOnce() -> V,
    ) -> V {
        let now = Instant::now();
        let (value, inserted) = match self.slots.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.is_live(now) && !stale(&slot.value) {
                    slot.touch(now);
                    (slot.value.clone(), false)
                } else {
                    let value = make();
                    occupied.insert(Slot::new(value.clone(), ttl, now));
                    (value, true)
                }
            }
            Entry::Vacant(vacant) => {
                let value = make();
                vacant.insert(Slot::new(value.clone(), ttl, now));
                (value, true)
            }
        };
        if inserted {
            if ttl.is_zero() {
                self.slots.remove(key);
            } else {
                self.enforce_capacity();
            }
        }
        value
    }

    /// Removes `key`. Returns whether a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.slots
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now))
    }

    /// Removes every entry whose key satisfies `predicate`, returning how many
    /// were removed.
    pub fn delete_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let before = self.slots.len();
        self.slots.retain(|key, _| !predicate(key));
        before.saturating_sub(self.slots.len())
    }

    pub fn delete_all(&self) {
        self.slots.clear();
    }

    /// Number of slots held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drops every expired slot, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            trace!(removed, remaining = self.slots.len(), "swept expired entries");
        }
        removed
    }

    fn enforce_capacity(&self) {
        let Some(max) = self.max_entries else {
            return;
        };
        while self.slots.len() > max {
            if self.sweep_expired() > 0 {
                continue;
            }
            let oldest = self
                .slots
                .iter()
                .min_by_key(|slot| slot.last_touched)
                .map(|slot| slot.key().clone());
            match oldest {
                Some(key) => {
                    debug!(%key, "evicting least recently used entry");
                    self.slots.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TtlStore<V> {
    /// Starts a background task that sweeps expired entries every `interval`.
    ///
    /// The task only holds a weak reference: it ends by itself once the store
    /// is dropped, and immediately when the returned [`Sweeper`] is stopped or
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Sweeper {
        let store: Weak<Self> = Arc::downgrade(self);
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        let handle = tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.sweep_expired();
            }
        });
        debug!(interval = ?interval, "store sweeper started");
        Sweeper { handle }
    }
}

/// Handle to a running background sweep.
#[derive(Debug)]
pub struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub fn stop(self) {
        // Drop aborts.
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
