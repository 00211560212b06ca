//! Response caching around one shared TTL store, with single-flight
//! coalescing of concurrent misses.
//!
//! One [`TtlStore<StoredValue>`](TtlStore) is shared by the whole process.
//! Responses, rate-limit buckets and compiled filter patterns all live in it,
//! each under its own [`Namespace`].

pub mod coalesce;
pub mod entry;
pub mod middleware;
pub mod recorder;
pub mod store;

pub use coalesce::{CoalesceError, Coalescer, Role};
pub use entry::{CacheEntry, Namespace, StoredValue};
pub use middleware::{CacheKey, CacheKeyError, CacheMiddleware, format_ttl};
pub use recorder::ResponseRecorder;
pub use store::{Item, Sweeper, TtlStore};

/// The store type every subsystem shares.
pub type SharedStore = std::sync::Arc<TtlStore<StoredValue>>;
