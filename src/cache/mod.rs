//! In-memory cache of server-derived data.
//!
//! This module provides the store the rest of the engine writes through:
//! - Entries addressed by structural [`CacheKey`]s with a prefix hierarchy
//! - Freshness tracking (explicit invalidation plus a stale-time window)
//! - Read-through fetching with offline fallback
//! - Cancellable in-flight fetches, so a slow read never clobbers an optimistic write
//! - Subscriptions for observers that need to re-read after a change

mod key;
mod store;
mod traits;

pub use key::{CacheKey, KeyPart};
pub use store::CacheStore;
pub use traits::{CacheEntry, CacheResult, CacheSource, StoreEvent};
