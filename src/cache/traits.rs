//! Core types for the cache store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::key::CacheKey;

/// One cached query result, owned by the store.
///
/// Callers only ever see clones; the store replaces entries wholesale and never
/// edits `data` in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub data: Value,
  pub fetched_at: DateTime<Utc>,
  pub is_stale: bool,
}

/// Result from a read-through fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Network unavailable, serving the last cached value.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// A newer fetch or an optimistic write replaced our request; serve what the
  /// store holds now.
  pub fn superseded(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Superseded,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Our network response was discarded in favour of the store's current value
  Superseded,
  /// Offline mode - network failed, serving cached data
  Offline,
}

/// Notification sent to store subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
  /// Entry data was replaced (fetch, optimistic patch, or rollback)
  Updated(CacheKey),
  /// Entry was marked stale and should be refetched by mounted observers
  Invalidated(CacheKey),
  /// Entry was dropped from the store
  Removed(CacheKey),
}

impl StoreEvent {
  pub fn key(&self) -> &CacheKey {
    match self {
      StoreEvent::Updated(k) | StoreEvent::Invalidated(k) | StoreEvent::Removed(k) => k,
    }
  }
}
