//! In-memory, key-addressed store of server-derived data.

use chrono::{DateTime, Duration, Utc};
use futures::future::{AbortHandle, Aborted};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::traits::{CacheEntry, CacheResult, StoreEvent};
use crate::error::{Error, Result};

struct InFlight {
  generation: u64,
  abort: AbortHandle,
}

#[derive(Default)]
struct StoreInner {
  entries: BTreeMap<CacheKey, CacheEntry>,
  in_flight: HashMap<CacheKey, InFlight>,
  next_generation: u64,
  subscribers: Vec<mpsc::UnboundedSender<StoreEvent>>,
}

impl StoreInner {
  fn notify(&mut self, event: StoreEvent) {
    self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
  }

  fn write(&mut self, key: CacheKey, data: Value) {
    let entry = CacheEntry {
      key: key.clone(),
      data,
      fetched_at: Utc::now(),
      is_stale: false,
    };
    self.entries.insert(key.clone(), entry);
    self.notify(StoreEvent::Updated(key));
  }

  /// Clear the in-flight slot if it still belongs to `generation`.
  fn finish(&mut self, key: &CacheKey, generation: u64) -> bool {
    let current = self
      .in_flight
      .get(key)
      .is_some_and(|f| f.generation == generation);
    if current {
      self.in_flight.remove(key);
    }
    current
  }
}

/// Process-wide cache of query results.
///
/// This is an explicit handle rather than a global: create one at startup and
/// clone it into every component that needs it. Clones share the same entries.
///
/// Entry data is only ever replaced, never edited in place, which is what makes
/// snapshot-based rollback in the mutation engine correct.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<Mutex<StoreInner>>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new()
  }
}

impl CacheStore {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(StoreInner::default())),
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the freshness window for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  fn lock(&self) -> MutexGuard<'_, StoreInner> {
    // Nothing panics while holding the lock, so a poisoned store is still consistent.
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Whether an entry needs refetching: explicitly invalidated or past its window.
  pub fn is_stale(&self, entry: &CacheEntry) -> bool {
    entry.is_stale || self.is_expired(entry.fetched_at)
  }

  fn is_expired(&self, fetched_at: DateTime<Utc>) -> bool {
    Utc::now() - fetched_at > self.stale_time
  }

  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.lock().entries.get(key).cloned()
  }

  /// Typed read of an entry's data.
  pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
    match self.get(key) {
      Some(entry) => Ok(Some(serde_json::from_value(entry.data)?)),
      None => Ok(None),
    }
  }

  /// Replace the entry for `key` and clear its stale flag.
  pub fn set(&self, key: CacheKey, data: Value) {
    self.lock().write(key, data);
  }

  pub fn set_as<T: Serialize>(&self, key: CacheKey, data: &T) -> Result<()> {
    let value = serde_json::to_value(data)?;
    self.set(key, value);
    Ok(())
  }

  /// Replace several entries under one lock so no reader observes half of them.
  pub fn set_all(&self, values: Vec<(CacheKey, Value)>) {
    let mut inner = self.lock();
    for (key, data) in values {
      inner.write(key, data);
    }
  }

  /// Put a previously captured entry back exactly as it was.
  pub fn restore(&self, entry: CacheEntry) {
    let mut inner = self.lock();
    let key = entry.key.clone();
    inner.entries.insert(key.clone(), entry);
    inner.notify(StoreEvent::Updated(key));
  }

  /// Clones of every entry whose key satisfies `predicate`.
  pub fn matching<P>(&self, predicate: P) -> Vec<CacheEntry>
  where
    P: Fn(&CacheKey) -> bool,
  {
    self
      .lock()
      .entries
      .values()
      .filter(|e| predicate(&e.key))
      .cloned()
      .collect()
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    self.lock().entries.keys().cloned().collect()
  }

  /// Mark all matching entries stale; mounted observers refetch on their next poll.
  ///
  /// Fetches already in flight for a matching key are aborted: their response
  /// may predate the change being invalidated for, and writing it would clear
  /// the stale mark.
  pub fn invalidate<P>(&self, predicate: P) -> Vec<CacheKey>
  where
    P: Fn(&CacheKey) -> bool,
  {
    let mut inner = self.lock();
    let mut keys: Vec<CacheKey> = inner
      .entries
      .keys()
      .filter(|k| predicate(k))
      .cloned()
      .collect();
    let fetching: Vec<CacheKey> = inner
      .in_flight
      .keys()
      .filter(|k| predicate(k))
      .cloned()
      .collect();

    for key in fetching {
      if let Some(flight) = inner.in_flight.remove(&key) {
        flight.abort.abort();
        debug!(key = %key, "aborted fetch started before invalidation");
      }
      if !inner.entries.contains_key(&key) {
        keys.push(key);
      }
    }

    for key in &keys {
      if let Some(entry) = inner.entries.get_mut(key) {
        entry.is_stale = true;
      }
      inner.notify(StoreEvent::Invalidated(key.clone()));
    }

    if !keys.is_empty() {
      debug!(count = keys.len(), "invalidated cache entries");
    }
    keys
  }

  /// Abort in-flight fetches for matching keys. Their responses are dropped.
  pub fn cancel<P>(&self, predicate: P) -> usize
  where
    P: Fn(&CacheKey) -> bool,
  {
    let mut inner = self.lock();
    let keys: Vec<CacheKey> = inner
      .in_flight
      .keys()
      .filter(|k| predicate(k))
      .cloned()
      .collect();

    for key in &keys {
      if let Some(flight) = inner.in_flight.remove(key) {
        flight.abort.abort();
        debug!(key = %key, "cancelled in-flight fetch");
      }
    }
    keys.len()
  }

  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self.lock().in_flight.contains_key(key)
  }

  /// Drop matching entries (cancelling their fetches).
  pub fn remove<P>(&self, predicate: P) -> usize
  where
    P: Fn(&CacheKey) -> bool,
  {
    self.cancel(&predicate);
    let mut inner = self.lock();
    let keys: Vec<CacheKey> = inner
      .entries
      .keys()
      .filter(|k| predicate(k))
      .cloned()
      .collect();
    for key in &keys {
      inner.entries.remove(key);
      inner.notify(StoreEvent::Removed(key.clone()));
    }
    keys.len()
  }

  pub fn clear(&self) -> usize {
    self.remove(|_| true)
  }

  /// Receive a notification for every update, invalidation and removal.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.lock().subscribers.push(tx);
    rx
  }

  /// Read-through fetch.
  ///
  /// 1. Fresh entry - return it without touching the network
  /// 2. Stale or missing - fetch, store, return
  /// 3. Network failure with a cached entry - return it (offline mode)
  /// 4. Cancelled or superseded - return whatever the store now holds
  ///
  /// A newer fetch for the same key supersedes this one, and `cancel` aborts it;
  /// either way the late response is never written.
  pub async fn fetch<T, F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(entry) = self.get(key) {
      if !self.is_stale(&entry) {
        let data = serde_json::from_value(entry.data)?;
        return Ok(CacheResult::from_cache(data, entry.fetched_at));
      }
    }
    self.fetch_network(key, fetcher).await
  }

  /// Like [`fetch`](Self::fetch) but always goes to the network.
  pub async fn refetch<T, F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.fetch_network(key, fetcher).await
  }

  async fn fetch_network<T, F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let (future, abort) = futures::future::abortable(fetcher());
    let generation = {
      let mut inner = self.lock();
      inner.next_generation += 1;
      let generation = inner.next_generation;
      let previous = inner
        .in_flight
        .insert(key.clone(), InFlight { generation, abort });
      if let Some(previous) = previous {
        previous.abort.abort();
      }
      generation
    };

    match future.await {
      Ok(Ok(data)) => {
        let value = serde_json::to_value(&data);
        let applied = {
          let mut inner = self.lock();
          let current = inner.finish(key, generation);
          match (&value, current) {
            (Ok(value), true) => {
              inner.write(key.clone(), value.clone());
              true
            }
            _ => false,
          }
        };
        value?;

        if applied {
          Ok(CacheResult::from_network(data))
        } else {
          debug!(key = %key, "discarding superseded fetch response");
          self.current_or_cancelled(key)
        }
      }
      Ok(Err(e)) => {
        self.lock().finish(key, generation);
        match self.get(key) {
          Some(entry) => {
            warn!(key = %key, error = %e, "fetch failed, serving cached data");
            let data = serde_json::from_value(entry.data)?;
            Ok(CacheResult::offline(data, entry.fetched_at))
          }
          None => Err(e),
        }
      }
      Err(Aborted) => {
        self.lock().finish(key, generation);
        self.current_or_cancelled(key)
      }
    }
  }

  fn current_or_cancelled<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<CacheResult<T>> {
    match self.get(key) {
      Some(entry) => {
        let data = serde_json::from_value(entry.data)?;
        Ok(CacheResult::superseded(data, entry.fetched_at))
      }
      None => Err(Error::Cancelled(key.to_string())),
    }
  }
}
