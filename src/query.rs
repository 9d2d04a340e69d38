//! Cache-backed observer for one query key (`useQuery`).
//!
//! A `Query<T>` never owns its data: the shared [`CacheStore`] does. The query
//! remembers the last value it read, and on every `poll()` catches up with the
//! store (optimistic patches, rollbacks, invalidations) and with its own
//! pending fetch.
//!
//! ```ignore
//! let mut lessons = courses.course_lessons(course_id);
//! lessons.fetch();
//!
//! // once per UI tick
//! if lessons.poll() {
//!   match lessons.state() {
//!     QueryState::Loading => show_spinner(),
//!     QueryState::Success(list) => show_lessons(list),
//!     QueryState::Error { message, retryable } => show_error(message, *retryable),
//!     QueryState::Idle => {}
//!   }
//! }
//! ```

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::cache::{CacheKey, CacheResult, CacheSource, CacheStore, StoreEvent};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  Idle,
  Loading,
  Success(T),
  /// `retryable` is set for transport failures, so the view can offer a retry.
  Error { message: String, retryable: bool },
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, Self::Loading)
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      Self::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      Self::Error { message, .. } => Some(message),
      _ => None,
    }
  }
}

type Fetcher<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;
type Outcome<T> = std::result::Result<CacheResult<T>, (String, bool)>;

fn task_ended() -> (String, bool) {
  ("fetch task ended without a result".to_string(), false)
}

/// Observer of one cache key.
///
/// While mounted, an invalidation of the key makes the next `poll()` refetch.
/// Updates to the entry are always re-read, mounted or not, so optimistic
/// writes and rollbacks show up without a round trip.
pub struct Query<T> {
  store: CacheStore,
  key: CacheKey,
  state: QueryState<T>,
  fetcher: Fetcher<T>,
  pending: Option<oneshot::Receiver<Outcome<T>>>,
  events: mpsc::UnboundedReceiver<StoreEvent>,
  source: Option<CacheSource>,
  fetched_at: Option<Instant>,
  mounted: bool,
}

impl<T> Query<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  pub fn new<F, Fut>(store: CacheStore, key: CacheKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let events = store.subscribe();
    Self {
      store,
      key,
      state: QueryState::Idle,
      fetcher: Box::new(move || -> BoxFuture<'static, Result<T>> { Box::pin(fetcher()) }),
      pending: None,
      events,
      source: None,
      fetched_at: None,
      mounted: true,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Where the last completed fetch got its data.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  /// Whether the store would go to the network for this key.
  pub fn is_stale(&self) -> bool {
    self
      .store
      .get(&self.key)
      .map_or(true, |entry| self.store.is_stale(&entry))
  }

  pub fn fetched_at(&self) -> Option<Instant> {
    self.fetched_at
  }

  /// The view went off screen; invalidations are ignored until `mount`.
  pub fn unmount(&mut self) {
    self.mounted = false;
  }

  pub fn mount(&mut self) {
    self.mounted = true;
  }

  /// Load through the cache. No-op while a fetch is pending.
  pub fn fetch(&mut self) {
    if self.pending.is_none() {
      self.spawn_fetch(false);
    }
  }

  /// Go to the network even if the entry is fresh. A pending fetch is
  /// superseded by the store and its result dropped here.
  pub fn refetch(&mut self) {
    self.spawn_fetch(true);
  }

  /// Catch up with the store and the pending fetch. Returns `true` when
  /// `state()` changed.
  pub fn poll(&mut self) -> bool {
    let changed = self.drain_events();
    self.poll_pending() || changed
  }

  fn poll_pending(&mut self) -> bool {
    let Some(pending) = self.pending.as_mut() else {
      return false;
    };
    let outcome = match pending.try_recv() {
      Ok(outcome) => outcome,
      Err(oneshot::error::TryRecvError::Empty) => return false,
      Err(oneshot::error::TryRecvError::Closed) => Err(task_ended()),
    };
    self.pending = None;
    self.complete(outcome);
    true
  }

  /// Wait until no fetch is pending, following refetches started by
  /// invalidations on the way, and return the final state.
  pub async fn settled(&mut self) -> &QueryState<T> {
    self.drain_events();
    while let Some(pending) = self.pending.take() {
      let outcome = pending.await.unwrap_or_else(|_| Err(task_ended()));
      self.complete(outcome);
      self.drain_events();
    }
    &self.state
  }

  fn complete(&mut self, outcome: Outcome<T>) {
    self.state = match outcome {
      Ok(result) => {
        self.source = Some(result.source);
        self.fetched_at = Some(Instant::now());
        QueryState::Success(result.data)
      }
      Err((message, retryable)) => QueryState::Error { message, retryable },
    };
  }

  fn drain_events(&mut self) -> bool {
    let (mut updated, mut invalidated) = (false, false);
    while let Ok(event) = self.events.try_recv() {
      match event {
        StoreEvent::Updated(k) if k == self.key => updated = true,
        StoreEvent::Invalidated(k) if k == self.key => invalidated = true,
        _ => {}
      }
    }
    // The store aborts a fetch that was in flight when the key was invalidated,
    // so a pending one is replaced rather than waited for.
    if invalidated && self.mounted {
      debug!(key = %self.key, "invalidated, refetching");
      let was_loading = self.state.is_loading();
      self.spawn_fetch(false);
      return !was_loading;
    }
    // A pending fetch will deliver whatever the store ends up holding.
    if self.pending.is_some() || !updated {
      return false;
    }
    match self.store.get_as::<T>(&self.key) {
      Ok(Some(data)) => self.state = QueryState::Success(data),
      Ok(None) => return false,
      Err(e) => {
        self.state = QueryState::Error {
          message: e.to_string(),
          retryable: false,
        }
      }
    }
    true
  }

  fn spawn_fetch(&mut self, force: bool) {
    let (tx, rx) = oneshot::channel();
    self.pending = Some(rx);
    self.state = QueryState::Loading;

    let store = self.store.clone();
    let key = self.key.clone();
    let request = (self.fetcher)();
    tokio::spawn(async move {
      let result = if force {
        store.refetch(&key, || request).await
      } else {
        store.fetch(&key, || request).await
      };
      let _ = tx.send(result.map_err(|e| (e.to_string(), e.is_retryable())));
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("source", &self.source)
      .field("mounted", &self.mounted)
      .finish_non_exhaustive()
  }
}
