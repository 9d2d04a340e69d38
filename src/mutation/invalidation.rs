//! Marks cache entries stale once a mutation settles.

use tracing::debug;

use crate::cache::{CacheKey, CacheStore};

/// Static list of key prefixes declared alongside a mutation.
///
/// Prefixes are declared, not computed: invalidating a little too much costs
/// an extra round trip, invalidating too little leaves the UI wrong. The router
/// runs after success and after failure alike, since a write that errored may
/// still have partially committed server-side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationRouter {
  prefixes: Vec<CacheKey>,
}

impl InvalidationRouter {
  pub fn new(prefixes: impl IntoIterator<Item = CacheKey>) -> Self {
    Self {
      prefixes: prefixes.into_iter().collect(),
    }
  }

  pub fn prefixes(&self) -> &[CacheKey] {
    &self.prefixes
  }

  pub fn is_empty(&self) -> bool {
    self.prefixes.is_empty()
  }

  pub fn matches(&self, key: &CacheKey) -> bool {
    self.prefixes.iter().any(|p| key.starts_with(p))
  }

  /// Invalidate every entry under one of the prefixes. Idempotent.
  pub fn settle(&self, store: &CacheStore) -> Vec<CacheKey> {
    if self.prefixes.is_empty() {
      return Vec::new();
    }
    let keys = store.invalidate(|k| self.matches(k));
    debug!(prefixes = self.prefixes.len(), invalidated = keys.len(), "settled mutation");
    keys
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use serde_json::{json, Value};

  fn seeded_store() -> CacheStore {
    let store = CacheStore::new();
    store.set(CacheKey::new("admin-courses"), json!([{"id": 1}]));
    store.set(
      CacheKey::new("admin-courses").with("published"),
      json!([{"id": 1}]),
    );
    store.set(CacheKey::new("course").with(1i64), json!({"id": 1}));
    store
  }

  #[test]
  fn test_settle_invalidates_prefix_matches_only() {
    let store = seeded_store();
    let router = InvalidationRouter::new([CacheKey::new("admin-courses")]);

    let keys = router.settle(&store);

    assert_eq!(keys.len(), 2);
    assert!(store.get(&CacheKey::new("admin-courses")).unwrap().is_stale);
    assert!(!store.get(&CacheKey::new("course").with(1i64)).unwrap().is_stale);
  }

  #[test]
  fn test_empty_router_is_noop() {
    let store = seeded_store();
    assert!(InvalidationRouter::default().settle(&store).is_empty());
    assert!(store.matching(|_| true).iter().all(|e| !e.is_stale));
  }

  #[tokio::test]
  async fn test_settle_and_refetch_twice_is_idempotent() {
    let store = seeded_store();
    let router = InvalidationRouter::new([CacheKey::new("admin-courses")]);
    let key = CacheKey::new("admin-courses");
    let server = || async { Ok::<_, Error>(json!([{"id": 1, "is_free": true}])) };

    router.settle(&store);
    let _: crate::cache::CacheResult<Value> = store.fetch(&key, server).await.unwrap();
    let once = store.matching(|_| true);
    let once: Vec<(CacheKey, Value, bool)> =
      once.into_iter().map(|e| (e.key, e.data, e.is_stale)).collect();

    router.settle(&store);
    let _: crate::cache::CacheResult<Value> = store.fetch(&key, server).await.unwrap();
    router.settle(&store);
    let _: crate::cache::CacheResult<Value> = store.fetch(&key, server).await.unwrap();
    let twice: Vec<(CacheKey, Value, bool)> = store
      .matching(|_| true)
      .into_iter()
      .map(|e| (e.key, e.data, e.is_stale))
      .collect();

    assert_eq!(once, twice);
    assert_eq!(store.get(&key).unwrap().data, json!([{"id": 1, "is_free": true}]));
  }
}
