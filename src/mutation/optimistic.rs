//! Optimistic mutations: patch the cache now, write in the background, roll
//! back on failure, invalidate on settle.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::executor::{MutationExecutor, MutationHooks};
use super::invalidation::InvalidationRouter;
use super::patch::Patch;
use crate::api::ApiResponse;
use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::error::{Error, Result};

static MUTATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of one optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Pending,
  Success,
  RolledBack,
}

/// Undo information for one in-flight mutation.
///
/// The undo is data (the captured entries), not an inverse function, so
/// restoring is an overwrite and cannot disagree with the patch.
#[derive(Debug, Clone)]
pub struct PendingMutation {
  pub id: u64,
  pub target_keys: Vec<CacheKey>,
  pub previous_snapshots: BTreeMap<CacheKey, CacheEntry>,
  pub status: MutationStatus,
}

impl PendingMutation {
  fn new(target_keys: Vec<CacheKey>, snapshots: Vec<CacheEntry>) -> Self {
    Self {
      id: MUTATION_COUNTER.fetch_add(1, Ordering::SeqCst),
      target_keys,
      previous_snapshots: snapshots.into_iter().map(|e| (e.key.clone(), e)).collect(),
      status: MutationStatus::Pending,
    }
  }

  /// The optimistic values are now authoritative; drop the snapshots.
  fn commit(&mut self) {
    self.previous_snapshots.clear();
    self.status = MutationStatus::Success;
  }

  /// Restore every captured entry.
  fn rollback(&mut self, store: &CacheStore) {
    for (_, entry) in std::mem::take(&mut self.previous_snapshots) {
      store.restore(entry);
    }
    self.status = MutationStatus::RolledBack;
  }
}

/// Holds a [`PendingMutation`] while its write is on the wire.
///
/// If the `mutate_async` future is dropped before the write settles (a
/// timeout, a losing `select!` branch, an aborted task) the patch is rolled
/// back and the mutation's prefixes are invalidated here, since neither
/// `on_success` nor `on_error` will run.
struct PendingGuard {
  pending: PendingMutation,
  name: Arc<str>,
  store: CacheStore,
  router: InvalidationRouter,
}

impl Drop for PendingGuard {
  fn drop(&mut self) {
    if self.pending.status != MutationStatus::Pending {
      return;
    }
    warn!(
      mutation = %self.name,
      id = self.pending.id,
      "mutation dropped before settling, rolling back optimistic update"
    );
    self.pending.rollback(&self.store);
    self.router.settle(&self.store);
  }
}

/// Per-(operation, entity) gates that serialise non-commutative mutations.
#[derive(Clone, Default)]
struct SerialGates {
  gates: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SerialGates {
  async fn acquire(&self, key: String) -> OwnedMutexGuard<()> {
    let gate = {
      let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
      // Only the map holds idle gates.
      gates.retain(|_, gate| Arc::strong_count(gate) > 1);
      gates.entry(key).or_default().clone()
    };
    gate.lock_owned().await
  }
}

/// Factory for mutations sharing one store and one set of serial gates.
#[derive(Clone)]
pub struct MutationClient {
  store: CacheStore,
  executor: MutationExecutor,
  gates: SerialGates,
}

impl MutationClient {
  pub fn new(store: CacheStore) -> Self {
    Self {
      store,
      executor: MutationExecutor::new(),
      gates: SerialGates::default(),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  /// Declare a mutation named `name` performing `write`.
  pub fn mutation<V, R, F, Fut>(&self, name: impl Into<String>, write: F) -> Mutation<V, R>
  where
    V: Clone + Send + Sync + 'static,
    R: DeserializeOwned + Send + Sync + 'static,
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ApiResponse<R>>> + Send + 'static,
  {
    Mutation {
      name: Arc::from(name.into()),
      store: self.store.clone(),
      executor: self.executor,
      gates: self.gates.clone(),
      write: Arc::new(move |v| -> BoxFuture<'static, Result<ApiResponse<R>>> {
        Box::pin(write(v))
      }),
      targets: None,
      patch: None,
      router: InvalidationRouter::default(),
      serial: None,
      on_success: None,
      on_error: None,
      on_settled: None,
      in_flight: Arc::new(AtomicUsize::new(0)),
    }
  }
}

type WriteFn<V, R> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<ApiResponse<R>>> + Send + Sync>;
type KeysFn<V> = Arc<dyn Fn(&V) -> Vec<CacheKey> + Send + Sync>;
type PatchFn<V> = Arc<dyn Fn(&V) -> Patch + Send + Sync>;
type SerialFn<V> = Arc<dyn Fn(&V) -> String + Send + Sync>;
type SuccessFn<V, R> = Arc<dyn Fn(&R, &V) + Send + Sync>;
type ErrorFn<V> = Arc<dyn Fn(&Error, &V) + Send + Sync>;
type SettledFn<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// A declared write with optional optimistic patch (`useMutation`).
///
/// ```ignore
/// let toggle = client
///   .mutation("toggle-free", move |(id, free)| api.set_free(id, free))
///   .targets(|(id, _)| vec![CacheKey::new("admin-courses"), CacheKey::new("course").with(*id)])
///   .optimistic(|(id, free)| Patch::set_field(id, "/pricing/is_free", json!(free)))
///   .invalidates([CacheKey::new("admin-courses")]);
/// toggle.mutate((7, true));
/// ```
pub struct Mutation<V, R> {
  name: Arc<str>,
  store: CacheStore,
  executor: MutationExecutor,
  gates: SerialGates,
  write: WriteFn<V, R>,
  targets: Option<KeysFn<V>>,
  patch: Option<PatchFn<V>>,
  router: InvalidationRouter,
  serial: Option<SerialFn<V>>,
  on_success: Option<SuccessFn<V, R>>,
  on_error: Option<ErrorFn<V>>,
  on_settled: Option<SettledFn<V>>,
  in_flight: Arc<AtomicUsize>,
}

impl<V, R> Clone for Mutation<V, R> {
  fn clone(&self) -> Self {
    Self {
      name: Arc::clone(&self.name),
      store: self.store.clone(),
      executor: self.executor,
      gates: self.gates.clone(),
      write: Arc::clone(&self.write),
      targets: self.targets.clone(),
      patch: self.patch.clone(),
      router: self.router.clone(),
      serial: self.serial.clone(),
      on_success: self.on_success.clone(),
      on_error: self.on_error.clone(),
      on_settled: self.on_settled.clone(),
      in_flight: Arc::clone(&self.in_flight),
    }
  }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
  fn enter(counter: &Arc<AtomicUsize>) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(Arc::clone(counter))
  }
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl<V, R> Mutation<V, R>
where
  V: Clone + Send + Sync + 'static,
  R: DeserializeOwned + Send + Sync + 'static,
{
  /// Cache keys (matched as prefixes) the optimistic patch applies to.
  pub fn targets<F>(mut self, targets: F) -> Self
  where
    F: Fn(&V) -> Vec<CacheKey> + Send + Sync + 'static,
  {
    self.targets = Some(Arc::new(targets));
    self
  }

  /// Patch applied to every target entry before the write is sent.
  pub fn optimistic<F>(mut self, patch: F) -> Self
  where
    F: Fn(&V) -> Patch + Send + Sync + 'static,
  {
    self.patch = Some(Arc::new(patch));
    self
  }

  /// Key prefixes invalidated when the mutation settles.
  pub fn invalidates(mut self, prefixes: impl IntoIterator<Item = CacheKey>) -> Self {
    self.router = InvalidationRouter::new(prefixes);
    self
  }

  /// Serialise mutations of this operation that return the same entity id.
  /// Later calls wait for earlier ones instead of interleaving.
  pub fn serialize_by<F>(mut self, entity: F) -> Self
  where
    F: Fn(&V) -> String + Send + Sync + 'static,
  {
    self.serial = Some(Arc::new(entity));
    self
  }

  pub fn on_success<F>(mut self, callback: F) -> Self
  where
    F: Fn(&R, &V) + Send + Sync + 'static,
  {
    self.on_success = Some(Arc::new(callback));
    self
  }

  /// Called after the cache has been rolled back.
  pub fn on_error<F>(mut self, callback: F) -> Self
  where
    F: Fn(&Error, &V) + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(callback));
    self
  }

  pub fn on_settled<F>(mut self, callback: F) -> Self
  where
    F: Fn(&V) + Send + Sync + 'static,
  {
    self.on_settled = Some(Arc::new(callback));
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn router(&self) -> &InvalidationRouter {
    &self.router
  }

  pub fn is_loading(&self) -> bool {
    self.in_flight.load(Ordering::SeqCst) > 0
  }

  /// Fire and forget; failures reach the `on_error` callback.
  pub fn mutate(&self, variables: V) -> JoinHandle<Result<R>> {
    let mutation = self.clone();
    tokio::spawn(async move { mutation.mutate_async(variables).await })
  }

  /// Run the mutation and wait for it to settle.
  pub async fn mutate_async(&self, variables: V) -> Result<R> {
    let _loading = InFlightGuard::enter(&self.in_flight);
    let _gate = match &self.serial {
      Some(entity) => {
        let key = format!("{}:{}", self.name, entity(&variables));
        Some(self.gates.acquire(key).await)
      }
      None => None,
    };

    let write = Arc::clone(&self.write);
    let vars = variables.clone();
    let mut hooks = OptimisticHooks {
      mutation: self,
      variables: &variables,
    };
    self.executor.execute(&mut hooks, move || write(vars)).await
  }
}

struct OptimisticHooks<'a, V, R> {
  mutation: &'a Mutation<V, R>,
  variables: &'a V,
}

impl<V, R> MutationHooks<R> for OptimisticHooks<'_, V, R> {
  type Context = PendingGuard;

  fn on_mutate(&mut self) -> Result<PendingGuard> {
    let mutation = self.mutation;
    let targets = mutation
      .targets
      .as_ref()
      .map(|f| f(self.variables))
      .unwrap_or_default();
    let patch = mutation.patch.as_ref().map(|f| f(self.variables));

    if patch.is_some() && targets.is_empty() {
      return Err(Error::programmer(format!(
        "mutation `{}` declares an optimistic patch but no target keys",
        mutation.name
      )));
    }

    let targeted = |k: &CacheKey| targets.iter().any(|prefix| k.starts_with(prefix));
    mutation.store.cancel(targeted);
    let snapshots = mutation.store.matching(targeted);
    let pending = PendingMutation::new(targets, snapshots);

    if let Some(patch) = patch {
      // Compute everything before writing anything.
      let next = pending
        .previous_snapshots
        .values()
        .map(|entry| Ok((entry.key.clone(), patch.apply(&entry.data)?)))
        .collect::<Result<Vec<(CacheKey, Value)>>>()?;
      mutation.store.set_all(next);
    }

    debug!(
      mutation = %mutation.name,
      id = pending.id,
      patched = pending.previous_snapshots.len(),
      "applied optimistic update"
    );
    Ok(PendingGuard {
      pending,
      name: Arc::clone(&mutation.name),
      store: mutation.store.clone(),
      router: mutation.router.clone(),
    })
  }

  fn on_success(&mut self, data: &R, mut context: PendingGuard) {
    context.pending.commit();
    if let Some(callback) = &self.mutation.on_success {
      callback(data, self.variables);
    }
  }

  fn on_error(&mut self, error: &Error, context: Option<PendingGuard>) {
    if let Some(mut guard) = context {
      guard.pending.rollback(&self.mutation.store);
      warn!(
        mutation = %self.mutation.name,
        id = guard.pending.id,
        error = %error,
        "mutation failed, rolled back optimistic update"
      );
    } else {
      warn!(mutation = %self.mutation.name, error = %error, "mutation rejected before write");
    }
    if let Some(callback) = &self.mutation.on_error {
      callback(error, self.variables);
    }
  }

  fn on_settled(&mut self) {
    self.mutation.router.settle(&self.mutation.store);
    if let Some(callback) = &self.mutation.on_settled {
      callback(self.variables);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  fn courses() -> Value {
    json!([
      {"id": "a1", "title": "Rust"},
      {"id": "b1", "title": "Go"},
      {"id": "c1", "title": "Zig"},
      {"id": "d1", "title": "Nim"},
      {"id": "e1", "title": "Odin"}
    ])
  }

  fn list_key() -> CacheKey {
    CacheKey::new("admin-courses")
  }

  fn delete_mutation(
    client: &MutationClient,
    outcome: fn() -> Result<ApiResponse<()>>,
  ) -> Mutation<String, ()> {
    client
      .mutation("delete-course", move |_id: String| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        outcome()
      })
      .targets(|_| vec![CacheKey::new("admin-courses")])
      .optimistic(|id| Patch::remove_item(id))
      .invalidates([CacheKey::new("admin-courses")])
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_delete_rolls_back_exactly() {
    let store = CacheStore::new();
    store.set(list_key(), courses());
    let before = store.get(&list_key()).unwrap();
    let client = MutationClient::new(store.clone());

    let seen_on_error = Arc::new(Mutex::new(None));
    let mutation = delete_mutation(&client, || Err(Error::transport("connection reset")))
      .on_error({
        let store = store.clone();
        let seen = seen_on_error.clone();
        move |_, _| {
          *seen.lock().unwrap() = store.get(&CacheKey::new("admin-courses")).map(|e| e.data);
        }
      });

    let handle = mutation.mutate("c1".to_string());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(mutation.is_loading());
    assert_eq!(store.get(&list_key()).unwrap().data.as_array().unwrap().len(), 4);

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(Error::Transport(_))));
    assert!(!mutation.is_loading());

    let after = store.get(&list_key()).unwrap();
    assert_eq!(after.data, before.data);
    assert_eq!(after.fetched_at, before.fetched_at);
    assert_eq!(after.data[2]["id"], json!("c1"));
    // rollback happened before on_error fired
    assert_eq!(seen_on_error.lock().unwrap().clone(), Some(courses()));
    // settled regardless of outcome
    assert!(after.is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_successful_delete_keeps_optimistic_value() {
    let store = CacheStore::new();
    store.set(list_key(), courses());
    let client = MutationClient::new(store.clone());

    let mutation = delete_mutation(&client, || Ok(ApiResponse::ok(())));
    mutation.mutate_async("c1".to_string()).await.unwrap();

    let entry = store.get(&list_key()).unwrap();
    assert_eq!(entry.data.as_array().unwrap().len(), 4);
    assert!(entry.is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_mutation_rolls_back_and_settles() {
    let store = CacheStore::new();
    store.set(list_key(), courses());
    let client = MutationClient::new(store.clone());
    let mutation = delete_mutation(&client, || Err(Error::transport("connection reset")));

    let timed_out = tokio::time::timeout(
      Duration::from_millis(10),
      mutation.mutate_async("c1".to_string()),
    )
    .await;
    assert!(timed_out.is_err());
    assert!(!mutation.is_loading());

    let entry = store.get(&list_key()).unwrap();
    assert_eq!(entry.data, courses());
    assert!(entry.is_stale);

    // the abandoned write's outcome never reaches the cache
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.get(&list_key()).unwrap().data, courses());
  }

  #[tokio::test(start_paused = true)]
  async fn test_aborted_task_rolls_back() {
    let store = CacheStore::new();
    store.set(list_key(), courses());
    let client = MutationClient::new(store.clone());
    let mutation = delete_mutation(&client, || Ok(ApiResponse::ok(())));

    let handle = mutation.mutate("c1".to_string());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.get(&list_key()).unwrap().data.as_array().unwrap().len(), 4);

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    assert_eq!(store.get(&list_key()).unwrap().data, courses());
  }

  #[tokio::test(start_paused = true)]
  async fn test_validation_failure_rolls_back() {
    let store = CacheStore::new();
    store.set(list_key(), courses());
    let client = MutationClient::new(store.clone());

    let mutation = delete_mutation(&client, || Ok(ApiResponse::rejected("course has students")));
    let result = mutation.mutate_async("c1".to_string()).await;

    match result {
      Err(Error::Validation { message }) => assert_eq!(message, "course has students"),
      other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(store.get(&list_key()).unwrap().data, courses());
  }

  #[tokio::test]
  async fn test_patch_without_targets_is_programmer_error() {
    let store = CacheStore::new();
    store.set(list_key(), courses());
    let client = MutationClient::new(store.clone());
    let writes = Arc::new(AtomicU32::new(0));

    let mutation = client
      .mutation("broken", {
        let writes = writes.clone();
        move |_: ()| {
          writes.fetch_add(1, Ordering::SeqCst);
          async { Ok(ApiResponse::ok(())) }
        }
      })
      .optimistic(|_| Patch::remove_item("c1"));

    let result = mutation.mutate_async(()).await;
    assert!(matches!(result, Err(Error::Programmer(_))));
    assert_eq!(writes.load(Ordering::SeqCst), 0);
    assert_eq!(store.get(&list_key()).unwrap().data, courses());
  }

  #[tokio::test]
  async fn test_failing_patch_applies_nothing() {
    let store = CacheStore::new();
    store.set(CacheKey::new("course").with(1i64), json!({"id": 1, "title": "ok"}));
    store.set(CacheKey::new("course").with(2i64), json!({"id": 2, "title": "x"}));
    let client = MutationClient::new(store.clone());

    let mutation = client
      .mutation("rename", |_: ()| async { Ok(ApiResponse::ok(())) })
      .targets(|_| vec![CacheKey::new("course")])
      .optimistic(|_| {
        Patch::new("rename-or-fail", |value| {
          if value["id"] == json!(2) {
            return Err(Error::programmer("cannot rename course 2"));
          }
          let mut next = value.clone();
          next["title"] = json!("renamed");
          Ok(next)
        })
      });

    let result = mutation.mutate_async(()).await;
    assert!(matches!(result, Err(Error::Programmer(_))));
    assert_eq!(
      store.get(&CacheKey::new("course").with(1i64)).unwrap().data["title"],
      json!("ok")
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_optimistic_write_cancels_in_flight_fetch() {
    let store = CacheStore::new();
    store.set(list_key(), courses());
    store.invalidate(|_| true);
    let client = MutationClient::new(store.clone());

    let fetch = tokio::spawn({
      let store = store.clone();
      async move {
        store
          .fetch(&CacheKey::new("admin-courses"), || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(courses())
          })
          .await
      }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mutation = delete_mutation(&client, || Ok(ApiResponse::ok(())));
    let handle = mutation.mutate("c1".to_string());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!store.is_fetching(&list_key()));

    fetch.await.unwrap().unwrap();
    handle.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let data = store.get(&list_key()).unwrap().data;
    let ids: Vec<Value> = data
      .as_array()
      .unwrap()
      .iter()
      .map(|c| c["id"].clone())
      .collect();
    assert!(!ids.contains(&json!("c1")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_same_entity_mutations_are_serialized() {
    let store = CacheStore::new();
    store.set(CacheKey::new("course-lessons").with(1i64), json!([]));
    let client = MutationClient::new(store.clone());
    let log = Arc::new(Mutex::new(Vec::new()));

    let reorder = client
      .mutation("reorder-lessons", {
        let log = log.clone();
        move |(course, tag): (u64, &'static str)| {
          let log = log.clone();
          async move {
            log.lock().unwrap().push(format!("start {} {}", course, tag));
            tokio::time::sleep(Duration::from_millis(50)).await;
            log.lock().unwrap().push(format!("end {} {}", course, tag));
            Ok(ApiResponse::ok(()))
          }
        }
      })
      .serialize_by(|(course, _)| course.to_string());

    let first = reorder.mutate((1, "first"));
    tokio::time::sleep(Duration::from_millis(1)).await;
    let second = reorder.mutate((1, "second"));
    let other = reorder.mutate((2, "other"));

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    other.await.unwrap().unwrap();

    let log = log.lock().unwrap().clone();
    let pos = |s: &str| log.iter().position(|l| l == s).unwrap();
    assert!(pos("end 1 first") < pos("start 1 second"));
    // a different entity is not held back
    assert!(pos("start 2 other") < pos("end 1 first"));
  }
}
