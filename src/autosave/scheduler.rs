//! Debounced, single-flight autosave for one open editor.
//!
//! Each [`Autosave`] owns a background task that receives edits over a
//! channel. Edits restart a debounce timer; when it expires the latest
//! snapshot is saved. At most one save is in flight per session, and edits
//! made during a save are coalesced into the next one.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::future::{pending, Future};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::conflict::{ConflictRecord, ConflictResolver, EqFn, Resolution};
use super::drafts::{Draft, DraftReason, DraftStore, NoopDraftStore};
use super::state::{AutosaveState, AutosaveStatus};
use crate::api::{ApiResponse, Revisioned, SaveRequest};
use crate::cache::{CacheKey, CacheStore};
use crate::error::{Error, Result};
use crate::mutation::InvalidationRouter;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(2000);

type SaveFuture<T> = BoxFuture<'static, Result<ApiResponse<Revisioned<T>>>>;
type SaveFn<T> = Arc<dyn Fn(SaveRequest<T>) -> SaveFuture<T> + Send + Sync>;
type Reply = oneshot::Sender<Result<SaveOutcome>>;

/// Per-session settings.
pub struct AutosaveOptions<T> {
  debounce: Duration,
  equals: EqFn<T>,
  invalidation: Option<(CacheStore, InvalidationRouter)>,
  drafts: Arc<dyn DraftStore>,
}

impl<T: PartialEq + 'static> Default for AutosaveOptions<T> {
  fn default() -> Self {
    Self {
      debounce: DEFAULT_DEBOUNCE,
      equals: Arc::new(|a: &T, b: &T| a == b),
      invalidation: None,
      drafts: Arc::new(NoopDraftStore),
    }
  }
}

impl<T> AutosaveOptions<T> {
  pub fn debounce(mut self, debounce: Duration) -> Self {
    self.debounce = debounce;
    self
  }

  /// Equality used for dirty checks and conflict detection.
  pub fn equality<F>(mut self, equals: F) -> Self
  where
    F: Fn(&T, &T) -> bool + Send + Sync + 'static,
  {
    self.equals = Arc::new(equals);
    self
  }

  /// Cache prefixes to mark stale after every successful save.
  pub fn invalidates(
    mut self,
    store: CacheStore,
    prefixes: impl IntoIterator<Item = CacheKey>,
  ) -> Self {
    self.invalidation = Some((store, InvalidationRouter::new(prefixes)));
    self
  }

  pub fn drafts(mut self, drafts: Arc<dyn DraftStore>) -> Self {
    self.drafts = drafts;
    self
  }
}

/// What a force-save or conflict resolution ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
  /// The snapshot was persisted at `revision`
  Saved { revision: u64 },
  /// Nothing differed from the last saved snapshot
  Unchanged,
  /// Local edits were dropped in favour of the server's `revision`
  Reverted { revision: u64 },
}

/// Snapshot of session state, published after every processed command.
#[derive(Debug, Clone)]
pub struct AutosaveView<T> {
  pub status: AutosaveStatus,
  pub last_saved_at: Option<DateTime<Utc>>,
  pub has_unsaved_changes: bool,
  pub remote_revision: u64,
  pub conflict: Option<ConflictRecord<T>>,
  pub last_error: Option<String>,
}

enum Command<T> {
  Edit(T),
  ForceSave(Reply),
  Resolve(Resolution, Reply),
  Close(oneshot::Sender<Option<T>>),
}

/// Handle to an open editor session.
///
/// Dropping the handle closes the session the same way [`Autosave::close`]
/// does, minus the return value.
pub struct Autosave<T> {
  entity_id: String,
  commands: mpsc::UnboundedSender<Command<T>>,
  view: watch::Receiver<AutosaveView<T>>,
  drafts: Arc<dyn DraftStore>,
  recovered: Option<Draft>,
}

impl<T> Autosave<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  /// Start a session for `entity_id`, whose server copy is `initial`.
  ///
  /// Must be called from within a tokio runtime.
  pub fn open<F, Fut>(
    entity_id: impl Into<String>,
    initial: Revisioned<T>,
    options: AutosaveOptions<T>,
    save: F,
  ) -> Self
  where
    F: Fn(SaveRequest<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ApiResponse<Revisioned<T>>>> + Send + 'static,
  {
    let entity_id = entity_id.into();
    let recovered = match options.drafts.load_draft(&entity_id) {
      Ok(draft) => draft,
      Err(e) => {
        warn!(entity = %entity_id, error = %e, "could not read draft");
        None
      }
    };
    if let Some(draft) = &recovered {
      info!(entity = %entity_id, reason = ?draft.reason, "recovered local draft");
    }

    let state = AutosaveState::new(entity_id.clone(), initial.snapshot, initial.revision);
    let (view_tx, view_rx) = watch::channel(AutosaveView {
      status: state.status,
      last_saved_at: None,
      has_unsaved_changes: false,
      remote_revision: state.remote_revision,
      conflict: None,
      last_error: None,
    });
    let (tx, rx) = mpsc::unbounded_channel();

    let worker = Worker {
      resolver: ConflictResolver::from_shared(Arc::clone(&options.equals)),
      equals: options.equals,
      debounce: options.debounce,
      invalidation: options.invalidation,
      drafts: Arc::clone(&options.drafts),
      save: Arc::new(move |request: SaveRequest<T>| -> SaveFuture<T> { Box::pin(save(request)) }),
      state,
      conflict: None,
      deadline: None,
      in_flight: None,
      waiters: Vec::new(),
      outbox: Vec::new(),
      last_error: None,
      view: view_tx,
    };
    tokio::spawn(worker.run(rx));

    Self {
      entity_id,
      commands: tx,
      view: view_rx,
      drafts: options.drafts,
      recovered,
    }
  }

  pub fn entity_id(&self) -> &str {
    &self.entity_id
  }

  /// Record a local edit and restart the debounce timer.
  pub fn edit(&self, snapshot: T) -> Result<()> {
    self
      .commands
      .send(Command::Edit(snapshot))
      .map_err(|_| Error::Closed)
  }

  /// Save now. If a save is already in flight, waits for it and then saves
  /// again only if edits arrived in the meantime.
  pub async fn force_save(&self) -> Result<SaveOutcome> {
    let (tx, rx) = oneshot::channel();
    self
      .commands
      .send(Command::ForceSave(tx))
      .map_err(|_| Error::Closed)?;
    rx.await.map_err(|_| Error::Closed)?
  }

  pub async fn resolve_conflict(&self, resolution: Resolution) -> Result<SaveOutcome> {
    let (tx, rx) = oneshot::channel();
    self
      .commands
      .send(Command::Resolve(resolution, tx))
      .map_err(|_| Error::Closed)?;
    rx.await.map_err(|_| Error::Closed)?
  }

  pub fn status(&self) -> AutosaveStatus {
    self.view.borrow().status
  }

  pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
    self.view.borrow().last_saved_at
  }

  /// True while edits are pending, a save failed, or a conflict is open.
  /// Reflects the last command the session has processed.
  pub fn has_unsaved_changes(&self) -> bool {
    self.view.borrow().has_unsaved_changes
  }

  pub fn conflict_data(&self) -> Option<ConflictRecord<T>> {
    self.view.borrow().conflict.clone()
  }

  pub fn remote_revision(&self) -> u64 {
    self.view.borrow().remote_revision
  }

  pub fn last_error(&self) -> Option<String> {
    self.view.borrow().last_error.clone()
  }

  /// Subscribe to view changes.
  pub fn watch(&self) -> watch::Receiver<AutosaveView<T>> {
    self.view.clone()
  }

  /// A draft left behind by an earlier session, if any. It is never applied
  /// automatically; pass [`Autosave::recovered_snapshot`] to [`Autosave::edit`]
  /// to restore it.
  pub fn recovered_draft(&self) -> Option<&Draft> {
    self.recovered.as_ref()
  }

  pub fn recovered_snapshot(&self) -> Option<T> {
    let draft = self.recovered.as_ref()?;
    match serde_json::from_value(draft.snapshot.clone()) {
      Ok(snapshot) => Some(snapshot),
      Err(e) => {
        warn!(entity = %self.entity_id, error = %e, "draft does not match the editor type");
        None
      }
    }
  }

  pub fn discard_recovered_draft(&mut self) -> Result<()> {
    if self.recovered.take().is_some() {
      self.drafts.delete_draft(&self.entity_id)?;
    }
    Ok(())
  }

  /// Flush pending edits and end the session.
  ///
  /// Returns the local snapshot when it could not be saved (failed save or
  /// open conflict). That snapshot is also kept in the draft store.
  pub async fn close(self) -> Result<Option<T>> {
    let (tx, rx) = oneshot::channel();
    self
      .commands
      .send(Command::Close(tx))
      .map_err(|_| Error::Closed)?;
    rx.await.map_err(|_| Error::Closed)
  }
}

struct Worker<T> {
  state: AutosaveState<T>,
  save: SaveFn<T>,
  resolver: ConflictResolver<T>,
  equals: EqFn<T>,
  debounce: Duration,
  invalidation: Option<(CacheStore, InvalidationRouter)>,
  drafts: Arc<dyn DraftStore>,
  conflict: Option<ConflictRecord<T>>,
  deadline: Option<Instant>,
  in_flight: Option<(SaveRequest<T>, SaveFuture<T>)>,
  /// Force-saves waiting on the in-flight save
  waiters: Vec<Reply>,
  /// Replies held back until the view is published
  outbox: Vec<(Reply, Result<SaveOutcome>)>,
  last_error: Option<String>,
  view: watch::Sender<AutosaveView<T>>,
}

async fn wait_for_save<T>(
  in_flight: &mut Option<(SaveRequest<T>, SaveFuture<T>)>,
) -> Result<ApiResponse<Revisioned<T>>> {
  match in_flight {
    Some((_, future)) => future.await,
    None => pending().await,
  }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => sleep_until(deadline).await,
    None => pending().await,
  }
}

impl<T> Worker<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<T>>) {
    loop {
      // The timer never fires over an in-flight save; it is picked up after.
      let deadline = self.deadline.filter(|_| self.in_flight.is_none());

      tokio::select! {
        command = commands.recv() => match command {
          Some(Command::Edit(snapshot)) => self.edit(snapshot),
          Some(Command::ForceSave(reply)) => self.force_save(reply),
          Some(Command::Resolve(resolution, reply)) => self.resolve(resolution, reply),
          Some(Command::Close(reply)) => {
            let unsaved = self.close().await;
            self.publish();
            let _ = reply.send(unsaved);
            return;
          }
          None => {
            self.close().await;
            self.publish();
            return;
          }
        },
        result = wait_for_save(&mut self.in_flight) => self.finish_save(result),
        _ = wait_for_deadline(deadline) => {
          self.deadline = None;
          self.start_save(false);
        }
      }

      self.publish();
    }
  }

  fn is_dirty(&self) -> bool {
    self.state.is_dirty(|a, b| (self.equals)(a, b))
  }

  fn transition(&mut self, next: AutosaveStatus) {
    if let Err(e) = self.state.transition(next) {
      error!(error = %e, "autosave state machine violated");
    }
  }

  fn reply(&mut self, reply: Reply, result: Result<SaveOutcome>) {
    self.outbox.push((reply, result));
  }

  fn reply_waiters(&mut self, result: &Result<SaveOutcome>) {
    for waiter in std::mem::take(&mut self.waiters) {
      let copy = match result {
        Ok(outcome) => Ok(*outcome),
        Err(e) => Err(e.duplicate()),
      };
      self.reply(waiter, copy);
    }
  }

  fn edit(&mut self, snapshot: T) {
    self.state.pending_snapshot = Some(snapshot);
    if self.conflict.is_some() {
      // Held until the conflict is resolved.
      return;
    }
    self.deadline = Some(Instant::now() + self.debounce);
  }

  fn force_save(&mut self, reply: Reply) {
    if let Some(record) = &self.conflict {
      let err = record.to_error(self.state.remote_revision);
      self.reply(reply, Err(err));
      return;
    }
    if self.in_flight.is_some() || self.start_save(false) {
      self.waiters.push(reply);
    } else {
      self.reply(reply, Ok(SaveOutcome::Unchanged));
    }
  }

  fn resolve(&mut self, resolution: Resolution, reply: Reply) {
    let Some(record) = self.conflict.take() else {
      let err = Error::programmer(format!("{} has no conflict to resolve", self.state.entity_id));
      self.reply(reply, Err(err));
      return;
    };
    let revision = record.remote_revision;
    if let Err(e) = self.resolver.resolve(&mut self.state, record, resolution) {
      self.reply(reply, Err(e));
      return;
    }
    self.last_error = None;
    self.delete_draft();

    match resolution {
      Resolution::Remote => {
        self.deadline = None;
        self.settle();
        self.reply(reply, Ok(SaveOutcome::Reverted { revision }));
      }
      Resolution::Local => {
        self.start_save(true);
        self.waiters.push(reply);
      }
    }
  }

  /// Begin saving the current snapshot. Returns false when nothing was sent.
  fn start_save(&mut self, force: bool) -> bool {
    if self.in_flight.is_some() || self.conflict.is_some() {
      return false;
    }
    if !force && !self.is_dirty() {
      return false;
    }

    let request = SaveRequest {
      entity_id: self.state.entity_id.clone(),
      base_revision: self.state.remote_revision,
      snapshot: self.state.current().clone(),
    };
    self.transition(AutosaveStatus::Saving);
    debug!(entity = %request.entity_id, base_revision = request.base_revision, "saving");

    let future = (self.save)(request.clone());
    self.in_flight = Some((request, future));
    self.deadline = None;
    true
  }

  fn finish_save(&mut self, result: Result<ApiResponse<Revisioned<T>>>) {
    let Some((request, _)) = self.in_flight.take() else {
      return;
    };
    match result.and_then(ApiResponse::into_result) {
      Ok(response) => self.on_response(request, response),
      Err(e) => self.on_failure(e),
    }
  }

  fn on_response(&mut self, request: SaveRequest<T>, response: Revisioned<T>) {
    let detected = self.resolver.detect(
      &request.entity_id,
      request.base_revision,
      &request.snapshot,
      &response,
    );
    if let Some(mut record) = detected {
      record.local_snapshot = self.state.current().clone();
      warn!(
        entity = %record.entity_id,
        local_revision = request.base_revision,
        remote_revision = record.remote_revision,
        "save conflicted with a remote edit"
      );
      self.transition(AutosaveStatus::Conflict);
      self.deadline = None;
      let err = record.to_error(request.base_revision);
      self.conflict = Some(record);
      self.reply_waiters(&Err(err));
      return;
    }

    let revision = response.revision;
    self.state.remote_revision = revision;
    self.state.last_saved_snapshot = request.snapshot;
    self.state.last_saved_at = Some(Utc::now());
    if !self.is_dirty() {
      self.state.pending_snapshot = None;
    }
    self.last_error = None;
    self.transition(AutosaveStatus::Saved);
    self.delete_draft();
    self.settle();
    info!(entity = %self.state.entity_id, revision, "saved");

    if self.is_dirty() {
      if !self.waiters.is_empty() {
        // A force-save arrived mid-flight; it wants the newest edits too.
        self.start_save(false);
      } else if self.deadline.is_none() {
        self.deadline = Some(Instant::now() + self.debounce);
      }
    } else {
      self.reply_waiters(&Ok(SaveOutcome::Saved { revision }));
    }
  }

  fn on_failure(&mut self, e: Error) {
    warn!(entity = %self.state.entity_id, error = %e, "autosave failed");
    self.transition(AutosaveStatus::Error);
    self.last_error = Some(e.to_string());
    self.reply_waiters(&Err(e));
  }

  fn settle(&self) {
    if let Some((store, router)) = &self.invalidation {
      router.settle(store);
    }
  }

  fn delete_draft(&self) {
    if let Err(e) = self.drafts.delete_draft(&self.state.entity_id) {
      warn!(entity = %self.state.entity_id, error = %e, "could not delete draft");
    }
  }

  async fn close(&mut self) -> Option<T> {
    self.deadline = None;
    if self.conflict.is_none() && self.in_flight.is_none() {
      self.start_save(false);
    }
    while self.in_flight.is_some() {
      let result = wait_for_save(&mut self.in_flight).await;
      self.finish_save(result);
    }

    let reason = if self.conflict.is_some() {
      Some(DraftReason::Conflict)
    } else if self.is_dirty() {
      Some(DraftReason::Unsaved)
    } else {
      None
    };

    for waiter in std::mem::take(&mut self.waiters) {
      self.reply(waiter, Err(Error::Closed));
    }

    let reason = reason?;
    let snapshot = self.state.current().clone();
    self.keep_draft(&snapshot, reason);
    Some(snapshot)
  }

  fn keep_draft(&self, snapshot: &T, reason: DraftReason) {
    let value = match serde_json::to_value(snapshot) {
      Ok(value) => value,
      Err(e) => {
        warn!(entity = %self.state.entity_id, error = %e, "could not serialize draft");
        return;
      }
    };
    let draft = Draft {
      entity_id: self.state.entity_id.clone(),
      base_revision: self.state.remote_revision,
      snapshot: value,
      reason,
      saved_at: Utc::now(),
    };
    match self.drafts.save_draft(&draft) {
      Ok(()) => info!(entity = %draft.entity_id, ?reason, "kept local draft"),
      Err(e) => warn!(entity = %draft.entity_id, error = %e, "could not keep draft"),
    }
  }

  fn publish(&mut self) {
    self.view.send_replace(AutosaveView {
      status: self.state.status,
      last_saved_at: self.state.last_saved_at,
      has_unsaved_changes: self.conflict.is_some() || self.is_dirty(),
      remote_revision: self.state.remote_revision,
      conflict: self.conflict.clone(),
      last_error: self.last_error.clone(),
    });
    for (reply, result) in self.outbox.drain(..) {
      let _ = reply.send(result);
    }
  }
}
