//! Detects concurrent remote edits and applies the user's resolution.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::state::{AutosaveState, AutosaveStatus};
use crate::api::Revisioned;
use crate::error::{Error, Result};

/// Both sides of a detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord<T> {
  pub entity_id: String,
  pub local_snapshot: T,
  pub remote_snapshot: T,
  pub remote_revision: u64,
}

impl<T> ConflictRecord<T> {
  pub fn to_error(&self, local_revision: u64) -> Error {
    Error::Conflict {
      entity_id: self.entity_id.clone(),
      local_revision,
      remote_revision: self.remote_revision,
    }
  }
}

/// Which side wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
  /// Keep mine: re-save the local snapshot on top of the remote revision
  Local,
  /// Keep theirs: discard local edits and adopt the server snapshot
  Remote,
}

pub(crate) type EqFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Compares what we sent with what the server reports back.
pub struct ConflictResolver<T> {
  equals: EqFn<T>,
}

impl<T> Clone for ConflictResolver<T> {
  fn clone(&self) -> Self {
    Self {
      equals: Arc::clone(&self.equals),
    }
  }
}

impl<T: Clone> ConflictResolver<T> {
  pub fn new<F>(equals: F) -> Self
  where
    F: Fn(&T, &T) -> bool + Send + Sync + 'static,
  {
    Self {
      equals: Arc::new(equals),
    }
  }

  pub(crate) fn from_shared(equals: EqFn<T>) -> Self {
    Self { equals }
  }

  /// A conflict exists when the server's revision moved past the one we sent
  /// and its snapshot is not the one we wrote. A newer revision carrying our
  /// own snapshot (an idempotent re-save) is not a conflict.
  pub fn detect(
    &self,
    entity_id: &str,
    sent_revision: u64,
    sent_snapshot: &T,
    response: &Revisioned<T>,
  ) -> Option<ConflictRecord<T>> {
    if response.revision <= sent_revision || (self.equals)(&response.snapshot, sent_snapshot) {
      return None;
    }
    Some(ConflictRecord {
      entity_id: entity_id.to_string(),
      local_snapshot: sent_snapshot.clone(),
      remote_snapshot: response.snapshot.clone(),
      remote_revision: response.revision,
    })
  }

  /// Leave the conflict state. Afterwards the state is idle; for
  /// [`Resolution::Local`] the local snapshot is pending and must be saved.
  pub fn resolve(
    &self,
    state: &mut AutosaveState<T>,
    record: ConflictRecord<T>,
    resolution: Resolution,
  ) -> Result<()> {
    if state.status != AutosaveStatus::Conflict {
      return Err(Error::programmer(format!(
        "{} has no conflict to resolve (status {})",
        state.entity_id, state.status
      )));
    }
    state.transition(AutosaveStatus::Idle)?;
    state.remote_revision = record.remote_revision;

    match resolution {
      Resolution::Remote => {
        state.last_saved_snapshot = record.remote_snapshot;
        state.pending_snapshot = None;
      }
      Resolution::Local => {
        // Edits made while the conflict was open win over the record's copy.
        let local = state
          .pending_snapshot
          .take()
          .unwrap_or(record.local_snapshot);
        state.last_saved_snapshot = record.remote_snapshot;
        state.pending_snapshot = Some(local);
      }
    }
    info!(entity = %state.entity_id, ?resolution, "conflict resolved");
    Ok(())
  }
}
