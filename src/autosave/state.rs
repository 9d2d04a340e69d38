//! Autosave status machine and per-entity state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::error::{Error, Result};

/// Save status surfaced to the editor.
///
/// Valid transitions: idle→saving, saving→{saved, error, conflict},
/// saved→saving, error→saving, conflict→idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutosaveStatus {
  Idle,
  Saving,
  Saved,
  Error,
  Conflict,
}

impl AutosaveStatus {
  pub fn can_transition_to(self, next: AutosaveStatus) -> bool {
    use AutosaveStatus::*;
    matches!(
      (self, next),
      (Idle, Saving)
        | (Saving, Saved)
        | (Saving, Error)
        | (Saving, Conflict)
        | (Saved, Saving)
        | (Error, Saving)
        | (Conflict, Idle)
    )
  }
}

impl fmt::Display for AutosaveStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      AutosaveStatus::Idle => "idle",
      AutosaveStatus::Saving => "saving",
      AutosaveStatus::Saved => "saved",
      AutosaveStatus::Error => "error",
      AutosaveStatus::Conflict => "conflict",
    };
    write!(f, "{}", s)
  }
}

/// State of one open editor session.
#[derive(Debug, Clone)]
pub struct AutosaveState<T> {
  pub entity_id: String,
  pub last_saved_snapshot: T,
  /// Latest local edit not yet known to be persisted
  pub pending_snapshot: Option<T>,
  pub status: AutosaveStatus,
  pub last_saved_at: Option<DateTime<Utc>>,
  /// Revision the server last reported for this entity
  pub remote_revision: u64,
}

impl<T> AutosaveState<T> {
  pub fn new(entity_id: impl Into<String>, snapshot: T, remote_revision: u64) -> Self {
    Self {
      entity_id: entity_id.into(),
      last_saved_snapshot: snapshot,
      pending_snapshot: None,
      status: AutosaveStatus::Idle,
      last_saved_at: None,
      remote_revision,
    }
  }

  /// Move to `next`, rejecting anything outside the status machine.
  pub fn transition(&mut self, next: AutosaveStatus) -> Result<()> {
    if !self.status.can_transition_to(next) {
      return Err(Error::programmer(format!(
        "invalid autosave transition {} -> {} for {}",
        self.status, next, self.entity_id
      )));
    }
    debug!(entity = %self.entity_id, from = %self.status, to = %next, "autosave transition");
    self.status = next;
    Ok(())
  }

  /// The snapshot the editor currently shows.
  pub fn current(&self) -> &T {
    self
      .pending_snapshot
      .as_ref()
      .unwrap_or(&self.last_saved_snapshot)
  }

  /// Pending edits differ from what was last saved.
  pub fn is_dirty<F>(&self, equals: F) -> bool
  where
    F: Fn(&T, &T) -> bool,
  {
    self
      .pending_snapshot
      .as_ref()
      .is_some_and(|pending| !equals(pending, &self.last_saved_snapshot))
  }
}
