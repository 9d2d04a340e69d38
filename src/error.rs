//! Error taxonomy shared by the cache, mutation and autosave engines.

use thiserror::Error;

/// Errors surfaced by the synchronisation core.
#[derive(Debug, Error)]
pub enum Error {
  /// Network or HTTP failure talking to the remote API.
  #[error("transport error: {0}")]
  Transport(String),

  /// The server rejected the payload (`success: false`).
  #[error("validation error: {message}")]
  Validation { message: String },

  /// The entity was changed remotely since the revision we last saw.
  #[error("conflict on {entity_id}: remote revision {remote_revision} is newer than {local_revision}")]
  Conflict {
    entity_id: String,
    local_revision: u64,
    remote_revision: u64,
  },

  /// A bug in calling code: a failing patch, a mutation with no target keys,
  /// an invalid autosave transition.
  #[error("programmer error: {0}")]
  Programmer(String),

  /// A fetch was cancelled or superseded before it could be applied.
  #[error("fetch for {0} was cancelled")]
  Cancelled(String),

  /// The autosave session has been closed.
  #[error("autosave session closed")]
  Closed,

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  pub fn transport(message: impl Into<String>) -> Self {
    Self::Transport(message.into())
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }

  pub fn programmer(message: impl Into<String>) -> Self {
    Self::Programmer(message.into())
  }

  /// Only transport failures are worth an automatic retry offer.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Transport(_))
  }

  pub fn is_conflict(&self) -> bool {
    matches!(self, Self::Conflict { .. })
  }

  /// Copy of this error for fanning one failure out to several waiters.
  /// Wrapped library errors keep their message but not their source.
  pub(crate) fn duplicate(&self) -> Self {
    match self {
      Self::Transport(m) => Self::Transport(m.clone()),
      Self::Validation { message } => Self::validation(message.clone()),
      Self::Conflict {
        entity_id,
        local_revision,
        remote_revision,
      } => Self::Conflict {
        entity_id: entity_id.clone(),
        local_revision: *local_revision,
        remote_revision: *remote_revision,
      },
      Self::Programmer(m) => Self::Programmer(m.clone()),
      Self::Cancelled(k) => Self::Cancelled(k.clone()),
      Self::Closed => Self::Closed,
      other => Self::Transport(other.to_string()),
    }
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    Self::Transport(e.to_string())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_transport_is_retryable() {
    assert!(Error::transport("connection reset").is_retryable());
    assert!(!Error::validation("title is required").is_retryable());
    assert!(!Error::programmer("no target keys").is_retryable());
  }

  #[test]
  fn test_duplicate_keeps_variant() {
    let err = Error::validation("price must be positive").duplicate();
    assert!(matches!(err, Error::Validation { ref message } if message == "price must be positive"));
    assert!(matches!(Error::Closed.duplicate(), Error::Closed));
  }

  #[test]
  fn test_conflict_message() {
    let err = Error::Conflict {
      entity_id: "lesson-1".into(),
      local_revision: 3,
      remote_revision: 4,
    };
    assert!(err.is_conflict());
    assert_eq!(
      err.to_string(),
      "conflict on lesson-1: remote revision 4 is newer than 3"
    );
  }
}
