//! Local persistence for edits that could not reach the server.
//!
//! When an editor closes with unsaved edits or an unresolved conflict, the
//! local snapshot is written here. Reopening the editor surfaces it as a
//! recovered draft; nothing is ever applied automatically.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::cache::CacheKey;
use crate::error::{Error, Result};

/// Why a draft was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftReason {
  /// Edits were still pending or the last save failed
  Unsaved,
  /// The session closed with a conflict open
  Conflict,
}

impl DraftReason {
  pub fn as_str(self) -> &'static str {
    match self {
      DraftReason::Unsaved => "unsaved",
      DraftReason::Conflict => "conflict",
    }
  }

  fn parse(s: &str) -> Self {
    match s {
      "conflict" => DraftReason::Conflict,
      _ => DraftReason::Unsaved,
    }
  }
}

/// A locally kept snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
  pub entity_id: String,
  /// Remote revision the snapshot was edited on top of
  pub base_revision: u64,
  pub snapshot: Value,
  pub reason: DraftReason,
  pub saved_at: DateTime<Utc>,
}

/// Trait for draft storage backends.
pub trait DraftStore: Send + Sync {
  fn save_draft(&self, draft: &Draft) -> Result<()>;

  fn load_draft(&self, entity_id: &str) -> Result<Option<Draft>>;

  fn delete_draft(&self, entity_id: &str) -> Result<()>;

  /// All drafts, newest first.
  fn list_drafts(&self) -> Result<Vec<Draft>>;

  /// Remove every draft, returning how many were dropped.
  fn clear(&self) -> Result<usize>;
}

/// Storage that keeps nothing. Used when drafts are disabled.
pub struct NoopDraftStore;

impl DraftStore for NoopDraftStore {
  fn save_draft(&self, _draft: &Draft) -> Result<()> {
    Ok(())
  }

  fn load_draft(&self, _entity_id: &str) -> Result<Option<Draft>> {
    Ok(None)
  }

  fn delete_draft(&self, _entity_id: &str) -> Result<()> {
    Ok(())
  }

  fn list_drafts(&self) -> Result<Vec<Draft>> {
    Ok(Vec::new())
  }

  fn clear(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-backed draft storage.
pub struct SqliteDraftStore {
  conn: Mutex<Connection>,
}

impl SqliteDraftStore {
  /// Open the store at the default location in the user's data directory.
  pub fn open_default() -> Result<Self> {
    Self::open(Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    debug!(path = %path.display(), "opening draft store");
    Self::with_connection(Connection::open(path)?)
  }

  pub fn in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(DRAFT_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn default_path() -> Result<PathBuf> {
    let dir = crate::config::data_dir().ok_or_else(|| {
      std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "could not determine data directory",
      )
    })?;
    Ok(dir.join("drafts.db"))
  }

  fn conn(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Drafts are keyed by the cache hash of `["draft", entity_id]` so arbitrary
/// ids are safe keys.
fn entity_key(entity_id: &str) -> String {
  CacheKey::new("draft").with(entity_id).cache_hash()
}

const DRAFT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS drafts (
    entity_key TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL,
    base_revision INTEGER NOT NULL,
    reason TEXT NOT NULL,
    data BLOB NOT NULL,
    saved_at INTEGER NOT NULL
);
"#;

fn row_to_draft(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, Vec<u8>, i64)> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode(raw: (String, i64, String, Vec<u8>, i64)) -> Result<Draft> {
  let (entity_id, base_revision, reason, data, saved_at) = raw;
  Ok(Draft {
    entity_id,
    base_revision: u64::try_from(base_revision).unwrap_or_default(),
    snapshot: serde_json::from_slice(&data)?,
    reason: DraftReason::parse(&reason),
    saved_at: DateTime::from_timestamp_millis(saved_at).unwrap_or_default(),
  })
}

impl DraftStore for SqliteDraftStore {
  fn save_draft(&self, draft: &Draft) -> Result<()> {
    let data = serde_json::to_vec(&draft.snapshot)?;
    let base_revision = i64::try_from(draft.base_revision)
      .map_err(|_| Error::programmer(format!("revision {} out of range", draft.base_revision)))?;
    self.conn().execute(
      "INSERT OR REPLACE INTO drafts (entity_key, entity_id, base_revision, reason, data, saved_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      params![
        entity_key(&draft.entity_id),
        draft.entity_id,
        base_revision,
        draft.reason.as_str(),
        data,
        draft.saved_at.timestamp_millis(),
      ],
    )?;
    debug!(entity = %draft.entity_id, reason = draft.reason.as_str(), "draft saved");
    Ok(())
  }

  fn load_draft(&self, entity_id: &str) -> Result<Option<Draft>> {
    let raw = self
      .conn()
      .query_row(
        "SELECT entity_id, base_revision, reason, data, saved_at FROM drafts WHERE entity_key = ?1",
        params![entity_key(entity_id)],
        row_to_draft,
      )
      .optional()?;
    raw.map(decode).transpose()
  }

  fn delete_draft(&self, entity_id: &str) -> Result<()> {
    self.conn().execute(
      "DELETE FROM drafts WHERE entity_key = ?1",
      params![entity_key(entity_id)],
    )?;
    Ok(())
  }

  fn list_drafts(&self) -> Result<Vec<Draft>> {
    let conn = self.conn();
    let mut stmt = conn.prepare(
      "SELECT entity_id, base_revision, reason, data, saved_at FROM drafts ORDER BY saved_at DESC",
    )?;
    let rows = stmt
      .query_map([], row_to_draft)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(decode).collect()
  }

  fn clear(&self) -> Result<usize> {
    Ok(self.conn().execute("DELETE FROM drafts", [])?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;
  use tempfile::TempDir;

  fn draft(entity_id: &str, body: &str, reason: DraftReason) -> Draft {
    Draft {
      entity_id: entity_id.to_string(),
      base_revision: 4,
      snapshot: json!({ "body": body }),
      reason,
      saved_at: DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap(),
    }
  }

  #[test]
  fn test_save_and_load() {
    let store = SqliteDraftStore::in_memory().unwrap();
    let d = draft("lesson-7", "half written", DraftReason::Unsaved);
    store.save_draft(&d).unwrap();

    assert_eq!(store.load_draft("lesson-7").unwrap(), Some(d));
    assert_eq!(store.load_draft("lesson-8").unwrap(), None);
  }

  #[test]
  fn test_save_replaces_previous_draft() {
    let store = SqliteDraftStore::in_memory().unwrap();
    store
      .save_draft(&draft("lesson-7", "first", DraftReason::Unsaved))
      .unwrap();
    store
      .save_draft(&draft("lesson-7", "second", DraftReason::Conflict))
      .unwrap();

    let loaded = store.load_draft("lesson-7").unwrap().unwrap();
    assert_eq!(loaded.snapshot, json!({ "body": "second" }));
    assert_eq!(loaded.reason, DraftReason::Conflict);
    assert_eq!(store.list_drafts().unwrap().len(), 1);
  }

  #[test]
  fn test_list_newest_first_and_clear() {
    let store = SqliteDraftStore::in_memory().unwrap();
    let mut old = draft("lesson-1", "old", DraftReason::Unsaved);
    old.saved_at = old.saved_at - Duration::minutes(10);
    store.save_draft(&old).unwrap();
    store
      .save_draft(&draft("lesson-2", "new", DraftReason::Unsaved))
      .unwrap();

    let ids: Vec<_> = store
      .list_drafts()
      .unwrap()
      .into_iter()
      .map(|d| d.entity_id)
      .collect();
    assert_eq!(ids, vec!["lesson-2", "lesson-1"]);

    assert_eq!(store.clear().unwrap(), 2);
    assert!(store.list_drafts().unwrap().is_empty());
  }

  #[test]
  fn test_rows_are_keyed_by_cache_hash() {
    let store = SqliteDraftStore::in_memory().unwrap();
    let odd_id = "lesson/7'; DROP TABLE drafts; --";
    store
      .save_draft(&draft(odd_id, "x", DraftReason::Unsaved))
      .unwrap();

    let key: String = store
      .conn()
      .query_row(
        "SELECT entity_key FROM drafts WHERE entity_id = ?1",
        params![odd_id],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(key, CacheKey::new("draft").with(odd_id).cache_hash());
    assert_eq!(key.len(), 64);
    assert!(store.load_draft(odd_id).unwrap().is_some());
  }

  #[test]
  fn test_delete() {
    let store = SqliteDraftStore::in_memory().unwrap();
    store
      .save_draft(&draft("lesson-1", "x", DraftReason::Unsaved))
      .unwrap();
    store.delete_draft("lesson-1").unwrap();
    assert_eq!(store.load_draft("lesson-1").unwrap(), None);
  }

  #[test]
  fn test_drafts_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("drafts.db");
    let d = draft("lesson-3", "persisted", DraftReason::Conflict);

    SqliteDraftStore::open(&path).unwrap().save_draft(&d).unwrap();
    let reopened = SqliteDraftStore::open(&path).unwrap();
    assert_eq!(reopened.load_draft("lesson-3").unwrap(), Some(d));
  }

  #[test]
  fn test_noop_store_keeps_nothing() {
    let store = NoopDraftStore;
    store
      .save_draft(&draft("lesson-1", "x", DraftReason::Unsaved))
      .unwrap();
    assert_eq!(store.load_draft("lesson-1").unwrap(), None);
    assert!(store.list_drafts().unwrap().is_empty());
  }
}
