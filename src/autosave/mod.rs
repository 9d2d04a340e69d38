//! Autosave reconciliation for long-form editors.
//!
//! An [`Autosave`] session debounces local edits, keeps at most one save in
//! flight, and detects when another client changed the entity in between.
//! Conflicts are never resolved silently: the session stops saving until the
//! user picks a [`Resolution`]. Edits that cannot be saved before the session
//! closes are kept in a [`DraftStore`].

mod conflict;
mod drafts;
mod scheduler;
mod state;

pub use conflict::{ConflictRecord, ConflictResolver, Resolution};
pub use drafts::{Draft, DraftReason, DraftStore, NoopDraftStore, SqliteDraftStore};
pub use scheduler::{Autosave, AutosaveOptions, AutosaveView, SaveOutcome, DEFAULT_DEBOUNCE};
pub use state::{AutosaveState, AutosaveStatus};
