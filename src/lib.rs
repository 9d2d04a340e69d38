//! Client-side state engine for the course authoring UI.
//!
//! Reads go through a keyed query cache, writes through optimistic mutations
//! that patch the cache immediately and roll back on failure, and the lesson
//! editor through a debounced autosave with revision-based conflict
//! detection.

pub mod api;
pub mod autosave;
pub mod cache;
pub mod config;
pub mod courses;
pub mod demo;
pub mod error;
pub mod logging;
pub mod mutation;
pub mod query;

pub use error::{Error, Result};
