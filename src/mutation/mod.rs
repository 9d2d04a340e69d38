//! Writes against the remote API with optimistic cache updates.
//!
//! A mutation moves through four steps:
//! 1. snapshot the target entries and cancel their in-flight fetches
//! 2. apply a pure [`Patch`] to every target and write the results
//! 3. send the write through the [`MutationExecutor`]; on failure restore the snapshots
//! 4. settle: the [`InvalidationRouter`] marks its declared prefixes stale

mod executor;
mod invalidation;
mod optimistic;
mod patch;

pub use executor::{MutationExecutor, MutationHooks};
pub use invalidation::InvalidationRouter;
pub use optimistic::{Mutation, MutationClient, MutationStatus, PendingMutation};
pub use patch::{item_id, reorder_items, Patch};
