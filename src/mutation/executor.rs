//! Runs exactly one external write and drives the mutation lifecycle hooks.

use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::debug;

use crate::api::ApiResponse;
use crate::error::{Error, Result};

/// Lifecycle callbacks around a single write.
///
/// `on_mutate` runs synchronously before the network call and produces the
/// context handed back to `on_success`/`on_error` (the optimistic engine's
/// rollback snapshots). `on_settled` always runs last.
pub trait MutationHooks<R> {
  type Context;

  fn on_mutate(&mut self) -> Result<Self::Context>;

  fn on_success(&mut self, data: &R, context: Self::Context);

  /// `context` is `None` when `on_mutate` itself failed.
  fn on_error(&mut self, error: &Error, context: Option<Self::Context>);

  fn on_settled(&mut self);
}

/// Issues one logical write (create/update/delete/reorder).
///
/// A thrown transport error and a `success: false` envelope are treated the
/// same way. The executor never retries; that is the caller's call.
#[derive(Debug, Default, Clone, Copy)]
pub struct MutationExecutor;

impl MutationExecutor {
  pub fn new() -> Self {
    Self
  }

  pub async fn execute<R, H, F, Fut>(&self, hooks: &mut H, write: F) -> Result<R>
  where
    R: DeserializeOwned,
    H: MutationHooks<R>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ApiResponse<R>>>,
  {
    let context = match hooks.on_mutate() {
      Ok(context) => context,
      Err(e) => {
        hooks.on_error(&e, None);
        hooks.on_settled();
        return Err(e);
      }
    };

    let result = match write().await {
      Ok(response) => response.into_result(),
      Err(e) => Err(e),
    };

    match &result {
      Ok(data) => hooks.on_success(data, context),
      Err(e) => {
        debug!(error = %e, "write failed");
        hooks.on_error(e, Some(context));
      }
    }
    hooks.on_settled();
    result
  }
}
