//! Remote API surface consumed by the synchronisation core.

mod http;
mod memory;

pub use http::HttpCourseApi;
pub use memory::MemoryCourseApi;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::courses::{Course, Lesson, LessonContent, Pricing};
use crate::error::{Error, Result};

/// Uniform response envelope returned by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

impl<T> ApiResponse<T> {
  pub fn ok(data: T) -> Self {
    Self {
      success: true,
      data: Some(data),
      message: None,
    }
  }

  pub fn rejected(message: impl Into<String>) -> Self {
    Self {
      success: false,
      data: None,
      message: Some(message.into()),
    }
  }
}

impl<T: DeserializeOwned> ApiResponse<T> {
  /// `success: false` is a validation failure. A successful response without
  /// data is accepted when `T` can be built from `null` (`()`, `Option<_>`).
  pub fn into_result(self) -> Result<T> {
    if !self.success {
      let message = self
        .message
        .unwrap_or_else(|| "request rejected by server".to_string());
      return Err(Error::validation(message));
    }
    match self.data {
      Some(data) => Ok(data),
      None => serde_json::from_value(serde_json::Value::Null)
        .map_err(|_| Error::transport("response is missing its data field")),
    }
  }
}

/// A save request for an autosaved entity: the full snapshot plus the revision
/// the client last saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest<T> {
  pub entity_id: String,
  pub base_revision: u64,
  pub snapshot: T,
}

/// The server's view of the entity after a save attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revisioned<T> {
  pub revision: u64,
  pub snapshot: T,
}

/// Course endpoints the client depends on.
#[async_trait]
pub trait CourseApi: Send + Sync {
  async fn list_admin_courses(&self, filters: &BTreeMap<String, String>) -> Result<Vec<Course>>;

  async fn get_course(&self, course_id: u64) -> Result<Course>;

  async fn list_lessons(&self, course_id: u64) -> Result<Vec<Lesson>>;

  async fn update_pricing(&self, course_id: u64, pricing: &Pricing) -> Result<ApiResponse<Course>>;

  async fn delete_course(&self, course_id: u64) -> Result<ApiResponse<()>>;

  /// Persist a new lesson order as `lesson_id -> position`.
  async fn reorder_lessons(
    &self,
    course_id: u64,
    positions: &BTreeMap<String, i64>,
  ) -> Result<ApiResponse<Vec<Lesson>>>;

  async fn get_lesson_content(&self, lesson_id: u64) -> Result<Revisioned<LessonContent>>;

  async fn save_lesson_content(
    &self,
    request: &SaveRequest<LessonContent>,
  ) -> Result<ApiResponse<Revisioned<LessonContent>>>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rejected_response_is_validation_error() {
    let response: ApiResponse<u32> = ApiResponse::rejected("price must be positive");
    match response.into_result() {
      Err(Error::Validation { message }) => assert_eq!(message, "price must be positive"),
      other => panic!("unexpected result: {:?}", other),
    }
  }

  #[test]
  fn test_missing_data_is_allowed_for_unit() {
    let response: ApiResponse<()> = serde_json::from_str(r#"{"success": true}"#).unwrap();
    assert!(response.into_result().is_ok());

    let response: ApiResponse<u32> = serde_json::from_str(r#"{"success": true}"#).unwrap();
    assert!(matches!(response.into_result(), Err(Error::Transport(_))));
  }

  #[test]
  fn test_envelope_decodes_payloads_without_default() {
    // Revisioned has no Default impl; decoding must not require one.
    let response: ApiResponse<Revisioned<String>> =
      serde_json::from_str(r#"{"success": true, "data": {"revision": 4, "snapshot": "body"}}"#)
        .unwrap();
    assert_eq!(
      response.into_result().unwrap(),
      Revisioned {
        revision: 4,
        snapshot: "body".to_string()
      }
    );

    let rejected: ApiResponse<Revisioned<String>> =
      serde_json::from_str(r#"{"success": false, "message": "title is required"}"#).unwrap();
    assert!(matches!(rejected.into_result(), Err(Error::Validation { .. })));
  }
}
