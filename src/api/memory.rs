//! In-process course backend with revision tracking and failure injection.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{ApiResponse, CourseApi, Revisioned, SaveRequest};
use crate::courses::{Course, CourseStatus, Lesson, LessonContent, Pricing};
use crate::error::{Error, Result};
use crate::mutation::reorder_items;

/// What the next write call should do instead of succeeding.
#[derive(Debug, Clone)]
enum Injected {
  Transport,
  Reject(String),
}

#[derive(Default)]
struct MemoryState {
  courses: BTreeMap<u64, Course>,
  lessons: BTreeMap<u64, Vec<Lesson>>,
  contents: BTreeMap<u64, Revisioned<LessonContent>>,
  injected: VecDeque<Injected>,
  writes: usize,
  latency: Duration,
}

/// Course API backed by process memory.
///
/// Behaves like the real server where it matters to the client: writes are
/// validated, lesson content carries a revision that only advances when a
/// save was based on the current one, and responses use the same envelope.
#[derive(Clone, Default)]
pub struct MemoryCourseApi {
  inner: Arc<Mutex<MemoryState>>,
}

impl MemoryCourseApi {
  pub fn new() -> Self {
    Self::default()
  }

  /// A small catalogue: three courses, the first with three lessons.
  pub fn seeded() -> Self {
    let api = Self::new();
    api.insert_course(Course {
      id: 1,
      title: "Rust Fundamentals".into(),
      status: CourseStatus::Published,
      pricing: Pricing::paid(4900).with_discount(3900),
      lessons_count: 3,
    });
    api.insert_course(Course {
      id: 2,
      title: "Async in Practice".into(),
      status: CourseStatus::Published,
      pricing: Pricing::free(),
      lessons_count: 0,
    });
    api.insert_course(Course {
      id: 3,
      title: "Unsafe Rust".into(),
      status: CourseStatus::Draft,
      pricing: Pricing::paid(9900),
      lessons_count: 0,
    });
    for (i, (id, title)) in [(10, "Intro"), (11, "Ownership"), (12, "Borrowing")]
      .into_iter()
      .enumerate()
    {
      api.insert_lesson(
        Lesson {
          id,
          course_id: 1,
          title: title.into(),
          position: i as i64,
        },
        format!("{} lesson body.", title),
      );
    }
    api
  }

  pub fn with_latency(self, latency: Duration) -> Self {
    self.lock().latency = latency;
    self
  }

  fn lock(&self) -> MutexGuard<'_, MemoryState> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn insert_course(&self, course: Course) {
    self.lock().courses.insert(course.id, course);
  }

  /// Add a lesson at revision 1.
  pub fn insert_lesson(&self, lesson: Lesson, body: impl Into<String>) {
    let mut state = self.lock();
    state.contents.insert(
      lesson.id,
      Revisioned {
        revision: 1,
        snapshot: LessonContent {
          lesson_id: lesson.id,
          title: lesson.title.clone(),
          body: body.into(),
        },
      },
    );
    let lessons = state.lessons.entry(lesson.course_id).or_default();
    lessons.push(lesson);
    lessons.sort_by_key(|l| l.position);
  }

  /// Fail the next `n` writes with a transport error.
  pub fn fail_next(&self, n: usize) {
    let mut state = self.lock();
    for _ in 0..n {
      state.injected.push_back(Injected::Transport);
    }
  }

  /// Reject the next write with a validation message.
  pub fn reject_next(&self, message: impl Into<String>) {
    self
      .lock()
      .injected
      .push_back(Injected::Reject(message.into()));
  }

  /// Number of write calls received, including failed ones.
  pub fn writes(&self) -> usize {
    self.lock().writes
  }

  pub fn course(&self, id: u64) -> Option<Course> {
    self.lock().courses.get(&id).cloned()
  }

  pub fn lessons(&self, course_id: u64) -> Vec<Lesson> {
    self
      .lock()
      .lessons
      .get(&course_id)
      .cloned()
      .unwrap_or_default()
  }

  pub fn lesson_content(&self, lesson_id: u64) -> Option<Revisioned<LessonContent>> {
    self.lock().contents.get(&lesson_id).cloned()
  }

  /// Simulate another client saving the lesson. Returns the new revision.
  pub fn edit_lesson_externally(&self, lesson_id: u64, body: impl Into<String>) -> u64 {
    let mut state = self.lock();
    let Some(content) = state.contents.get_mut(&lesson_id) else {
      return 0;
    };
    content.revision += 1;
    content.snapshot.body = body.into();
    debug!(lesson_id, revision = content.revision, "external edit");
    content.revision
  }

  async fn delay(&self) {
    let latency = self.lock().latency;
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
  }

  /// Count a write and apply any injected failure.
  async fn begin_write<T>(&self) -> Result<Option<ApiResponse<T>>> {
    self.delay().await;
    let mut state = self.lock();
    state.writes += 1;
    match state.injected.pop_front() {
      Some(Injected::Transport) => Err(Error::transport("connection reset by peer")),
      Some(Injected::Reject(message)) => Ok(Some(ApiResponse::rejected(message))),
      None => Ok(None),
    }
  }
}

#[async_trait]
impl CourseApi for MemoryCourseApi {
  async fn list_admin_courses(&self, filters: &BTreeMap<String, String>) -> Result<Vec<Course>> {
    self.delay().await;
    let status = filters.get("status");
    let search = filters.get("search").map(|s| s.to_lowercase());
    Ok(
      self
        .lock()
        .courses
        .values()
        .filter(|c| status.map_or(true, |s| c.status.to_string() == *s))
        .filter(|c| {
          search
            .as_ref()
            .map_or(true, |q| c.title.to_lowercase().contains(q))
        })
        .cloned()
        .collect(),
    )
  }

  async fn get_course(&self, course_id: u64) -> Result<Course> {
    self.delay().await;
    self
      .course(course_id)
      .ok_or_else(|| Error::validation(format!("course {} not found", course_id)))
  }

  async fn list_lessons(&self, course_id: u64) -> Result<Vec<Lesson>> {
    self.delay().await;
    Ok(self.lessons(course_id))
  }

  async fn update_pricing(&self, course_id: u64, pricing: &Pricing) -> Result<ApiResponse<Course>> {
    if let Some(response) = self.begin_write().await? {
      return Ok(response);
    }
    if !pricing.is_free && pricing.price_cents == 0 {
      return Ok(ApiResponse::rejected("a paid course needs a price"));
    }
    if pricing
      .discounted_price_cents
      .is_some_and(|d| d >= pricing.price_cents)
    {
      return Ok(ApiResponse::rejected("discount must be below the price"));
    }

    let mut state = self.lock();
    let Some(course) = state.courses.get_mut(&course_id) else {
      return Ok(ApiResponse::rejected(format!("course {} not found", course_id)));
    };
    course.pricing = pricing.clone();
    // A free course has nothing to discount.
    if course.pricing.is_free {
      course.pricing.discounted_price_cents = None;
    }
    Ok(ApiResponse::ok(course.clone()))
  }

  async fn delete_course(&self, course_id: u64) -> Result<ApiResponse<()>> {
    if let Some(response) = self.begin_write().await? {
      return Ok(response);
    }
    let mut state = self.lock();
    if state.courses.remove(&course_id).is_none() {
      return Ok(ApiResponse::rejected(format!("course {} not found", course_id)));
    }
    state.lessons.remove(&course_id);
    Ok(ApiResponse::ok(()))
  }

  async fn reorder_lessons(
    &self,
    course_id: u64,
    positions: &BTreeMap<String, i64>,
  ) -> Result<ApiResponse<Vec<Lesson>>> {
    if let Some(response) = self.begin_write().await? {
      return Ok(response);
    }
    let mut state = self.lock();
    let Some(lessons) = state.lessons.get_mut(&course_id) else {
      return Ok(ApiResponse::rejected(format!("course {} has no lessons", course_id)));
    };

    let values = lessons
      .iter()
      .map(serde_json::to_value)
      .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut reordered = reorder_items(&values, positions)
      .into_iter()
      .map(serde_json::from_value::<Lesson>)
      .collect::<std::result::Result<Vec<_>, _>>()?;
    for (index, lesson) in reordered.iter_mut().enumerate() {
      lesson.position = index as i64;
    }
    *lessons = reordered.clone();
    Ok(ApiResponse::ok(reordered))
  }

  async fn get_lesson_content(&self, lesson_id: u64) -> Result<Revisioned<LessonContent>> {
    self.delay().await;
    self
      .lesson_content(lesson_id)
      .ok_or_else(|| Error::validation(format!("lesson {} not found", lesson_id)))
  }

  async fn save_lesson_content(
    &self,
    request: &SaveRequest<LessonContent>,
  ) -> Result<ApiResponse<Revisioned<LessonContent>>> {
    if let Some(response) = self.begin_write().await? {
      return Ok(response);
    }
    let Ok(lesson_id) = request.entity_id.parse::<u64>() else {
      return Ok(ApiResponse::rejected(format!("invalid lesson id {}", request.entity_id)));
    };
    if request.snapshot.title.trim().is_empty() {
      return Ok(ApiResponse::rejected("title is required"));
    }

    let mut state = self.lock();
    let Some(content) = state.contents.get_mut(&lesson_id) else {
      return Ok(ApiResponse::rejected(format!("lesson {} not found", lesson_id)));
    };
    // A save based on an old revision is not applied; the caller gets the
    // current copy back and decides whether that is a conflict.
    if request.base_revision == content.revision {
      content.revision += 1;
      content.snapshot = request.snapshot.clone();
    }
    Ok(ApiResponse::ok(content.clone()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn content(body: &str) -> LessonContent {
    LessonContent {
      lesson_id: 10,
      title: "Intro".into(),
      body: body.into(),
    }
  }

  fn save(base_revision: u64, body: &str) -> SaveRequest<LessonContent> {
    SaveRequest {
      entity_id: "10".into(),
      base_revision,
      snapshot: content(body),
    }
  }

  #[tokio::test]
  async fn test_filters() {
    let api = MemoryCourseApi::seeded();
    let published = api
      .list_admin_courses(&BTreeMap::from([("status".into(), "published".into())]))
      .await
      .unwrap();
    assert_eq!(published.iter().map(|c| c.id).collect::<Vec<_>>(), [1, 2]);

    let search = api
      .list_admin_courses(&BTreeMap::from([("search".into(), "unsafe".into())]))
      .await
      .unwrap();
    assert_eq!(search.len(), 1);
    assert_eq!(search[0].id, 3);
  }

  #[tokio::test]
  async fn test_save_on_current_revision_advances_it() {
    let api = MemoryCourseApi::seeded();
    let response = api
      .save_lesson_content(&save(1, "new"))
      .await
      .unwrap()
      .into_result()
      .unwrap();
    assert_eq!(response.revision, 2);
    assert_eq!(response.snapshot.body, "new");
  }

  #[tokio::test]
  async fn test_save_on_stale_revision_returns_current_copy() {
    let api = MemoryCourseApi::seeded();
    api.edit_lesson_externally(10, "theirs");
    let response = api
      .save_lesson_content(&save(1, "mine"))
      .await
      .unwrap()
      .into_result()
      .unwrap();
    assert_eq!(response.revision, 2);
    assert_eq!(response.snapshot.body, "theirs");
  }

  #[tokio::test]
  async fn test_injected_failures_apply_in_order() {
    let api = MemoryCourseApi::seeded();
    api.fail_next(1);
    api.reject_next("not today");

    assert!(api.delete_course(3).await.unwrap_err().is_retryable());
    let rejected = api.delete_course(3).await.unwrap();
    assert!(!rejected.success);
    assert!(api.course(3).is_some());

    assert!(api.delete_course(3).await.unwrap().success);
    assert!(api.course(3).is_none());
    assert_eq!(api.writes(), 3);
  }

  #[tokio::test]
  async fn test_reorder_rewrites_positions() {
    let api = MemoryCourseApi::seeded();
    let lessons = api
      .reorder_lessons(1, &BTreeMap::from([("12".into(), 0)]))
      .await
      .unwrap()
      .into_result()
      .unwrap();
    let order: Vec<_> = lessons.iter().map(|l| (l.id, l.position)).collect();
    // 12 ties with 10 at position 0 and loses on original index.
    assert_eq!(order, [(10, 0), (12, 1), (11, 2)]);
  }

  #[tokio::test]
  async fn test_making_a_course_free_drops_its_discount() {
    let api = MemoryCourseApi::seeded();
    let mut pricing = api.course(1).unwrap().pricing;
    assert_eq!(pricing.discounted_price_cents, Some(3900));

    pricing.is_free = true;
    let saved = api
      .update_pricing(1, &pricing)
      .await
      .unwrap()
      .into_result()
      .unwrap();
    assert!(saved.pricing.is_free);
    assert_eq!(saved.pricing.price_cents, 4900);
    assert_eq!(saved.pricing.discounted_price_cents, None);
    assert_eq!(api.course(1).unwrap().pricing, saved.pricing);
  }

  #[tokio::test]
  async fn test_paid_course_without_price_is_rejected() {
    let api = MemoryCourseApi::seeded();
    let response = api.update_pricing(2, &Pricing::paid(0)).await.unwrap();
    assert_eq!(response.message.as_deref(), Some("a paid course needs a price"));
    assert!(api.course(2).unwrap().pricing.is_free);
  }
}
