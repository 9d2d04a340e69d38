//! Course catalogue: entity types, cache keys and the reads and writes the
//! admin and editor screens issue.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::api::{CourseApi, HttpCourseApi};
use crate::autosave::{Autosave, AutosaveOptions};
use crate::cache::{CacheKey, CacheStore};
use crate::config::Config;
use crate::error::Result;
use crate::mutation::{Mutation, MutationClient, Patch};
use crate::query::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourseStatus {
  Draft,
  Published,
  Archived,
}

impl fmt::Display for CourseStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      CourseStatus::Draft => "draft",
      CourseStatus::Published => "published",
      CourseStatus::Archived => "archived",
    };
    write!(f, "{}", s)
  }
}

/// Prices are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
  pub is_free: bool,
  pub price_cents: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub discounted_price_cents: Option<u64>,
}

impl Pricing {
  pub fn free() -> Self {
    Self {
      is_free: true,
      price_cents: 0,
      discounted_price_cents: None,
    }
  }

  pub fn paid(price_cents: u64) -> Self {
    Self {
      is_free: false,
      price_cents,
      discounted_price_cents: None,
    }
  }

  pub fn with_discount(mut self, discounted_price_cents: u64) -> Self {
    self.discounted_price_cents = Some(discounted_price_cents);
    self
  }
}

/// Course as listed in the admin catalogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
  pub id: u64,
  pub title: String,
  pub status: CourseStatus,
  pub pricing: Pricing,
  pub lessons_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
  pub id: u64,
  pub course_id: u64,
  pub title: String,
  pub position: i64,
}

/// Long-form lesson body edited under autosave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonContent {
  pub lesson_id: u64,
  pub title: String,
  pub body: String,
}

/// Cache keys for course data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CourseKey {
  /// Every admin course list, whatever its filters (a prefix)
  AdminCourseLists,
  /// One filtered admin course list
  AdminCourses { filters: BTreeMap<String, String> },
  Course { id: u64 },
  CourseLessons { course_id: u64 },
  Lesson { id: u64 },
}

impl CourseKey {
  pub fn admin_courses<K, V>(filters: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: Into<String>,
    V: Into<String>,
  {
    Self::AdminCourses {
      filters: filters
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    }
  }
}

impl From<CourseKey> for CacheKey {
  fn from(key: CourseKey) -> Self {
    match key {
      CourseKey::AdminCourseLists => CacheKey::new("admin-courses"),
      CourseKey::AdminCourses { filters } => CacheKey::new("admin-courses").with(filters),
      CourseKey::Course { id } => CacheKey::new("course").with(id),
      CourseKey::CourseLessons { course_id } => CacheKey::new("course-lessons").with(course_id),
      CourseKey::Lesson { id } => CacheKey::new("lesson").with(id),
    }
  }
}

fn key(key: CourseKey) -> CacheKey {
  key.into()
}

/// Variables for a pricing change.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingChange {
  pub course_id: u64,
  pub pricing: Pricing,
}

impl PricingChange {
  /// Flip a course between free and paid, keeping its price.
  pub fn toggle_free(course: &Course) -> Self {
    let mut pricing = course.pricing.clone();
    pricing.is_free = !pricing.is_free;
    Self {
      course_id: course.id,
      pricing,
    }
  }
}

/// Variables for a lesson reorder: `lesson id -> new position`.
#[derive(Debug, Clone, PartialEq)]
pub struct LessonOrder {
  pub course_id: u64,
  pub positions: BTreeMap<String, i64>,
}

impl LessonOrder {
  pub fn new<K: ToString>(course_id: u64, positions: impl IntoIterator<Item = (K, i64)>) -> Self {
    Self {
      course_id,
      positions: positions
        .into_iter()
        .map(|(k, p)| (k.to_string(), p))
        .collect(),
    }
  }
}

/// Course API bound to a cache store.
#[derive(Clone)]
pub struct CourseClient {
  api: Arc<dyn CourseApi>,
  mutations: MutationClient,
}

impl CourseClient {
  pub fn new(api: Arc<dyn CourseApi>, store: CacheStore) -> Self {
    Self {
      api,
      mutations: MutationClient::new(store),
    }
  }

  /// Client for the configured HTTP backend. The bearer token comes from
  /// `LEARNSYNC_API_TOKEN`.
  pub fn http(config: &Config) -> Result<Self> {
    let api = HttpCourseApi::new(&config.api, Config::api_token())?;
    let store = CacheStore::new().with_stale_time(config.cache.stale_time());
    Ok(Self::new(Arc::new(api), store))
  }

  pub fn store(&self) -> &CacheStore {
    self.mutations.store()
  }

  pub fn api(&self) -> &Arc<dyn CourseApi> {
    &self.api
  }

  pub fn admin_courses(&self, filters: BTreeMap<String, String>) -> Query<Vec<Course>> {
    let api = Arc::clone(&self.api);
    let query_filters = filters.clone();
    Query::new(
      self.store().clone(),
      key(CourseKey::AdminCourses { filters }),
      move || {
        let api = Arc::clone(&api);
        let filters = query_filters.clone();
        async move { api.list_admin_courses(&filters).await }
      },
    )
  }

  pub fn course(&self, id: u64) -> Query<Course> {
    let api = Arc::clone(&self.api);
    Query::new(self.store().clone(), key(CourseKey::Course { id }), move || {
      let api = Arc::clone(&api);
      async move { api.get_course(id).await }
    })
  }

  pub fn course_lessons(&self, course_id: u64) -> Query<Vec<Lesson>> {
    let api = Arc::clone(&self.api);
    Query::new(
      self.store().clone(),
      key(CourseKey::CourseLessons { course_id }),
      move || {
        let api = Arc::clone(&api);
        async move { api.list_lessons(course_id).await }
      },
    )
  }

  /// Change a course's pricing. Lists and the course detail show the new
  /// pricing immediately.
  pub fn update_pricing(&self) -> Mutation<PricingChange, Course> {
    let api = Arc::clone(&self.api);
    self
      .mutations
      .mutation("update-pricing", move |change: PricingChange| {
        let api = Arc::clone(&api);
        async move { api.update_pricing(change.course_id, &change.pricing).await }
      })
      .targets(|change| {
        vec![
          key(CourseKey::AdminCourseLists),
          key(CourseKey::Course {
            id: change.course_id,
          }),
        ]
      })
      .optimistic(|change| {
        Patch::set_field(change.course_id, "/pricing", json!(change.pricing))
      })
      .serialize_by(|change| change.course_id.to_string())
      .invalidates([key(CourseKey::AdminCourseLists), CacheKey::new("course")])
  }

  /// Delete a course. It disappears from every admin list at once.
  pub fn delete_course(&self) -> Mutation<u64, ()> {
    let api = Arc::clone(&self.api);
    self
      .mutations
      .mutation("delete-course", move |id: u64| {
        let api = Arc::clone(&api);
        async move { api.delete_course(id).await }
      })
      .targets(|_| vec![key(CourseKey::AdminCourseLists)])
      .optimistic(|id| Patch::remove_item(*id))
      .invalidates([key(CourseKey::AdminCourseLists)])
  }

  /// Persist a new lesson order. Reorders of the same course never
  /// interleave.
  pub fn reorder_lessons(&self) -> Mutation<LessonOrder, Vec<Lesson>> {
    let api = Arc::clone(&self.api);
    self
      .mutations
      .mutation("reorder-lessons", move |order: LessonOrder| {
        let api = Arc::clone(&api);
        async move { api.reorder_lessons(order.course_id, &order.positions).await }
      })
      .targets(|order| {
        vec![key(CourseKey::CourseLessons {
          course_id: order.course_id,
        })]
      })
      .optimistic(|order| Patch::reorder_with_field(order.positions.clone(), "position"))
      .serialize_by(|order| order.course_id.to_string())
      .invalidates([CacheKey::new("course-lessons")])
  }

  /// Open an autosave session on a lesson's content.
  ///
  /// The entity id of the session is the lesson id. Completed saves mark the
  /// lesson's cached entry stale.
  pub async fn lesson_autosave(
    &self,
    lesson_id: u64,
    options: AutosaveOptions<LessonContent>,
  ) -> Result<Autosave<LessonContent>> {
    let initial = self.api.get_lesson_content(lesson_id).await?;
    self
      .store()
      .set_as(key(CourseKey::Lesson { id: lesson_id }), &initial.snapshot)?;

    let api = Arc::clone(&self.api);
    let options = options.invalidates(
      self.store().clone(),
      [key(CourseKey::Lesson { id: lesson_id })],
    );
    Ok(Autosave::open(
      lesson_id.to_string(),
      initial,
      options,
      move |request| {
        let api = Arc::clone(&api);
        async move { api.save_lesson_content(&request).await }
      },
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::MemoryCourseApi;
  use crate::autosave::{AutosaveStatus, Resolution, SaveOutcome};
  use crate::error::Error;
  use crate::query::QueryState;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;
  use tokio::time::sleep;

  fn client(api: &MemoryCourseApi) -> CourseClient {
    CourseClient::new(Arc::new(api.clone()), CacheStore::new())
  }

  async fn load<T>(query: &mut Query<T>) -> T
  where
    T: Clone + Serialize + serde::de::DeserializeOwned + Send + 'static,
  {
    query.fetch();
    for _ in 0..100 {
      query.poll();
      if !query.is_loading() {
        break;
      }
      sleep(Duration::from_millis(5)).await;
    }
    query.data().cloned().unwrap()
  }

  fn ids(courses: &[Course]) -> Vec<u64> {
    courses.iter().map(|c| c.id).collect()
  }

  fn titles(lessons: &[Lesson]) -> Vec<String> {
    lessons.iter().map(|l| l.title.clone()).collect()
  }

  #[test]
  fn test_course_keys() {
    let filtered: CacheKey = CourseKey::admin_courses([("status", "published")]).into();
    let all: CacheKey = CourseKey::AdminCourseLists.into();
    assert!(filtered.starts_with(&all));
    assert_eq!(
      CacheKey::from(CourseKey::CourseLessons { course_id: 3 }).to_string(),
      r#"["course-lessons", 3]"#
    );
  }

  #[test]
  fn test_toggle_free_keeps_price() {
    let course = Course {
      id: 1,
      title: "Rust".into(),
      status: CourseStatus::Published,
      pricing: Pricing::paid(4900),
      lessons_count: 0,
    };
    let change = PricingChange::toggle_free(&course);
    assert!(change.pricing.is_free);
    assert_eq!(change.pricing.price_cents, 4900);
  }

  #[tokio::test]
  async fn test_http_client_reports_unreachable_server() {
    let mut config = Config::default();
    config.api.url = "http://127.0.0.1:9/api/".to_string();
    config.api.timeout_secs = 2;
    let courses = CourseClient::http(&config).unwrap();

    let mut list = courses.admin_courses(BTreeMap::new());
    list.fetch();
    match list.settled().await {
      QueryState::Error { retryable, .. } => assert!(*retryable),
      other => panic!("unexpected state: {:?}", other),
    }
    assert!(courses.store().get(list.key()).is_none());
  }

  #[test]
  fn test_http_client_rejects_bad_url() {
    let mut config = Config::default();
    config.api.url = "not a url".to_string();
    assert!(matches!(
      CourseClient::http(&config),
      Err(Error::Transport(_))
    ));
  }

  #[tokio::test]
  async fn test_failed_delete_restores_every_list() {
    let api = MemoryCourseApi::seeded();
    let courses = client(&api);
    let mut all = courses.admin_courses(BTreeMap::new());
    let mut published = courses.admin_courses(BTreeMap::from([(
      "status".to_string(),
      "published".to_string(),
    )]));
    let before_all = load(&mut all).await;
    let before_published = load(&mut published).await;
    let entries_before = courses.store().matching(|_| true);

    api.fail_next(1);
    let seen_in_on_error = Arc::new(Mutex::new(None));
    let seen = seen_in_on_error.clone();
    let store = courses.store().clone();
    let delete = courses.delete_course().on_error(move |_, id| {
      let list: Vec<Course> = store
        .get_as(&CourseKey::admin_courses(BTreeMap::<String, String>::new()).into())
        .unwrap()
        .unwrap();
      *seen.lock().unwrap() = Some(list.iter().any(|c| c.id == *id));
    });

    let err = delete.mutate_async(1).await.unwrap_err();
    assert!(err.is_retryable());

    // Data is back exactly as it was; only the stale flag differs after settle.
    let entries_after = courses.store().matching(|_| true);
    assert_eq!(entries_after.len(), entries_before.len());
    for (before, after) in entries_before.iter().zip(&entries_after) {
      assert_eq!(before.key, after.key);
      assert_eq!(before.data, after.data);
      assert!(after.is_stale);
    }
    assert_eq!(*seen_in_on_error.lock().unwrap(), Some(true));
    assert_eq!(api.course(1).map(|c| c.id), Some(1));

    // The settled lists refetch and still contain the course.
    assert!(all.poll());
    assert!(published.poll());
    assert_eq!(ids(&load(&mut all).await), ids(&before_all));
    assert_eq!(ids(&load(&mut published).await), ids(&before_published));
  }

  #[tokio::test]
  async fn test_delete_removes_course_from_lists_at_once() {
    let api = MemoryCourseApi::seeded().with_latency(Duration::from_millis(50));
    let courses = client(&api);
    let mut all = courses.admin_courses(BTreeMap::new());
    assert!(ids(&load(&mut all).await).contains(&2));

    let pending = courses.delete_course().mutate(2);
    sleep(Duration::from_millis(10)).await;
    all.poll();
    assert!(!ids(all.data().unwrap()).contains(&2));

    pending.await.unwrap().unwrap();
    assert!(api.course(2).is_none());
    assert!(!ids(&load(&mut all).await).contains(&2));
  }

  #[tokio::test]
  async fn test_rejected_pricing_rolls_back() {
    let api = MemoryCourseApi::seeded();
    let courses = client(&api);
    let mut detail = courses.course(1);
    let before = load(&mut detail).await;

    let change = PricingChange {
      course_id: 1,
      pricing: Pricing::paid(0),
    };
    let err = courses
      .update_pricing()
      .mutate_async(change)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));

    let cached: Course = courses
      .store()
      .get_as(&CourseKey::Course { id: 1 }.into())
      .unwrap()
      .unwrap();
    assert_eq!(cached, before);
  }

  #[tokio::test]
  async fn test_pricing_toggle_is_visible_before_server_answers() {
    let api = MemoryCourseApi::seeded().with_latency(Duration::from_millis(50));
    let courses = client(&api);
    let mut detail = courses.course(1);
    let before = load(&mut detail).await;

    let pending = courses
      .update_pricing()
      .mutate(PricingChange::toggle_free(&before));
    sleep(Duration::from_millis(10)).await;
    detail.poll();
    assert_eq!(
      detail.data().unwrap().pricing.is_free,
      !before.pricing.is_free
    );

    let saved = pending.await.unwrap().unwrap();
    assert_eq!(saved.pricing.is_free, !before.pricing.is_free);
    assert_eq!(api.course(1).unwrap().pricing, saved.pricing);
  }

  #[tokio::test]
  async fn test_free_toggle_refetches_server_derived_discount() {
    let api = MemoryCourseApi::seeded().with_latency(Duration::from_millis(50));
    let courses = client(&api);
    let list_key: CacheKey = CourseKey::admin_courses(BTreeMap::<String, String>::new()).into();
    let mut list = courses.admin_courses(BTreeMap::new());
    let before = load(&mut list).await;
    let course = before.iter().find(|c| c.id == 1).unwrap().clone();
    assert!(!course.pricing.is_free);
    assert_eq!(course.pricing.discounted_price_cents, Some(3900));

    let pending = courses
      .update_pricing()
      .mutate(PricingChange::toggle_free(&course));
    sleep(Duration::from_millis(10)).await;
    list.poll();
    let optimistic = list.data().unwrap().iter().find(|c| c.id == 1).unwrap().clone();
    assert!(optimistic.pricing.is_free);
    // the client does not know the server clears the discount
    assert_eq!(optimistic.pricing.discounted_price_cents, Some(3900));

    pending.await.unwrap().unwrap();
    assert!(courses.store().get(&list_key).unwrap().is_stale);

    // mounted, so the invalidation starts a refetch
    assert!(list.poll());
    assert!(list.is_loading());
    let refetched = load(&mut list).await;
    let course = refetched.iter().find(|c| c.id == 1).unwrap();
    assert!(course.pricing.is_free);
    assert_eq!(course.pricing.discounted_price_cents, None);
    assert!(!courses.store().get(&list_key).unwrap().is_stale);
  }

  #[tokio::test]
  async fn test_reorder_shows_optimistic_order_then_server_order() {
    let api = MemoryCourseApi::seeded().with_latency(Duration::from_millis(50));
    let courses = client(&api);
    let mut lessons = courses.course_lessons(1);
    let before = load(&mut lessons).await;
    assert_eq!(titles(&before), ["Intro", "Ownership", "Borrowing"]);

    let order = LessonOrder::new(1, [(before[2].id, 0), (before[0].id, 1), (before[1].id, 2)]);
    let pending = courses.reorder_lessons().mutate(order);
    sleep(Duration::from_millis(10)).await;
    lessons.poll();
    let optimistic = lessons.data().unwrap().clone();
    assert_eq!(titles(&optimistic), ["Borrowing", "Intro", "Ownership"]);
    assert_eq!(
      optimistic.iter().map(|l| l.position).collect::<Vec<_>>(),
      [0, 1, 2]
    );

    pending.await.unwrap().unwrap();
    let settled = load(&mut lessons).await;
    assert_eq!(titles(&settled), ["Borrowing", "Intro", "Ownership"]);
    assert_eq!(titles(&api.lessons(1)), titles(&settled));
  }

  #[tokio::test]
  async fn test_rapid_reorders_apply_in_order() {
    let api = MemoryCourseApi::seeded().with_latency(Duration::from_millis(30));
    let courses = client(&api);
    let mut lessons = courses.course_lessons(1);
    let before = load(&mut lessons).await;
    let (intro, ownership, borrowing) = (before[0].id, before[1].id, before[2].id);

    let writes = Arc::new(AtomicUsize::new(0));
    let counted = writes.clone();
    let reorder = courses.reorder_lessons().on_settled(move |_| {
      counted.fetch_add(1, Ordering::SeqCst);
    });
    let first = reorder.mutate(LessonOrder::new(1, [(borrowing, 0), (intro, 1), (ownership, 2)]));
    let second = reorder.mutate(LessonOrder::new(1, [(ownership, 0), (borrowing, 1), (intro, 2)]));

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(writes.load(Ordering::SeqCst), 2);
    assert_eq!(titles(&api.lessons(1)), ["Ownership", "Borrowing", "Intro"]);
    assert_eq!(
      titles(&load(&mut lessons).await),
      ["Ownership", "Borrowing", "Intro"]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_lesson_autosave_round_trip() {
    let api = MemoryCourseApi::seeded();
    let courses = client(&api);
    let autosave = courses
      .lesson_autosave(10, AutosaveOptions::default())
      .await
      .unwrap();
    let initial = api.lesson_content(10).unwrap();

    let mut content = initial.snapshot.clone();
    content.body.push_str(" More detail.");
    autosave.edit(content.clone()).unwrap();
    sleep(Duration::from_millis(2100)).await;

    assert_eq!(autosave.status(), AutosaveStatus::Saved);
    let saved = api.lesson_content(10).unwrap();
    assert_eq!(saved.snapshot, content);
    assert_eq!(saved.revision, initial.revision + 1);
    assert!(courses
      .store()
      .get(&CourseKey::Lesson { id: 10 }.into())
      .unwrap()
      .is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_external_edit_surfaces_conflict() {
    let api = MemoryCourseApi::seeded();
    let courses = client(&api);
    let autosave = courses
      .lesson_autosave(10, AutosaveOptions::default())
      .await
      .unwrap();

    let remote_revision = api.edit_lesson_externally(10, "Rewritten by a co-author.");
    let mut mine = api.lesson_content(10).unwrap().snapshot;
    mine.body = "My own rewrite.".to_string();
    autosave.edit(mine).unwrap();

    let err = autosave.force_save().await.unwrap_err();
    assert!(err.is_conflict());
    let record = autosave.conflict_data().unwrap();
    assert_eq!(record.remote_revision, remote_revision);
    assert_eq!(record.remote_snapshot.body, "Rewritten by a co-author.");
    assert_eq!(record.local_snapshot.body, "My own rewrite.");

    let outcome = autosave.resolve_conflict(Resolution::Local).await.unwrap();
    assert_eq!(
      outcome,
      SaveOutcome::Saved {
        revision: remote_revision + 1
      }
    );
    assert_eq!(api.lesson_content(10).unwrap().snapshot.body, "My own rewrite.");
  }
}
