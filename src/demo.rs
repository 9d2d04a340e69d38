//! Walkthrough of the engine against the in-memory backend.
//!
//! Each scenario logs its steps; the returned report summarises what the
//! client observed.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::api::MemoryCourseApi;
use crate::autosave::{
  AutosaveOptions, DraftStore, NoopDraftStore, Resolution, SqliteDraftStore,
};
use crate::cache::CacheStore;
use crate::config::Config;
use crate::courses::{Course, CourseClient, LessonOrder, PricingChange};
use crate::query::{Query, QueryState};

/// What each scenario ended with.
#[derive(Debug, Default)]
pub struct DemoReport {
  /// The failed delete left the course list exactly as before
  pub rollback_restored: bool,
  /// Discount shown while making course 1 free, and after the refetch
  pub optimistic_discount: Option<u64>,
  pub server_discount: Option<u64>,
  pub optimistic_order: Vec<String>,
  pub server_order: Vec<String>,
  /// Save requests sent for a burst of typing
  pub autosave_writes: usize,
  pub conflict_detected: bool,
  pub final_body: String,
}

impl DemoReport {
  pub fn print(&self) {
    println!(
      "delete with failing server: list restored = {}",
      self.rollback_restored
    );
    println!(
      "make course free:          discount {:?} -> {:?} after refetch",
      self.optimistic_discount, self.server_discount
    );
    println!("reorder (optimistic):      {}", self.optimistic_order.join(", "));
    println!("reorder (server):          {}", self.server_order.join(", "));
    println!("autosave writes for burst: {}", self.autosave_writes);
    println!(
      "concurrent editor:         conflict = {}, final body = {:?}",
      self.conflict_detected, self.final_body
    );
  }
}

async fn load<T>(query: &mut Query<T>) -> Result<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
  query.fetch();
  loop {
    query.poll();
    match query.state() {
      QueryState::Success(data) => return Ok(data.clone()),
      QueryState::Error { message, .. } => {
        return Err(eyre!("Query {} failed: {}", query.key(), message))
      }
      _ => sleep(Duration::from_millis(5)).await,
    }
  }
}

fn discount_of(courses: &[Course], id: u64) -> Option<u64> {
  courses
    .iter()
    .find(|c| c.id == id)
    .and_then(|c| c.pricing.discounted_price_cents)
}

pub async fn run(config: &Config) -> Result<DemoReport> {
  let api = MemoryCourseApi::seeded().with_latency(Duration::from_millis(50));
  let store = CacheStore::new().with_stale_time(config.cache.stale_time());
  let courses = CourseClient::new(Arc::new(api.clone()), store);
  let drafts: Arc<dyn DraftStore> = if config.autosave.drafts {
    Arc::new(SqliteDraftStore::in_memory()?)
  } else {
    Arc::new(NoopDraftStore)
  };
  let options = || {
    AutosaveOptions::default()
      .debounce(config.autosave.debounce())
      .drafts(Arc::clone(&drafts))
  };
  let mut report = DemoReport::default();

  info!("scenario 1: delete a course while the server is failing");
  let mut list = courses.admin_courses(BTreeMap::new());
  let before = load(&mut list).await?;
  api.fail_next(1);
  let result = courses
    .delete_course()
    .on_error(|e, id| warn!(course = id, error = %e, "delete failed, list restored"))
    .mutate_async(1)
    .await;
  let after: Option<Vec<Course>> = courses.store().get_as(list.key())?;
  report.rollback_restored = result.is_err() && after.as_ref() == Some(&before);

  info!("scenario 2: make a paid course free");
  let before = load(&mut list).await?;
  let course = before
    .iter()
    .find(|c| c.id == 1)
    .cloned()
    .ok_or_else(|| eyre!("Course 1 missing from the demo catalogue"))?;
  let pending = courses
    .update_pricing()
    .mutate(PricingChange::toggle_free(&course));
  sleep(Duration::from_millis(10)).await;
  list.poll();
  report.optimistic_discount = list.data().and_then(|cs| discount_of(cs, 1));
  pending.await??;
  report.server_discount = discount_of(&load(&mut list).await?, 1);

  info!("scenario 3: reorder lessons");
  let mut lessons = courses.course_lessons(1);
  let current = load(&mut lessons).await?;
  let order = LessonOrder::new(
    1,
    current
      .iter()
      .rev()
      .enumerate()
      .map(|(i, l)| (l.id, i as i64)),
  );
  let pending = courses.reorder_lessons().mutate(order);
  sleep(Duration::from_millis(10)).await;
  lessons.poll();
  report.optimistic_order = lessons
    .data()
    .map(|ls| ls.iter().map(|l| l.title.clone()).collect())
    .unwrap_or_default();
  pending.await??;
  report.server_order = load(&mut lessons)
    .await?
    .into_iter()
    .map(|l| l.title)
    .collect();

  info!("scenario 4: burst of typing under autosave");
  let session = courses.lesson_autosave(11, options()).await?;
  let writes_before = api.writes();
  let mut content = api
    .lesson_content(11)
    .ok_or_else(|| eyre!("Lesson 11 missing from the demo catalogue"))?
    .snapshot;
  for word in ["Moves", "transfer", "ownership", "between", "bindings."] {
    content.body.push(' ');
    content.body.push_str(word);
    session.edit(content.clone())?;
    sleep(Duration::from_millis(100)).await;
  }
  sleep(config.autosave.debounce() + Duration::from_millis(200)).await;
  report.autosave_writes = api.writes() - writes_before;
  session.close().await?;

  info!("scenario 5: two editors on the same lesson");
  let first = courses.lesson_autosave(12, options()).await?;
  let second = courses.lesson_autosave(12, options()).await?;
  let base = api
    .lesson_content(12)
    .ok_or_else(|| eyre!("Lesson 12 missing from the demo catalogue"))?
    .snapshot;

  let mut theirs = base.clone();
  theirs.body = "Borrowing, as rewritten by a co-author.".into();
  first.edit(theirs)?;
  first.force_save().await?;

  let mut mine = base;
  mine.body = "Borrowing, as rewritten by me.".into();
  second.edit(mine)?;
  match second.force_save().await {
    Err(e) if e.is_conflict() => {
      report.conflict_detected = true;
      if let Some(record) = second.conflict_data() {
        info!(
          remote_revision = record.remote_revision,
          remote = %record.remote_snapshot.body,
          "conflict, keeping local copy"
        );
      }
      second.resolve_conflict(Resolution::Local).await?;
    }
    other => {
      other?;
    }
  }
  first.close().await?;
  second.close().await?;
  report.final_body = api
    .lesson_content(12)
    .map(|c| c.snapshot.body)
    .unwrap_or_default();

  Ok(report)
}
