use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ApiResponse, CourseApi, Revisioned, SaveRequest};
use crate::config::ApiConfig;
use crate::courses::{Course, Lesson, LessonContent, Pricing};
use crate::error::{Error, Result};

/// Course API client over HTTP
#[derive(Clone)]
pub struct HttpCourseApi {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl HttpCourseApi {
  pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self> {
    let mut base = Url::parse(&config.url)
      .map_err(|e| Error::transport(format!("invalid API url {}: {}", config.url, e)))?;
    // Relative joins replace the last segment unless the base ends in '/'.
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(concat!("learnsync/", env!("CARGO_PKG_VERSION")))
      .build()?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  fn url(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| Error::transport(format!("invalid endpoint {}: {}", path, e)))
  }

  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
    let url = self.url(path)?;
    debug!(%method, %url, "api request");
    let request = self.client.request(method, url);
    Ok(match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    })
  }

  /// Send and decode the response envelope.
  ///
  /// Client errors usually carry an envelope with a message; when they do not,
  /// the status line becomes the rejection message. Server errors and
  /// connection failures are transport errors.
  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<ApiResponse<T>> {
    let response = request.send().await?;
    let status = response.status();

    if status.is_server_error() || status == StatusCode::UNAUTHORIZED {
      return Err(Error::transport(format!("server responded {}", status)));
    }
    if status.is_client_error() {
      let body = response.text().await?;
      return Ok(
        serde_json::from_str(&body).unwrap_or_else(|_| ApiResponse::rejected(status.to_string())),
      );
    }
    Ok(response.json().await?)
  }

  async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let request = self.request(Method::GET, path)?;
    self.send(request).await?.into_result()
  }

  async fn write<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<ApiResponse<T>>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    let mut request = self.request(method, path)?;
    if let Some(body) = body {
      request = request.json(body);
    }
    self.send(request).await
  }
}

#[async_trait]
impl CourseApi for HttpCourseApi {
  async fn list_admin_courses(&self, filters: &BTreeMap<String, String>) -> Result<Vec<Course>> {
    let request = self
      .request(Method::GET, "admin/courses")?
      .query(&filters.iter().collect::<Vec<_>>());
    self.send(request).await?.into_result()
  }

  async fn get_course(&self, course_id: u64) -> Result<Course> {
    self.get(&format!("courses/{}", course_id)).await
  }

  async fn list_lessons(&self, course_id: u64) -> Result<Vec<Lesson>> {
    self.get(&format!("courses/{}/lessons", course_id)).await
  }

  async fn update_pricing(&self, course_id: u64, pricing: &Pricing) -> Result<ApiResponse<Course>> {
    self
      .write(
        Method::PATCH,
        &format!("admin/courses/{}/pricing", course_id),
        Some(pricing),
      )
      .await
  }

  async fn delete_course(&self, course_id: u64) -> Result<ApiResponse<()>> {
    self
      .write::<(), _>(Method::DELETE, &format!("admin/courses/{}", course_id), None)
      .await
  }

  async fn reorder_lessons(
    &self,
    course_id: u64,
    positions: &BTreeMap<String, i64>,
  ) -> Result<ApiResponse<Vec<Lesson>>> {
    let body = json!({ "positions": positions });
    self
      .write(
        Method::PUT,
        &format!("admin/courses/{}/lessons/order", course_id),
        Some(&body),
      )
      .await
  }

  async fn get_lesson_content(&self, lesson_id: u64) -> Result<Revisioned<LessonContent>> {
    self.get(&format!("lessons/{}/content", lesson_id)).await
  }

  async fn save_lesson_content(
    &self,
    request: &SaveRequest<LessonContent>,
  ) -> Result<ApiResponse<Revisioned<LessonContent>>> {
    self
      .write(
        Method::PUT,
        &format!("lessons/{}/content", request.entity_id),
        Some(request),
      )
      .await
  }
}
