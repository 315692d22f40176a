//! Serve-from-store-or-populate flow shared by every backend variant.

use axum::body::Body;
use axum::http::HeaderValue;
use axum::response::Response;
use futures::TryStreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::conditional::{self, ResourceRequest};
use crate::cache::{FetchCoordinator, ResourceStat, StatCache};
use crate::store::ObjectStore;

enum Lookup {
  Served(Response),
  Missing,
  Failed,
}

/// Per-backend serving state: validator cache and single-flight table.
///
/// Variants only differ in how they populate the store on a miss, which is
/// the `populate` future handed to [`PullThrough::serve`].
#[derive(Debug)]
pub struct PullThrough {
  prefix: String,
  stats: StatCache,
  flights: FetchCoordinator,
  cache_control: Option<HeaderValue>,
}

impl PullThrough {
  pub fn new(prefix: &str, cache_duration: Option<Duration>) -> Self {
    let cache_control = cache_duration.and_then(|d| {
      HeaderValue::from_str(&format!("public, max-age={}", d.as_secs())).ok()
    });

    Self {
      prefix: prefix.to_string(),
      stats: StatCache::new(),
      flights: FetchCoordinator::new(),
      cache_control,
    }
  }

  /// Store key of a resource: `<prefix>/<path>`.
  pub fn object_key(&self, path: &str) -> String {
    format!("{}/{}", self.prefix, path)
  }

  pub fn stats(&self) -> &StatCache {
    &self.stats
  }

  pub fn flights(&self) -> &FetchCoordinator {
    &self.flights
  }

  /// Answer a request for `path`, populating the store through `populate`
  /// (called with the object key) when the object is missing.
  pub async fn serve<F, Fut>(
    &self,
    path: &str,
    request: &ResourceRequest,
    store: &Arc<dyn ObjectStore>,
    populate: F,
  ) -> Response
  where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
  {
    if !request.is_read() {
      return conditional::method_not_allowed();
    }

    if let Some(stat) = self.stats.get(path) {
      if request.is_not_modified(&stat) {
        debug!(prefix = %self.prefix, path, "Not modified");
        return conditional::not_modified(&stat, self.cache_control.as_ref());
      }
    }

    let key = self.object_key(path);
    match self.lookup(path, &key, request, store).await {
      Lookup::Served(response) => return response,
      Lookup::Failed => return conditional::not_found(),
      Lookup::Missing => {}
    }

    debug!(%key, "Cache miss");
    self
      .flights
      .run_once(&key, || populate(key.clone()))
      .await;

    match self.lookup(path, &key, request, store).await {
      Lookup::Served(response) => response,
      Lookup::Missing | Lookup::Failed => conditional::not_found(),
    }
  }

  async fn lookup(
    &self,
    path: &str,
    key: &str,
    request: &ResourceRequest,
    store: &Arc<dyn ObjectStore>,
  ) -> Lookup {
    let attributes = match store.attributes(key).await {
      Ok(Some(attributes)) => attributes,
      Ok(None) => return Lookup::Missing,
      Err(e) => {
        error!(key, error = %e, "Reading object attributes");
        return Lookup::Failed;
      }
    };

    let stat = ResourceStat::from_attributes(&attributes);
    self.stats.observe(path, stat.clone());

    if request.is_head() {
      return Lookup::Served(conditional::found(
        &stat,
        attributes.size,
        Body::empty(),
        self.cache_control.as_ref(),
      ));
    }

    let stream = match store.open_reader(key).await {
      Ok(Some(stream)) => stream,
      // Removed between the attribute fetch and the read
      Ok(None) => return Lookup::Missing,
      Err(e) => {
        error!(key, error = %e, "Opening object");
        return Lookup::Failed;
      }
    };

    let owned_key = key.to_string();
    let body = stream.inspect_err(move |e| {
      warn!(key = %owned_key, error = %e, "Object stream failed mid-response");
    });

    Lookup::Served(conditional::found(
      &stat,
      attributes.size,
      Body::from_stream(body),
      self.cache_control.as_ref(),
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{ByteStream, MemoryStore, ObjectAttributes, ObjectWriter};
  use async_trait::async_trait;
  use axum::http::{header, HeaderMap, Method, StatusCode};
  use bytes::Bytes;
  use color_eyre::{eyre::eyre, Result};
  use futures::StreamExt;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Clone, Copy)]
  enum Fault {
    Attributes,
    OpenReader,
    MidStream,
  }

  /// Memory store that fails one kind of read.
  struct FaultyStore {
    inner: MemoryStore,
    fault: Fault,
  }

  #[async_trait]
  impl ObjectStore for FaultyStore {
    async fn attributes(&self, key: &str) -> Result<Option<ObjectAttributes>> {
      match self.fault {
        Fault::Attributes => Err(eyre!("attribute read failed")),
        _ => self.inner.attributes(key).await,
      }
    }

    async fn open_reader(&self, key: &str) -> Result<Option<ByteStream>> {
      match self.fault {
        Fault::OpenReader => Err(eyre!("open failed")),
        Fault::MidStream => {
          if self.inner.open_reader(key).await?.is_none() {
            return Ok(None);
          }
          let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"pay")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "read failed")),
          ];
          Ok(Some(futures::stream::iter(chunks).boxed()))
        }
        Fault::Attributes => self.inner.open_reader(key).await,
      }
    }

    async fn open_writer(
      &self,
      key: &str,
      metadata: HashMap<String, String>,
    ) -> Result<Box<dyn ObjectWriter>> {
      self.inner.open_writer(key, metadata).await
    }
  }

  async fn faulty(fault: Fault) -> Arc<dyn ObjectStore> {
    let inner = MemoryStore::new();
    put(&inner, "central/a.jar", b"payload").await;
    Arc::new(FaultyStore { inner, fault })
  }

  fn get() -> ResourceRequest {
    ResourceRequest::new(Method::GET, HeaderMap::new())
  }

  fn with_header(method: Method, name: header::HeaderName, value: &str) -> ResourceRequest {
    let mut headers = HeaderMap::new();
    headers.insert(name, HeaderValue::from_str(value).unwrap());
    ResourceRequest::new(method, headers)
  }

  async fn put(store: &MemoryStore, key: &str, body: &'static [u8]) {
    let mut writer = store.open_writer(key, HashMap::new()).await.unwrap();
    writer.write(Bytes::from_static(body)).await.unwrap();
    writer.close().await.unwrap();
  }

  async fn body_of(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
      .await
      .unwrap()
  }

  fn setup() -> (PullThrough, MemoryStore, Arc<dyn ObjectStore>) {
    let memory = MemoryStore::new();
    let store: Arc<dyn ObjectStore> = Arc::new(memory.clone());
    (PullThrough::new("central", None), memory, store)
  }

  #[tokio::test]
  async fn rejects_non_read_methods_without_touching_anything() {
    let (resources, memory, store) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    for method in [Method::POST, Method::PUT, Method::DELETE] {
      let counter = Arc::clone(&calls);
      let request = ResourceRequest::new(method, HeaderMap::new());
      let response = resources
        .serve("a.jar", &request, &store, |_| async move {
          counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
      assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
      assert_eq!(response.headers()[header::ALLOW], "GET,HEAD");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(memory.is_empty());
    assert!(resources.stats().is_empty());
  }

  #[tokio::test]
  async fn serves_stored_object_and_records_stat() {
    let (resources, memory, store) = setup();
    put(&memory, "central/a.jar", b"payload").await;

    let response = resources
      .serve("a.jar", &get(), &store, |_| async { panic!("no fetch on hit"); })
      .await;
    assert_eq!(response.status(), StatusCode::OK);
    let stat = resources.stats().get("a.jar").unwrap();
    assert_eq!(response.headers()[header::ETAG], stat.etag.as_str());
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "7");
    assert_eq!(body_of(response).await, Bytes::from_static(b"payload"));
  }

  #[tokio::test]
  async fn miss_populates_then_serves() {
    let (resources, memory, store) = setup();
    let fetches = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fetches);
    let writer_store = memory.clone();
    let response = resources
      .serve("org/b.pom", &get(), &store, move |key| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        put(&writer_store, &key, b"<project/>").await;
      })
      .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_of(response).await, Bytes::from_static(b"<project/>"));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(memory.keys(), vec!["central/org/b.pom".to_string()]);
  }

  #[tokio::test]
  async fn failed_population_is_not_found() {
    let (resources, memory, store) = setup();
    let response = resources
      .serve("missing.jar", &get(), &store, |_| async {})
      .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(memory.is_empty());
    assert!(resources.stats().get("missing.jar").is_none());
  }

  #[tokio::test]
  async fn conditional_requests_short_circuit_on_cached_stat() {
    let (resources, memory, store) = setup();
    put(&memory, "central/a.jar", b"payload").await;
    resources
      .serve("a.jar", &get(), &store, |_| async {})
      .await;
    let stat = resources.stats().get("a.jar").unwrap();

    let response = resources
      .serve(
        "a.jar",
        &with_header(Method::GET, header::IF_NONE_MATCH, &stat.etag),
        &store,
        |_| async {},
      )
      .await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers()[header::ETAG], stat.etag.as_str());

    let response = resources
      .serve(
        "a.jar",
        &with_header(Method::GET, header::IF_NONE_MATCH, "xyz"),
        &store,
        |_| async {},
      )
      .await;
    assert_eq!(response.status(), StatusCode::OK);

    let since = conditional::format_http_date(&stat.last_modified);
    let response = resources
      .serve(
        "a.jar",
        &with_header(Method::HEAD, header::IF_MODIFIED_SINCE, &since),
        &store,
        |_| async {},
      )
      .await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    let before =
      conditional::format_http_date(&(stat.last_modified - chrono::Duration::seconds(1)));
    let response = resources
      .serve(
        "a.jar",
        &with_header(Method::GET, header::IF_MODIFIED_SINCE, &before),
        &store,
        |_| async {},
      )
      .await;
    assert_eq!(response.status(), StatusCode::OK);
  }

  #[tokio::test]
  async fn head_matches_get_headers_without_body() {
    let (resources, memory, store) = setup();
    put(&memory, "central/a.jar", b"payload").await;

    let get_response = resources.serve("a.jar", &get(), &store, |_| async {}).await;
    let head_response = resources
      .serve(
        "a.jar",
        &ResourceRequest::new(Method::HEAD, HeaderMap::new()),
        &store,
        |_| async {},
      )
      .await;

    assert_eq!(head_response.status(), StatusCode::OK);
    assert_eq!(head_response.headers(), get_response.headers());
    assert!(body_of(head_response).await.is_empty());
  }

  #[tokio::test]
  async fn cache_duration_adds_cache_control() {
    let memory = MemoryStore::new();
    let store: Arc<dyn ObjectStore> = Arc::new(memory.clone());
    let resources = PullThrough::new("central", Some(Duration::from_secs(3600)));
    put(&memory, "central/a.jar", b"payload").await;

    let response = resources.serve("a.jar", &get(), &store, |_| async {}).await;
    assert_eq!(
      response.headers()[header::CACHE_CONTROL],
      "public, max-age=3600"
    );
  }

  #[tokio::test]
  async fn store_errors_are_not_found_without_fetching() {
    for fault in [Fault::Attributes, Fault::OpenReader] {
      let resources = PullThrough::new("central", None);
      let store = faulty(fault).await;
      let fetches = Arc::new(AtomicUsize::new(0));

      let counter = Arc::clone(&fetches);
      let response = resources
        .serve("a.jar", &get(), &store, move |_| async move {
          counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

      assert_eq!(response.status(), StatusCode::NOT_FOUND);
      assert_eq!(fetches.load(Ordering::SeqCst), 0);
      assert_eq!(resources.flights().in_flight(), 0);
    }
  }

  #[tokio::test]
  async fn attribute_errors_leave_stats_untouched() {
    let resources = PullThrough::new("central", None);
    let store = faulty(Fault::Attributes).await;

    resources.serve("a.jar", &get(), &store, |_| async {}).await;
    assert!(resources.stats().is_empty());
  }

  #[tokio::test]
  async fn mid_body_read_failure_cuts_the_response_short() {
    let resources = PullThrough::new("central", None);
    let store = faulty(Fault::MidStream).await;

    let response = resources.serve("a.jar", &get(), &store, |_| async {}).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "7");
    assert!(axum::body::to_bytes(response.into_body(), usize::MAX)
      .await
      .is_err());

    // HEAD never opens the object
    let head = ResourceRequest::new(Method::HEAD, HeaderMap::new());
    let response = resources.serve("a.jar", &head, &store, |_| async {}).await;
    assert_eq!(response.status(), StatusCode::OK);
  }
}
