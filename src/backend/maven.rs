//! Maven-style repository proxied from a plain HTTP origin.

use axum::response::Response;
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use reqwest::{header::ETAG, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::conditional::ResourceRequest;
use super::pull_through::PullThrough;
use crate::config::BackendConfig;
use crate::store::{ObjectStore, ORIGIN_ETAG_METADATA};

pub struct MavenBackend {
  config: BackendConfig,
  base: Url,
  client: reqwest::Client,
  resources: PullThrough,
}

impl MavenBackend {
  pub fn new(config: BackendConfig, client: reqwest::Client) -> Result<Self> {
    let resources = PullThrough::new(&config.prefix, config.cache_duration()?);
    let base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid origin url {}: {}", config.url, e))?;
    Ok(Self {
      config,
      base,
      client,
      resources,
    })
  }

  pub fn config(&self) -> &BackendConfig {
    &self.config
  }

  pub fn resources(&self) -> &PullThrough {
    &self.resources
  }

  /// Origin location of `path`: the base URL with the path appended as-is.
  ///
  /// `None` when the result would resolve outside the base URL.
  pub fn origin_url(&self, path: &str) -> Option<String> {
    let url = format!("{}{}", self.config.url, path);
    let resolved = Url::parse(&url).ok()?;
    resolved
      .as_str()
      .starts_with(self.base.as_str())
      .then_some(url)
  }

  pub async fn get_resource(
    &self,
    path: &str,
    request: &ResourceRequest,
    store: &Arc<dyn ObjectStore>,
  ) -> Response {
    let client = self.client.clone();
    let url = self.origin_url(path);
    let target = Arc::clone(store);

    self
      .resources
      .serve(path, request, store, move |key| populate(client, url, target, key))
      .await
  }
}

/// Copy one artifact from the origin into the store.
///
/// Every failure is logged and leaves the key absent; callers find out by
/// looking at the store again.
async fn populate(
  client: reqwest::Client,
  url: Option<String>,
  store: Arc<dyn ObjectStore>,
  key: String,
) {
  let Some(url) = url else {
    warn!(%key, "Resource path resolves outside the origin");
    return;
  };

  // Another fetch may have published the object since this caller missed
  match store.attributes(&key).await {
    Ok(Some(_)) => {
      debug!(%key, "Already populated");
      return;
    }
    Ok(None) => {}
    Err(e) => {
      error!(%key, error = %e, "Checking object store before fetch");
      return;
    }
  }

  debug!(%url, "Fetching from origin");
  let response = match client.get(&url).send().await {
    Ok(response) => response,
    Err(e) => {
      error!(%url, error = %e, "Calling origin");
      return;
    }
  };

  match response.status() {
    StatusCode::OK => {}
    StatusCode::NOT_FOUND => {
      debug!(%url, "Resource not found at origin");
      return;
    }
    status => {
      error!(%url, %status, "Origin error");
      return;
    }
  }

  let mut metadata = HashMap::new();
  if let Some(etag) = response.headers().get(ETAG).and_then(|v| v.to_str().ok()) {
    metadata.insert(ORIGIN_ETAG_METADATA.to_string(), etag.to_string());
  }

  match copy_to_store(response, store.as_ref(), &key, metadata).await {
    Ok(size) => info!(%url, %key, size, "Cached artifact"),
    Err(e) => error!(%url, %key, error = %e, "Writing to object store"),
  }
}

/// Stream the origin body into a staged object, publishing it only once the
/// whole body has arrived.
async fn copy_to_store(
  response: reqwest::Response,
  store: &dyn ObjectStore,
  key: &str,
  metadata: HashMap<String, String>,
) -> Result<u64> {
  let mut writer = store.open_writer(key, metadata).await?;
  let mut body = response.bytes_stream();
  let mut size = 0u64;

  while let Some(chunk) = body.next().await {
    let written = match chunk {
      Ok(chunk) => {
        size += chunk.len() as u64;
        writer.write(chunk).await
      }
      Err(e) => Err(eyre!("Reading origin body: {}", e)),
    };

    if let Err(e) = written {
      if let Err(abort_err) = writer.abort().await {
        warn!(key, error = %abort_err, "Discarding partial object");
      }
      return Err(e);
    }
  }

  writer.close().await?;
  Ok(size)
}
