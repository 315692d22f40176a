//! Artifact repository mounts.
//!
//! A backend owns one URL prefix and knows how to fill the object store from
//! its origin. The set of variants is closed and picked from `repo_type` when
//! the configuration is loaded.

pub mod conditional;
mod maven;
mod pull_through;

use axum::response::Response;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{BackendConfig, RepoType};
use crate::store::ObjectStore;

pub use conditional::ResourceRequest;
pub use maven::MavenBackend;
pub use pull_through::PullThrough;

pub enum Backend {
  Maven(MavenBackend),
}

impl Backend {
  /// Construct the variant named by `config.repo_type`.
  pub fn from_config(config: BackendConfig, client: reqwest::Client) -> Result<Self> {
    match config.repo_type {
      RepoType::Maven => Ok(Backend::Maven(MavenBackend::new(config, client)?)),
    }
  }

  pub fn config(&self) -> &BackendConfig {
    match self {
      Backend::Maven(backend) => backend.config(),
    }
  }

  pub fn prefix(&self) -> &str {
    &self.config().prefix
  }

  /// Case-insensitive prefix match.
  pub fn matches(&self, prefix: &str) -> bool {
    self.prefix().eq_ignore_ascii_case(prefix)
  }

  pub fn resources(&self) -> &PullThrough {
    match self {
      Backend::Maven(backend) => backend.resources(),
    }
  }

  /// Serve `path` (relative to the prefix) from the store, filling it from
  /// the origin on a miss.
  pub async fn get_resource(
    &self,
    path: &str,
    request: &ResourceRequest,
    store: &Arc<dyn ObjectStore>,
  ) -> Response {
    match self {
      Backend::Maven(backend) => backend.get_resource(path, request, store).await,
    }
  }
}

/// Build the HTTP client shared by every backend.
pub fn origin_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
  let mut builder = reqwest::Client::builder().user_agent(concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION")
  ));
  if let Some(timeout) = timeout {
    builder = builder.timeout(timeout);
  }
  builder
    .build()
    .map_err(|e| eyre!("Failed to create origin HTTP client: {}", e))
}

/// Instantiate every configured backend, in name order.
pub fn build_backends(
  configs: &BTreeMap<String, BackendConfig>,
  client: &reqwest::Client,
) -> Result<Vec<Backend>> {
  configs
    .iter()
    .map(|(name, config)| {
      let backend = Backend::from_config(config.clone(), client.clone())
        .map_err(|e| eyre!("Failed to build backend {}: {}", name, e))?;
      info!(
        backend = %name,
        prefix = %config.prefix,
        origin = %config.url,
        "Registered backend"
      );
      Ok(backend)
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(prefix: &str) -> BackendConfig {
    BackendConfig {
      prefix: prefix.to_string(),
      repo_type: RepoType::Maven,
      url: "http://origin.example/maven2/".to_string(),
      cache_duration: Some("1d".to_string()),
    }
  }

  #[test]
  fn registry_builds_variants_in_name_order() {
    let configs = BTreeMap::from([
      ("zeta".to_string(), config("z")),
      ("alpha".to_string(), config("a")),
    ]);
    let backends = build_backends(&configs, &reqwest::Client::new()).unwrap();

    let prefixes: Vec<&str> = backends.iter().map(Backend::prefix).collect();
    assert_eq!(prefixes, vec!["a", "z"]);
    assert!(matches!(backends[0], Backend::Maven(_)));
  }

  #[test]
  fn prefix_matching_ignores_case() {
    let backend = Backend::from_config(config("Central"), reqwest::Client::new()).unwrap();
    assert!(backend.matches("central"));
    assert!(backend.matches("CENTRAL"));
    assert!(!backend.matches("central2"));
  }
}
