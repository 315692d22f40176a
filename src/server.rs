//! Request routing and the HTTP listener.

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use percent_encoding::percent_decode_str;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::backend::{self, conditional, Backend, ResourceRequest};
use crate::config::Config;
use crate::store::{self, ObjectStore};

/// Dispatches requests to the backend owning their first path segment.
pub struct Proxy {
  backends: Vec<Backend>,
  store: Arc<dyn ObjectStore>,
}

impl Proxy {
  pub fn new(backends: Vec<Backend>, store: Arc<dyn ObjectStore>) -> Self {
    Self { backends, store }
  }

  pub fn backends(&self) -> &[Backend] {
    &self.backends
  }

  /// Find the backend for `path` and the resource path relative to it.
  pub fn route(&self, path: &str) -> Option<(&Backend, String)> {
    let (prefix, resource) = split_path(path)?;
    self
      .backends
      .iter()
      .find(|backend| backend.matches(prefix))
      .map(|backend| (backend, resource))
  }

  pub async fn handle(&self, path: &str, request: ResourceRequest) -> Response {
    match self.route(path) {
      Some((backend, resource)) => {
        backend
          .get_resource(&resource, &request, &self.store)
          .await
      }
      None => {
        debug!(path, "No backend for path");
        conditional::not_found()
      }
    }
  }
}

/// Split `/<prefix>/<resource...>` into its prefix and resource path.
///
/// The prefix is the first non-empty segment and the resource is everything
/// after it, verbatim. Paths without a resource, or with `.`/`..` segments
/// (also when percent-encoded), are rejected.
pub fn split_path(path: &str) -> Option<(&str, String)> {
  let (prefix, resource) = path.trim_start_matches('/').split_once('/')?;
  if resource.split('/').all(str::is_empty) || resource.split('/').any(is_dot_segment) {
    return None;
  }
  Some((prefix, resource.to_string()))
}

fn is_dot_segment(segment: &str) -> bool {
  percent_decode_str(segment)
    .decode_utf8_lossy()
    .split(['/', '\\'])
    .any(|part| part == "." || part == "..")
}

async fn dispatch(State(proxy): State<Arc<Proxy>>, request: Request) -> Response {
  let path = request.uri().path().to_string();
  let (parts, _body) = request.into_parts();
  proxy
    .handle(&path, ResourceRequest::new(parts.method, parts.headers))
    .await
}

/// Every path is handled by the dispatcher.
pub fn router(proxy: Arc<Proxy>) -> Router {
  Router::new().fallback(dispatch).with_state(proxy)
}

/// Serve `proxy` on `listener` until `shutdown` resolves.
pub async fn serve<S>(listener: TcpListener, proxy: Arc<Proxy>, shutdown: S) -> Result<()>
where
  S: Future<Output = ()> + Send + 'static,
{
  axum::serve(listener, router(proxy))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

/// Open the store, register backends and serve until SIGINT/SIGTERM.
pub async fn run(config: Config) -> Result<()> {
  let store = store::open_store(&config.store).await?;
  let client = backend::origin_client(config.origin_timeout()?)?;
  let backends = backend::build_backends(&config.backends, &client)?;
  if backends.is_empty() {
    warn!("No backends configured, every request will be answered with 404");
  }

  let addr = SocketAddr::new(config.listen, config.port);
  let listener = TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;

  info!(%addr, "Starting server");
  serve(listener, Arc::new(Proxy::new(backends, store)), shutdown_signal()).await?;
  info!("Server shutdown complete");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      warn!(error = %e, "Failed to listen for Ctrl-C");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        warn!(error = %e, "Failed to listen for SIGTERM");
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => debug!(signal = "SIGINT", "Shutting down"),
    _ = terminate => debug!(signal = "SIGTERM", "Shutting down"),
  }
}
