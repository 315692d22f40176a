//! Durable object storage used as the persistent cache tier.
//!
//! The proxy treats the store as an opaque key-value blob service:
//! - attributes (content hash, size, modification time, metadata) per key
//! - streaming reads
//! - staged writes that only become visible once explicitly closed

mod filesystem;
mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{StoreConfig, StoreKind};

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;

/// Metadata key under which the origin's `ETag` header is recorded.
pub const ORIGIN_ETAG_METADATA: &str = "ETag";

/// Streamed object content.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Attributes the store keeps for every published object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttributes {
  /// Store-computed content fingerprint (SHA-256)
  pub content_hash: Vec<u8>,
  /// Object length in bytes
  pub size: u64,
  /// When the object was published
  pub modified: DateTime<Utc>,
  /// Free-form string metadata supplied at write time
  pub metadata: HashMap<String, String>,
}

/// Trait for object store drivers.
///
/// "Not found" is never an error: lookups return `Ok(None)` for absent keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
  /// Get the attributes of a published object.
  async fn attributes(&self, key: &str) -> Result<Option<ObjectAttributes>>;

  /// Open a published object for streaming.
  async fn open_reader(&self, key: &str) -> Result<Option<ByteStream>>;

  /// Start writing an object. Nothing is visible under `key` until the
  /// returned writer is closed.
  async fn open_writer(
    &self,
    key: &str,
    metadata: HashMap<String, String>,
  ) -> Result<Box<dyn ObjectWriter>>;
}

/// Staged write of a single object.
///
/// Dropping a writer without closing it discards everything written so far.
#[async_trait]
pub trait ObjectWriter: Send {
  /// Append a chunk to the staged object.
  async fn write(&mut self, chunk: Bytes) -> Result<()>;

  /// Publish the staged object under its final key.
  async fn close(self: Box<Self>) -> Result<()>;

  /// Discard the staged object.
  async fn abort(self: Box<Self>) -> Result<()>;
}

/// Open the store described by the configuration.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
  match config.kind {
    StoreKind::Filesystem => {
      let root = config
        .path
        .as_ref()
        .ok_or_else(|| eyre!("Filesystem store requires a path"))?;
      let store = FilesystemStore::open(root).await?;
      info!(root = %root.display(), "Opened filesystem store");
      Ok(Arc::new(store))
    }
    StoreKind::Memory => {
      info!("Opened in-memory store, cached artifacts will not survive a restart");
      Ok(Arc::new(MemoryStore::new()))
    }
  }
}

/// Reject empty keys and keys with relative segments.
///
/// Empty segments are allowed: `a/b/` and `a/b` are distinct keys.
pub(crate) fn validate_key(key: &str) -> Result<()> {
  if key.is_empty() {
    return Err(eyre!("Empty object key"));
  }
  if key.split('/').any(|segment| segment == "." || segment == "..") {
    return Err(eyre!("Invalid object key: {}", key));
  }
  Ok(())
}
