//! Process-local object store.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{validate_key, ByteStream, ObjectAttributes, ObjectStore, ObjectWriter};

#[derive(Debug, Clone)]
struct StoredObject {
  data: Bytes,
  attributes: ObjectAttributes,
}

type Objects = Arc<RwLock<HashMap<String, StoredObject>>>;

/// Object store backed by a map of complete objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  objects: Objects,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of published objects.
  pub fn len(&self) -> usize {
    self.objects.read().map(|objects| objects.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Published object keys, sorted.
  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self
      .objects
      .read()
      .map(|objects| objects.keys().cloned().collect())
      .unwrap_or_default();
    keys.sort();
    keys
  }

  fn get(&self, key: &str) -> Result<Option<StoredObject>> {
    let objects = self
      .objects
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(objects.get(key).cloned())
  }
}

#[async_trait]
impl ObjectStore for MemoryStore {
  async fn attributes(&self, key: &str) -> Result<Option<ObjectAttributes>> {
    validate_key(key)?;
    Ok(self.get(key)?.map(|object| object.attributes))
  }

  async fn open_reader(&self, key: &str) -> Result<Option<ByteStream>> {
    validate_key(key)?;
    Ok(
      self
        .get(key)?
        .map(|object| futures::stream::once(async move { Ok(object.data) }).boxed()),
    )
  }

  async fn open_writer(
    &self,
    key: &str,
    metadata: HashMap<String, String>,
  ) -> Result<Box<dyn ObjectWriter>> {
    validate_key(key)?;
    Ok(Box::new(MemoryWriter {
      objects: Arc::clone(&self.objects),
      key: key.to_string(),
      metadata,
      buffer: BytesMut::new(),
      hasher: Sha256::new(),
    }))
  }
}

struct MemoryWriter {
  objects: Objects,
  key: String,
  metadata: HashMap<String, String>,
  buffer: BytesMut,
  hasher: Sha256,
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
  async fn write(&mut self, chunk: Bytes) -> Result<()> {
    self.hasher.update(&chunk);
    self.buffer.extend_from_slice(&chunk);
    Ok(())
  }

  async fn close(self: Box<Self>) -> Result<()> {
    let MemoryWriter {
      objects,
      key,
      metadata,
      buffer,
      hasher,
    } = *self;
    let data = buffer.freeze();
    let attributes = ObjectAttributes {
      content_hash: hasher.finalize().to_vec(),
      size: data.len() as u64,
      modified: Utc::now(),
      metadata,
    };

    let mut objects = objects
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    objects.insert(key, StoredObject { data, attributes });
    Ok(())
  }

  async fn abort(self: Box<Self>) -> Result<()> {
    Ok(()) // Nothing was published
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::TryStreamExt;

  async fn read_all(store: &MemoryStore, key: &str) -> Option<Vec<u8>> {
    let stream = store.open_reader(key).await.unwrap()?;
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    Some(chunks.concat())
  }

  #[tokio::test]
  async fn close_publishes_object_with_attributes() {
    let store = MemoryStore::new();
    let metadata = HashMap::from([("ETag".to_string(), "\"e1\"".to_string())]);

    let mut writer = store.open_writer("central/a.jar", metadata).await.unwrap();
    writer.write(Bytes::from_static(b"hello ")).await.unwrap();
    writer.write(Bytes::from_static(b"world")).await.unwrap();
    assert!(store.attributes("central/a.jar").await.unwrap().is_none());
    writer.close().await.unwrap();

    let attrs = store.attributes("central/a.jar").await.unwrap().unwrap();
    assert_eq!(attrs.size, 11);
    assert_eq!(attrs.content_hash, Sha256::digest(b"hello world").to_vec());
    assert_eq!(attrs.metadata.get("ETag").map(String::as_str), Some("\"e1\""));
    assert_eq!(
      read_all(&store, "central/a.jar").await.as_deref(),
      Some(&b"hello world"[..])
    );
  }

  #[tokio::test]
  async fn aborted_and_dropped_writers_publish_nothing() {
    let store = MemoryStore::new();

    let mut writer = store.open_writer("central/a.jar", HashMap::new()).await.unwrap();
    writer.write(Bytes::from_static(b"partial")).await.unwrap();
    writer.abort().await.unwrap();

    let mut writer = store.open_writer("central/b.jar", HashMap::new()).await.unwrap();
    writer.write(Bytes::from_static(b"partial")).await.unwrap();
    drop(writer);

    assert!(store.is_empty());
    assert!(read_all(&store, "central/a.jar").await.is_none());
  }

  #[tokio::test]
  async fn invalid_keys_are_errors() {
    let store = MemoryStore::new();
    assert!(store.attributes("central/../etc").await.is_err());
  }
}
