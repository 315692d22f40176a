//! Object store on a local (or mounted) filesystem.
//!
//! Keys never become paths. Each key is addressed by the hex SHA-256 of the
//! key itself, fanned out on its first two characters:
//! - `objects/<hh>/<digest>`: published object bytes
//! - `meta/<hh>/<digest>.json`: key, content hash, size and write metadata
//! - `staging/`: in-progress writes, renamed into place on close
//!
//! Several processes may share one root. Staging files get unique names and
//! every publish is a rename.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{validate_key, ByteStream, ObjectAttributes, ObjectStore, ObjectWriter};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Sidecar record stored next to every published object.
#[derive(Debug, Serialize, Deserialize)]
struct ObjectMeta {
  #[serde(default)]
  key: String,
  /// Base64 (standard alphabet) SHA-256 of the object bytes
  content_hash: String,
  size: u64,
  /// Modification time of the bytes this record describes
  #[serde(default)]
  modified: Option<DateTime<Utc>>,
  #[serde(default)]
  metadata: HashMap<String, String>,
}

impl ObjectMeta {
  fn describes(&self, size: u64, modified: &DateTime<Utc>) -> bool {
    self.size == size && self.modified.map_or(true, |m| m == *modified)
  }
}

/// Filesystem-backed object store.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
  root: PathBuf,
}

impl FilesystemStore {
  /// Open (creating if needed) a store rooted at `root`.
  pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
    let root = root.as_ref().to_path_buf();
    for dir in ["objects", "meta", "staging"] {
      let path = root.join(dir);
      fs::create_dir_all(&path)
        .await
        .map_err(|e| eyre!("Failed to create store directory {}: {}", path.display(), e))?;
    }

    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
  }

  fn object_path(&self, key: &str) -> PathBuf {
    let digest = Self::digest(key);
    self.root.join("objects").join(&digest[..2]).join(&digest)
  }

  fn meta_path(&self, key: &str) -> PathBuf {
    let digest = Self::digest(key);
    self
      .root
      .join("meta")
      .join(&digest[..2])
      .join(format!("{}.json", digest))
  }

  fn staging_dir(&self) -> PathBuf {
    self.root.join("staging")
  }

  async fn read_meta(&self, key: &str) -> Option<ObjectMeta> {
    let contents = fs::read(self.meta_path(key)).await.ok()?;
    match serde_json::from_slice::<ObjectMeta>(&contents) {
      Ok(meta) if meta.key.is_empty() || meta.key == key => Some(meta),
      Ok(meta) => {
        warn!(key, recorded = %meta.key, "Ignoring metadata recorded for another key");
        None
      }
      Err(e) => {
        warn!(key, error = %e, "Ignoring unreadable object metadata");
        None
      }
    }
  }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
  async fn attributes(&self, key: &str) -> Result<Option<ObjectAttributes>> {
    validate_key(key)?;
    let path = self.object_path(key);
    let file_meta = match fs::metadata(&path).await {
      Ok(m) if m.is_file() => m,
      Ok(_) => return Ok(None),
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(eyre!("Failed to stat {}: {}", path.display(), e)),
    };

    let modified: DateTime<Utc> = file_meta
      .modified()
      .map_err(|e| eyre!("Failed to read mtime of {}: {}", path.display(), e))?
      .into();
    let size = file_meta.len();

    // The sidecar is only trusted when it describes the bytes on disk
    let recorded = self
      .read_meta(key)
      .await
      .filter(|meta| meta.describes(size, &modified))
      .and_then(|meta| {
        STANDARD
          .decode(&meta.content_hash)
          .ok()
          .map(|hash| (hash, meta.metadata))
      });

    let (content_hash, metadata) = match recorded {
      Some(recorded) => recorded,
      None => {
        debug!(key, "Hashing object without usable metadata");
        let content_hash = hash_file(&path).await?;
        let meta = ObjectMeta {
          key: key.to_string(),
          content_hash: STANDARD.encode(&content_hash),
          size,
          modified: Some(modified),
          metadata: HashMap::new(),
        };
        if let Err(e) = publish_meta(&self.staging_dir(), &self.meta_path(key), &meta).await {
          warn!(key, error = %e, "Failed to record object metadata");
        }
        (content_hash, HashMap::new())
      }
    };

    Ok(Some(ObjectAttributes {
      content_hash,
      size,
      modified,
      metadata,
    }))
  }

  async fn open_reader(&self, key: &str) -> Result<Option<ByteStream>> {
    validate_key(key)?;
    let path = self.object_path(key);
    let file = match File::open(&path).await {
      Ok(file) => file,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(eyre!("Failed to open {}: {}", path.display(), e)),
    };

    let is_file = file
      .metadata()
      .await
      .map(|m| m.is_file())
      .map_err(|e| eyre!("Failed to stat {}: {}", path.display(), e))?;
    if !is_file {
      return Ok(None);
    }

    let stream = read_chunks(file).map_ok(BytesMut::freeze);
    Ok(Some(stream.boxed()))
  }

  async fn open_writer(
    &self,
    key: &str,
    metadata: HashMap<String, String>,
  ) -> Result<Box<dyn ObjectWriter>> {
    validate_key(key)?;
    let staging_dir = self.staging_dir();
    let (file, staged) = stage(&staging_dir)?;

    Ok(Box::new(FilesystemWriter {
      file: Some(file),
      staged: Some(staged),
      staging_dir,
      object_path: self.object_path(key),
      meta_path: self.meta_path(key),
      key: key.to_string(),
      metadata,
      hasher: Sha256::new(),
      size: 0,
    }))
  }
}

/// Create a uniquely named staging file. The file is removed when the
/// returned path is dropped.
fn stage(staging_dir: &Path) -> Result<(File, TempPath)> {
  let staged = tempfile::Builder::new()
    .prefix("stage-")
    .tempfile_in(staging_dir)
    .map_err(|e| eyre!("Failed to create staging file in {}: {}", staging_dir.display(), e))?;
  let (file, path) = staged.into_parts();
  Ok((File::from_std(file), path))
}

/// Move a staged file to `target`. On failure the staged file is removed.
async fn publish(staged: TempPath, target: &Path) -> Result<()> {
  create_parent(target).await?;
  fs::rename(&staged, target)
    .await
    .map_err(|e| eyre!("Failed to publish {}: {}", target.display(), e))?;
  // Renamed away, nothing left to clean up
  let _ = staged.keep();
  Ok(())
}

async fn publish_meta(staging_dir: &Path, meta_path: &Path, meta: &ObjectMeta) -> Result<()> {
  let bytes =
    serde_json::to_vec(meta).map_err(|e| eyre!("Failed to serialize metadata: {}", e))?;
  let (mut file, staged) = stage(staging_dir)?;
  file
    .write_all(&bytes)
    .await
    .map_err(|e| eyre!("Failed to write {}: {}", staged.display(), e))?;
  file
    .sync_all()
    .await
    .map_err(|e| eyre!("Failed to sync {}: {}", staged.display(), e))?;
  drop(file);
  publish(staged, meta_path).await
}

fn read_chunks(file: File) -> impl Stream<Item = std::io::Result<BytesMut>> + Send {
  futures::stream::try_unfold(file, |mut file| async move {
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let read = file.read_buf(&mut buf).await?;
    Ok::<_, std::io::Error>(if read == 0 { None } else { Some((buf, file)) })
  })
}

async fn hash_file(path: &Path) -> Result<Vec<u8>> {
  let file = File::open(path)
    .await
    .map_err(|e| eyre!("Failed to open {}: {}", path.display(), e))?;

  let hasher = read_chunks(file)
    .try_fold(Sha256::new(), |mut hasher, chunk| async move {
      hasher.update(&chunk);
      Ok(hasher)
    })
    .await
    .map_err(|e| eyre!("Failed to hash {}: {}", path.display(), e))?;

  Ok(hasher.finalize().to_vec())
}

async fn create_parent(path: &Path) -> Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)
      .await
      .map_err(|e| eyre!("Failed to create directory {}: {}", parent.display(), e))?;
  }
  Ok(())
}

/// Staged write. Dropping it unpublished removes the staging file.
struct FilesystemWriter {
  file: Option<File>,
  staged: Option<TempPath>,
  staging_dir: PathBuf,
  object_path: PathBuf,
  meta_path: PathBuf,
  key: String,
  metadata: HashMap<String, String>,
  hasher: Sha256,
  size: u64,
}

#[async_trait]
impl ObjectWriter for FilesystemWriter {
  async fn write(&mut self, chunk: Bytes) -> Result<()> {
    let file = self
      .file
      .as_mut()
      .ok_or_else(|| eyre!("Write after close"))?;
    file
      .write_all(&chunk)
      .await
      .map_err(|e| eyre!("Failed to write staged {}: {}", self.key, e))?;
    self.hasher.update(&chunk);
    self.size += chunk.len() as u64;
    Ok(())
  }

  async fn close(mut self: Box<Self>) -> Result<()> {
    let (mut file, staged) = match (self.file.take(), self.staged.take()) {
      (Some(file), Some(staged)) => (file, staged),
      _ => return Err(eyre!("Writer already closed")),
    };
    file
      .flush()
      .await
      .map_err(|e| eyre!("Failed to flush {}: {}", staged.display(), e))?;
    file
      .sync_all()
      .await
      .map_err(|e| eyre!("Failed to sync {}: {}", staged.display(), e))?;
    let modified: DateTime<Utc> = file
      .metadata()
      .await
      .and_then(|m| m.modified())
      .map_err(|e| eyre!("Failed to stat {}: {}", staged.display(), e))?
      .into();
    drop(file);

    let meta = ObjectMeta {
      key: std::mem::take(&mut self.key),
      content_hash: STANDARD.encode(self.hasher.clone().finalize()),
      size: self.size,
      modified: Some(modified),
      metadata: std::mem::take(&mut self.metadata),
    };

    // Metadata lands first, so a visible object always has a matching sidecar
    publish_meta(&self.staging_dir, &self.meta_path, &meta).await?;
    publish(staged, &self.object_path).await
  }

  async fn abort(mut self: Box<Self>) -> Result<()> {
    drop(self.file.take());
    match self.staged.take() {
      Some(staged) => staged
        .close()
        .map_err(|e| eyre!("Failed to discard staged {}: {}", self.key, e)),
      None => Ok(()),
    }
  }
}
