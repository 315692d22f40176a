//! In-memory validator cache (ETag / Last-Modified per resource).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::store::ObjectAttributes;

/// Last known validators for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStat {
  /// Strong validator sent as `ETag`
  pub etag: String,
  /// Whole-second modification time sent as `Last-Modified`
  pub last_modified: DateTime<Utc>,
}

impl ResourceStat {
  pub fn new(etag: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
    Self {
      etag: etag.into(),
      last_modified: last_modified.trunc_subsecs(0),
    }
  }

  /// Derive validators from the store's own attributes.
  pub fn from_attributes(attributes: &ObjectAttributes) -> Self {
    Self::new(
      URL_SAFE_NO_PAD.encode(&attributes.content_hash),
      attributes.modified,
    )
  }
}

/// Per-backend map from resource path to its last known [`ResourceStat`].
///
/// Best-effort accelerator: entries are never evicted and never trusted
/// beyond answering conditional requests.
#[derive(Debug, Default)]
pub struct StatCache {
  entries: RwLock<HashMap<String, ResourceStat>>,
}

impl StatCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, path: &str) -> Option<ResourceStat> {
    self
      .entries
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(path)
      .cloned()
  }

  /// Insert or replace unconditionally.
  pub fn set(&self, path: &str, stat: ResourceStat) {
    self
      .entries
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(path.to_string(), stat);
  }

  /// Record a fresh observation. The entry only moves forward in time: it is
  /// written when absent or when `stat` is strictly newer than the cached one.
  ///
  /// Returns whether the entry changed.
  pub fn observe(&self, path: &str, stat: ResourceStat) -> bool {
    let mut entries = self
      .entries
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    match entries.get(path) {
      Some(cached) if cached.last_modified >= stat.last_modified => false,
      _ => {
        entries.insert(path.to_string(), stat);
        true
      }
    }
  }

  pub fn len(&self) -> usize {
    self
      .entries
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
