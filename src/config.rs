use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_PORT: u16 = 8678;
pub const DEFAULT_CONFIG_FILE: &str = "slim.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub port: u16,
  /// Address to bind (defaults to loopback, the proxy is meant to be a sidecar)
  #[serde(default = "default_listen")]
  pub listen: IpAddr,
  /// Write logs to this file (daily rotation) instead of stderr
  pub log_file: Option<PathBuf>,
  /// Upper bound for a single origin request, e.g. "5m"
  pub origin_timeout: Option<String>,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub backends: BTreeMap<String, BackendConfig>,
}

fn default_listen() -> IpAddr {
  IpAddr::from([127, 0, 0, 1])
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
  /// Directory tree on a local or mounted filesystem
  #[default]
  Filesystem,
  /// Process memory; nothing survives a restart
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  #[serde(default)]
  pub kind: StoreKind,
  /// Root directory for the filesystem store
  pub path: Option<PathBuf>,
}

/// Repository layouts a backend can proxy.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
  /// Maven-style repository served over plain HTTP GET
  #[serde(alias = "mvn")]
  Maven,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// First path segment routed to this backend (matched case-insensitively)
  pub prefix: String,
  pub repo_type: RepoType,
  /// Origin base URL; the resource path is appended verbatim
  pub url: String,
  /// How long clients may reuse a response, e.g. "7d"
  pub cache_duration: Option<String>,
}

impl BackendConfig {
  /// Parsed `cache_duration`.
  pub fn cache_duration(&self) -> Result<Option<Duration>> {
    self
      .cache_duration
      .as_deref()
      .map(parse_duration)
      .transpose()
      .map_err(|e| eyre!("Invalid cache_duration for prefix {}: {}", self.prefix, e))
  }

  fn validate(&self, name: &str) -> Result<()> {
    if self.prefix.is_empty() {
      return Err(eyre!("Backend {} has an empty prefix", name));
    }
    if self.prefix.contains('/') {
      return Err(eyre!(
        "Backend {} prefix must be a single path segment: {}",
        name,
        self.prefix
      ));
    }

    let url = Url::parse(&self.url)
      .map_err(|e| eyre!("Backend {} has an invalid url {}: {}", name, self.url, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("Backend {} url must be http(s): {}", name, self.url));
    }

    self.cache_duration()?;
    Ok(())
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./slim.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/real-slim-proxy/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create ./{} or pass --config <path>",
        DEFAULT_CONFIG_FILE
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("real-slim-proxy").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to load config file {}: {}", path.display(), e))
  }

  /// Parse, default and validate a YAML document.
  pub fn parse(contents: &str) -> Result<Self> {
    let mut config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.apply_defaults();
    config.validate()?;
    Ok(config)
  }

  fn apply_defaults(&mut self) {
    if self.port == 0 {
      self.port = DEFAULT_PORT;
    }
    if self.store.kind == StoreKind::Filesystem && self.store.path.is_none() {
      self.store.path = dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
        .map(|p| p.join("real-slim-proxy"));
    }
  }

  fn validate(&self) -> Result<()> {
    if self.store.kind == StoreKind::Filesystem && self.store.path.is_none() {
      return Err(eyre!(
        "Could not determine a cache directory, set store.path explicitly"
      ));
    }

    self.origin_timeout()?;

    let mut prefixes = HashSet::new();
    for (name, backend) in &self.backends {
      backend.validate(name)?;
      if !prefixes.insert(backend.prefix.to_lowercase()) {
        return Err(eyre!("Duplicate backend prefix: {}", backend.prefix));
      }
    }

    Ok(())
  }

  /// Parsed `origin_timeout`.
  pub fn origin_timeout(&self) -> Result<Option<Duration>> {
    self
      .origin_timeout
      .as_deref()
      .map(parse_duration)
      .transpose()
      .map_err(|e| eyre!("Invalid origin_timeout: {}", e))
  }
}

/// Parse a human duration such as "90s", "12h", "7d" or "1h 30m".
pub fn parse_duration(value: &str) -> Result<Duration> {
  let value = value.trim();
  humantime::parse_duration(value).map_err(|e| eyre!("{}: {}", value, e))
}
