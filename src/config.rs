use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Application name used for config/data directory paths
const APP_NAME: &str = "attendance-cache";

/// Per-call remote timeout when neither the config nor the caller sets one
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the attendance API (e.g. "https://school.example.org/api/")
  pub url: Url,
  /// Per-call timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl RemoteConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// How long a memory-cached range stays fresh
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  /// Local store location (default: $XDG_DATA_HOME/attendance-cache/attendance.db)
  pub db_path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      db_path: None,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_interval_secs")]
  pub interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_interval_secs(),
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
  /// Upper bound on threads doing blocking store and write-through work
  #[serde(default = "default_blocking_threads")]
  pub blocking_threads: usize,
}

impl Default for WorkersConfig {
  fn default() -> Self {
    Self {
      blocking_threads: default_blocking_threads(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  DEFAULT_TIMEOUT_SECS
}

fn default_ttl_secs() -> u64 {
  300
}

fn default_interval_secs() -> u64 {
  300
}

fn default_blocking_threads() -> usize {
  4
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./attendance-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/attendance-cache/config.yaml
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
        "No configuration file found. Create one at ~/.config/{}/config.yaml",
        APP_NAME
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(format!("{}.yaml", APP_NAME));
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_NAME).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the API bearer token from `ATTENDANCE_API_TOKEN`, if set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("ATTENDANCE_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  /// Directory for the local store and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join(APP_NAME))
  }

  pub fn db_path(&self) -> Result<PathBuf> {
    match &self.cache.db_path {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("attendance.db")),
    }
  }
}
