//! Core types shared by the cache layers.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::attendance::DateRange;

/// Memory-cache key derived from query parameters.
///
/// Two logically identical queries always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn for_range(range: &DateRange) -> Self {
    Self(format!("{}|{}", range.start, range.end))
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was obtained from its origin
  pub cached_at: DateTime<Utc>,
}

impl<T> CacheResult<T> {
  /// Fresh data straight from the remote source.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: Utc::now(),
    }
  }

  /// Remote failed, serving what the local store had.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Utc::now(),
    }
  }

  /// Re-serve a remembered result. Offline results keep their tag so the
  /// caller can still show that the data is stale.
  pub fn remembered(&self) -> Self
  where
    T: Clone,
  {
    let source = match self.source {
      CacheSource::Offline => CacheSource::Offline,
      CacheSource::Network | CacheSource::Memory => CacheSource::Memory,
    };
    Self {
      data: self.data.clone(),
      source,
      cached_at: self.cached_at,
    }
  }

  pub fn is_fallback(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from the in-memory cache within its TTL
  Memory,
  /// Offline mode - network unavailable, serving the local store
  Offline,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CacheSource::Network => write!(f, "network"),
      CacheSource::Memory => write!(f, "memory"),
      CacheSource::Offline => write!(f, "offline"),
    }
  }
}
