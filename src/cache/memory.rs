//! In-process, time-bounded cache of query results.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::traits::CacheKey;

/// A cached payload together with when it was stored and how long it lives.
///
/// Entries are never patched; a refresh replaces the whole entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  payload: T,
  stored_at: Instant,
  ttl: Duration,
}

impl<T> CacheEntry<T> {
  pub fn new(payload: T, ttl: Duration) -> Self {
    Self {
      payload,
      stored_at: Instant::now(),
      ttl,
    }
  }

  pub fn payload(&self) -> &T {
    &self.payload
  }

  pub fn is_expired(&self) -> bool {
    self.stored_at.elapsed() > self.ttl
  }
}

/// Map of cache entries keyed by query.
///
/// Every invalidation bumps a generation counter. A caller that read the
/// generation before going to the network can only store its result if no
/// invalidation happened in between, so a write is never followed by a
/// reinsert of data fetched before it.
///
/// The lock is only held for the map operation itself.
pub struct MemoryCache<T> {
  inner: Mutex<Entries<T>>,
  default_ttl: Duration,
}

struct Entries<T> {
  map: HashMap<CacheKey, CacheEntry<T>>,
  generation: u64,
}

impl<T: Clone> MemoryCache<T> {
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      inner: Mutex::new(Entries {
        map: HashMap::new(),
        generation: 0,
      }),
      default_ttl,
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Current invalidation generation; pass it back to `insert_if_generation`.
  pub fn generation(&self) -> u64 {
    self.lock().generation
  }

  /// Return the payload for `key` if present and unexpired.
  pub fn get(&self, key: &CacheKey) -> Option<T> {
    let inner = self.lock();
    inner
      .map
      .get(key)
      .filter(|entry| !entry.is_expired())
      .map(|entry| entry.payload().clone())
  }

  /// Store `payload` under `key` with the default TTL, unless the cache was
  /// invalidated since `generation` was read. Returns whether it was stored.
  pub fn insert_if_generation(&self, key: CacheKey, generation: u64, payload: T) -> bool {
    let mut inner = self.lock();
    if inner.generation != generation {
      return false;
    }
    inner.map.retain(|_, entry| !entry.is_expired());
    inner
      .map
      .insert(key, CacheEntry::new(payload, self.default_ttl));
    true
  }

  pub fn invalidate(&self, key: &CacheKey) {
    let mut inner = self.lock();
    inner.generation += 1;
    inner.map.remove(key);
  }

  pub fn invalidate_all(&self) {
    let mut inner = self.lock();
    inner.generation += 1;
    inner.map.clear();
  }

  /// Drop expired entries, returning how many were removed.
  pub fn purge_expired(&self) -> usize {
    let mut inner = self.lock();
    let before = inner.map.len();
    inner.map.retain(|_, entry| !entry.is_expired());
    before - inner.map.len()
  }

  pub fn len(&self) -> usize {
    self.lock().map.len()
  }

  // A panic while holding the map lock cannot leave an entry half-written,
  // so a poisoned map is still usable.
  fn lock(&self) -> MutexGuard<'_, Entries<T>> {
    self
      .inner
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}
