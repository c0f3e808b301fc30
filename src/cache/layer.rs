//! Cache layer that orchestrates the memory cache, the local store and the
//! remote source.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::attendance::{AttendanceRecord, DateRange, RemoteSource, SyncState};
use crate::config::DEFAULT_TIMEOUT_SECS;
use crate::error::{Error, RemoteError, Result};

use super::memory::MemoryCache;
use super::storage::{LocalStore, StoreStats};
use super::traits::{CacheKey, CacheResult};

type RangeResult = CacheResult<Vec<AttendanceRecord>>;

/// Memory-cache entry count plus the local store snapshot.
#[derive(Debug, Clone)]
pub struct CacheStats {
  pub memory_entries: usize,
  pub memory_ttl: Duration,
  pub store: StoreStats,
}

impl fmt::Display for CacheStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "memory: {} entries (ttl {}s)",
      self.memory_entries,
      self.memory_ttl.as_secs()
    )?;
    write!(f, "store:  {}", self.store)
  }
}

/// Offline-capable attendance service.
///
/// Reads go memory → remote → local store. Writes go remote first and fall
/// back to the local offline queue. Cloning shares the same caches.
pub struct AttendanceCache<R: RemoteSource, S: LocalStore> {
  remote: Arc<R>,
  store: Arc<S>,
  memory: Arc<MemoryCache<RangeResult>>,
  /// Upper bound on every remote call
  remote_timeout: Duration,
  /// Fire-and-forget write-through tasks still running
  pending_writes: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<R: RemoteSource, S: LocalStore> AttendanceCache<R, S> {
  pub fn new(remote: R, store: S, ttl: Duration) -> Self {
    Self {
      remote: Arc::new(remote),
      store: Arc::new(store),
      memory: Arc::new(MemoryCache::new(ttl)),
      remote_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
      pending_writes: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Set the timeout applied to every remote call.
  pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
    self.remote_timeout = timeout;
    self
  }

  #[cfg(test)]
  pub(crate) fn remote(&self) -> &R {
    &self.remote
  }

  pub(crate) fn store(&self) -> &S {
    &self.store
  }

  /// Run a remote call under the configured timeout.
  async fn bounded<T, Fut>(&self, call: Fut) -> Result<T, RemoteError>
  where
    Fut: Future<Output = Result<T, RemoteError>>,
  {
    match tokio::time::timeout(self.remote_timeout, call).await {
      Ok(result) => result,
      Err(_) => Err(RemoteError::Timeout(self.remote_timeout)),
    }
  }

  /// Fetch a date range with a memory-first, local-fallback strategy.
  ///
  /// 1. Unexpired memory entry - return it, no network, no disk
  /// 2. Otherwise ask the remote source and remember the answer
  /// 3. On remote failure, serve the local store and remember that too
  /// 4. Nothing anywhere - `NoCachedData`
  pub async fn get_by_range(&self, range: DateRange) -> Result<RangeResult> {
    let key = CacheKey::for_range(&range);

    if let Some(cached) = self.memory.get(&key) {
      debug!(%key, source = %cached.source, "memory cache hit");
      return Ok(cached.remembered());
    }

    // A write landing while we are out on the network bumps this, and the
    // result fetched before it is then not remembered.
    let generation = self.memory.generation();

    match self.bounded(self.remote.fetch(range.start, range.end)).await {
      Ok(records) => {
        debug!(%key, count = records.len(), "fetched from remote");
        let result = CacheResult::from_network(records);
        self.remember(key, generation, &result);
        self.write_through(result.data.clone());
        Ok(result)
      }
      Err(e) => {
        warn!(%key, error = %e, "remote fetch failed, falling back to local store");
        let records = self.store.query_by_date_range(&range)?;
        if records.is_empty() {
          return Err(Error::NoCachedData { key });
        }

        let result = CacheResult::offline(records);
        self.remember(key, generation, &result);
        Ok(result)
      }
    }
  }

  /// Create a record, queueing it locally when the remote is unreachable.
  ///
  /// The returned record's `sync_state` tells the caller whether the write is
  /// authoritative yet.
  pub async fn create(&self, record: AttendanceRecord) -> Result<AttendanceRecord> {
    match self.remote_create(&record).await {
      Ok(created) => {
        if let Err(e) = self.store.upsert(std::slice::from_ref(&created)) {
          error!(id = created.id, error = %e, "failed to persist created record locally");
        }
        self.memory.invalidate_all();
        info!(id = created.id, user_id = created.user_id, "attendance created");
        Ok(created)
      }
      Err(e) => {
        warn!(user_id = record.user_id, error = %e, "remote create failed, queueing offline");
        let local_id = self.store.save_offline(&record)?;
        self.memory.invalidate_all();
        info!(local_id, user_id = record.user_id, "attendance queued offline");
        Ok(AttendanceRecord {
          id: local_id,
          sync_state: SyncState::Pending,
          ..record
        })
      }
    }
  }

  /// Push a record to the remote source under the timeout.
  ///
  /// An answer without a server-assigned id counts as a failed call, so the
  /// caller keeps the record queued.
  pub(crate) async fn remote_create(
    &self,
    record: &AttendanceRecord,
  ) -> Result<AttendanceRecord, RemoteError> {
    let mut created = self.bounded(self.remote.create(record)).await?;
    if created.id <= 0 {
      return Err(RemoteError::InvalidResponse(format!(
        "server returned non-positive id {}",
        created.id
      )));
    }
    created.sync_state = SyncState::Synced;
    Ok(created)
  }

  /// Records waiting to be pushed to the remote source.
  pub fn list_pending(&self) -> Result<Vec<AttendanceRecord>> {
    Ok(self.store.list_pending()?)
  }

  pub fn invalidate(&self, range: &DateRange) {
    self.memory.invalidate(&CacheKey::for_range(range));
  }

  pub fn invalidate_memory(&self) {
    self.memory.invalidate_all();
  }

  /// Drop both cache layers, including any queued offline writes.
  pub async fn clear_all(&self) -> Result<()> {
    self.flush_writes().await;
    self.memory.invalidate_all();

    let pending = self.store.stats()?.pending;
    if pending > 0 {
      warn!(pending, "clearing local store with unsynced records");
    }
    self.store.clear()?;
    info!("all caches cleared");
    Ok(())
  }

  pub fn stats(&self) -> Result<CacheStats> {
    self.memory.purge_expired();
    Ok(CacheStats {
      memory_entries: self.memory.len(),
      memory_ttl: self.memory.default_ttl(),
      store: self.store.stats()?,
    })
  }

  fn remember(&self, key: CacheKey, generation: u64, result: &RangeResult) {
    if !self
      .memory
      .insert_if_generation(key.clone(), generation, result.clone())
    {
      debug!(%key, "cache invalidated during fetch, not remembering result");
    }
  }

  /// Wait for outstanding write-through tasks to finish.
  pub async fn flush_writes(&self) {
    let handles: Vec<JoinHandle<()>> = self
      .pending_writes
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .drain(..)
      .collect();
    for handle in handles {
      if let Err(e) = handle.await {
        error!(error = %e, "write-through task panicked");
      }
    }
  }

  /// Persist fetched records on the blocking pool without making the reader wait.
  fn write_through(&self, records: Vec<AttendanceRecord>) {
    if records.is_empty() {
      return;
    }

    let store = Arc::clone(&self.store);
    let handle = tokio::task::spawn_blocking(move || {
      if let Err(e) = store.upsert(&records) {
        error!(count = records.len(), error = %e, "write-through to local store failed");
      }
    });

    let mut pending = self
      .pending_writes
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    pending.retain(|h| !h.is_finished());
    pending.push(handle);
  }
}

impl<R: RemoteSource, S: LocalStore> Clone for AttendanceCache<R, S> {
  fn clone(&self) -> Self {
    Self {
      remote: Arc::clone(&self.remote),
      store: Arc::clone(&self.store),
      memory: Arc::clone(&self.memory),
      remote_timeout: self.remote_timeout,
      pending_writes: Arc::clone(&self.pending_writes),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStore;
  use crate::cache::CacheSource;
  use crate::config::Config;
  use crate::testing::{sample_record, week_of_jan_2025, FailingStore, FakeRemote};

  fn service(remote: FakeRemote, ttl: Duration) -> AttendanceCache<FakeRemote, SqliteStore> {
    AttendanceCache::new(remote, SqliteStore::open_in_memory().unwrap(), ttl)
      .with_remote_timeout(Duration::from_millis(200))
  }

  fn seeded_remote(count: i64) -> FakeRemote {
    let remote = FakeRemote::new();
    remote.seed((1..=count).map(|id| sample_record(id, 1 + (id % 7) as u32)));
    remote
  }

  #[tokio::test]
  async fn test_repeat_read_within_ttl_skips_remote() {
    let cache = service(seeded_remote(42), Duration::from_secs(300));

    let first = cache.get_by_range(week_of_jan_2025()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = cache.get_by_range(week_of_jan_2025()).await.unwrap();

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::Memory);
    assert_eq!(first.data.len(), 42);
    assert_eq!(first.data, second.data);
    assert_eq!(cache.remote.fetch_calls(), 1);
  }

  #[tokio::test]
  async fn test_read_after_ttl_hits_remote_again() {
    let cache = service(seeded_remote(3), Duration::from_millis(30));

    cache.get_by_range(week_of_jan_2025()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let again = cache.get_by_range(week_of_jan_2025()).await.unwrap();

    assert_eq!(again.source, CacheSource::Network);
    assert_eq!(cache.remote.fetch_calls(), 2);
  }

  #[tokio::test]
  async fn test_offline_read_serves_local_store() {
    let cache = service(seeded_remote(42), Duration::from_millis(30));

    cache.get_by_range(week_of_jan_2025()).await.unwrap();
    cache.flush_writes().await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    cache.remote.set_online(false);
    let fallback = cache.get_by_range(week_of_jan_2025()).await.unwrap();

    assert!(fallback.is_fallback());
    assert_eq!(fallback.data.len(), 42);
  }

  #[tokio::test]
  async fn test_offline_fallback_is_remembered() {
    let cache = service(seeded_remote(5), Duration::from_secs(300));
    cache.get_by_range(week_of_jan_2025()).await.unwrap();
    cache.flush_writes().await;
    cache.invalidate(&week_of_jan_2025());

    cache.remote.set_online(false);
    cache.get_by_range(week_of_jan_2025()).await.unwrap();
    let again = cache.get_by_range(week_of_jan_2025()).await.unwrap();

    assert_eq!(again.source, CacheSource::Offline);
    assert_eq!(cache.remote.fetch_calls(), 2);
  }

  #[tokio::test]
  async fn test_offline_and_empty_is_no_cached_data() {
    let remote = FakeRemote::new();
    remote.set_online(false);
    let cache = service(remote, Duration::from_secs(300));

    let err = cache.get_by_range(week_of_jan_2025()).await.unwrap_err();
    assert!(matches!(err, Error::NoCachedData { .. }));
  }

  #[tokio::test]
  async fn test_slow_remote_times_out_into_fallback() {
    let remote = seeded_remote(2);
    let cache = service(remote, Duration::from_millis(10));
    cache.get_by_range(week_of_jan_2025()).await.unwrap();
    cache.flush_writes().await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    cache.remote.set_delay(Duration::from_secs(5));
    let result = cache.get_by_range(week_of_jan_2025()).await.unwrap();
    assert!(result.is_fallback());
  }

  #[tokio::test]
  async fn test_online_create_is_synced_and_invalidates() {
    let cache = service(seeded_remote(1), Duration::from_secs(300));
    cache.get_by_range(week_of_jan_2025()).await.unwrap();

    let created = cache.create(sample_record(0, 3)).await.unwrap();
    assert_eq!(created.sync_state, SyncState::Synced);
    assert!(created.id > 0);

    let after = cache.get_by_range(week_of_jan_2025()).await.unwrap();
    assert_eq!(after.source, CacheSource::Network);
    assert_eq!(after.data.len(), 2);
  }

  #[tokio::test]
  async fn test_offline_create_is_pending_and_visible() {
    let remote = FakeRemote::new();
    remote.set_online(false);
    let cache = service(remote, Duration::from_secs(300));

    let created = cache.create(sample_record(0, 3)).await.unwrap();
    assert_eq!(created.sync_state, SyncState::Pending);
    assert!(created.id < 0);

    let read = cache.get_by_range(week_of_jan_2025()).await.unwrap();
    assert!(read.is_fallback());
    assert_eq!(read.data.len(), 1);
    assert_eq!(read.data[0].id, created.id);
    assert_eq!(read.data[0].sync_state, SyncState::Pending);
  }

  #[tokio::test]
  async fn test_clear_all_forces_remote_call() {
    let cache = service(seeded_remote(4), Duration::from_secs(300));
    cache.get_by_range(week_of_jan_2025()).await.unwrap();

    cache.clear_all().await.unwrap();
    assert_eq!(cache.stats().unwrap().store.count, 0);

    let read = cache.get_by_range(week_of_jan_2025()).await.unwrap();
    assert_eq!(read.source, CacheSource::Network);
    assert_eq!(cache.remote.fetch_calls(), 2);
  }

  #[tokio::test]
  async fn test_stats_reports_both_layers() {
    let cache = service(seeded_remote(6), Duration::from_secs(300));
    cache.get_by_range(week_of_jan_2025()).await.unwrap();
    cache.flush_writes().await;

    let stats = cache.stats().unwrap();
    assert_eq!(stats.memory_entries, 1);
    assert_eq!(stats.store.count, 6);
    assert!(stats.to_string().contains("memory: 1 entries"));
  }

  #[tokio::test]
  async fn test_fetch_overtaken_by_create_is_not_remembered() {
    let cache = service(seeded_remote(1), Duration::from_secs(300));
    cache.remote.set_delay(Duration::from_millis(100));

    let in_flight = {
      let cache = cache.clone();
      tokio::spawn(async move { cache.get_by_range(week_of_jan_2025()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    cache.remote.set_delay(Duration::ZERO);
    let created = cache.create(sample_record(0, 3)).await.unwrap();
    assert_eq!(created.sync_state, SyncState::Synced);

    // The slow read still answers its caller with what it saw.
    let stale = in_flight.await.unwrap().unwrap();
    assert_eq!(stale.data.len(), 1);

    let after = cache.get_by_range(week_of_jan_2025()).await.unwrap();
    assert_eq!(after.source, CacheSource::Network);
    assert!(after.data.iter().any(|r| r.id == created.id));
  }

  #[tokio::test]
  async fn test_store_failure_is_not_reported_as_empty() {
    let remote = FakeRemote::new();
    remote.set_online(false);
    let cache = AttendanceCache::new(remote, FailingStore, Duration::from_secs(300));

    let read = cache.get_by_range(week_of_jan_2025()).await.unwrap_err();
    assert!(matches!(read, Error::StoreUnavailable(_)));

    let write = cache.create(sample_record(0, 3)).await.unwrap_err();
    assert!(matches!(write, Error::StoreUnavailable(_)));
  }

  #[tokio::test]
  async fn test_create_without_server_id_is_queued() {
    let remote = FakeRemote::new();
    remote.stop_assigning_ids();
    let cache = service(remote, Duration::from_secs(300));

    let created = cache.create(sample_record(0, 3)).await.unwrap();
    assert_eq!(created.sync_state, SyncState::Pending);
    assert!(created.id < 0);
    assert_eq!(cache.list_pending().unwrap().len(), 1);
  }

  #[test]
  fn test_default_timeout_matches_config_default() {
    let config: Config =
      serde_yaml::from_str("remote:\n  url: https://school.example.org/api/\n").unwrap();
    let cache = AttendanceCache::new(
      FakeRemote::new(),
      SqliteStore::open_in_memory().unwrap(),
      Duration::from_secs(300),
    );
    assert_eq!(cache.remote_timeout, config.remote.timeout());
  }
}
