//! Scriptable in-memory remote source for tests.

use chrono::{NaiveDate, NaiveTime};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::attendance::{
  AttendanceRecord, AttendanceStatus, CheckMethod, DateRange, PersonKind, RemoteSource, SyncState,
};
use crate::cache::{LocalStore, StoreStats};
use crate::error::{RemoteError, StoreError};

pub fn week_of_jan_2025() -> DateRange {
  DateRange::new(
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
    NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
  )
}

pub fn sample_record(id: i64, day: u32) -> AttendanceRecord {
  AttendanceRecord {
    id,
    user_id: 1000 + id,
    username: format!("student{}", id),
    kind: PersonKind::Student,
    date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
    check_in_time: NaiveTime::from_hms_opt(7, (id % 60) as u32, 0),
    check_out_time: None,
    status: AttendanceStatus::Present,
    method: CheckMethod::Barcode,
    note: String::new(),
    sync_state: SyncState::Synced,
  }
}

/// Remote source that can be switched offline, slowed down, or made to
/// reject individual users.
pub struct FakeRemote {
  records: Mutex<Vec<AttendanceRecord>>,
  online: AtomicBool,
  delay_ms: AtomicUsize,
  rejected_users: Mutex<HashSet<i64>>,
  assigns_ids: AtomicBool,
  next_id: AtomicI64,
  fetch_calls: AtomicUsize,
  create_calls: AtomicUsize,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self {
      records: Mutex::new(Vec::new()),
      online: AtomicBool::new(true),
      delay_ms: AtomicUsize::new(0),
      rejected_users: Mutex::new(HashSet::new()),
      assigns_ids: AtomicBool::new(true),
      next_id: AtomicI64::new(10_000),
      fetch_calls: AtomicUsize::new(0),
      create_calls: AtomicUsize::new(0),
    }
  }

  pub fn seed(&self, records: impl IntoIterator<Item = AttendanceRecord>) {
    self.records.lock().unwrap().extend(records);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
  }

  pub fn reject_user(&self, user_id: i64) {
    self.rejected_users.lock().unwrap().insert(user_id);
  }

  /// Answer creates with an id of 0 instead of a server id.
  pub fn stop_assigning_ids(&self) {
    self.assigns_ids.store(false, Ordering::SeqCst);
  }

  pub fn fetch_calls(&self) -> usize {
    self.fetch_calls.load(Ordering::SeqCst)
  }

  pub fn create_calls(&self) -> usize {
    self.create_calls.load(Ordering::SeqCst)
  }

  async fn respond(&self) -> Result<(), RemoteError> {
    let delay = self.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
      tokio::time::sleep(Duration::from_millis(delay as u64)).await;
    }
    if self.online.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(RemoteError::Server {
        status: 503,
        body: "offline".to_string(),
      })
    }
  }
}

impl RemoteSource for FakeRemote {
  fn fetch(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> BoxFuture<'_, Result<Vec<AttendanceRecord>, RemoteError>> {
    self.fetch_calls.fetch_add(1, Ordering::SeqCst);
    // The answer reflects the data as it was when the request went out.
    let range = DateRange::new(start, end);
    let snapshot: Vec<AttendanceRecord> = self
      .records
      .lock()
      .unwrap()
      .iter()
      .filter(|r| range.start <= r.date && r.date <= range.end)
      .cloned()
      .collect();

    async move {
      self.respond().await?;
      Ok(snapshot)
    }
    .boxed()
  }

  fn create<'a>(
    &'a self,
    record: &'a AttendanceRecord,
  ) -> BoxFuture<'a, Result<AttendanceRecord, RemoteError>> {
    self.create_calls.fetch_add(1, Ordering::SeqCst);
    async move {
      self.respond().await?;
      if self.rejected_users.lock().unwrap().contains(&record.user_id) {
        return Err(RemoteError::Rejected {
          status: 422,
          body: "validation failed".to_string(),
        });
      }

      if !self.assigns_ids.load(Ordering::SeqCst) {
        return Ok(AttendanceRecord {
          id: 0,
          ..record.clone()
        });
      }

      let created = AttendanceRecord {
        id: self.next_id.fetch_add(1, Ordering::SeqCst),
        sync_state: SyncState::Synced,
        ..record.clone()
      };
      self.records.lock().unwrap().push(created.clone());
      Ok(created)
    }
    .boxed()
  }
}

/// Local store whose disk is gone: every call fails.
pub struct FailingStore;

fn disk_gone() -> StoreError {
  StoreError::Io(std::io::Error::new(
    std::io::ErrorKind::Other,
    "disk unavailable",
  ))
}

impl LocalStore for FailingStore {
  fn upsert(&self, _records: &[AttendanceRecord]) -> Result<(), StoreError> {
    Err(disk_gone())
  }

  fn query_by_date_range(&self, _range: &DateRange) -> Result<Vec<AttendanceRecord>, StoreError> {
    Err(disk_gone())
  }

  fn save_offline(&self, _record: &AttendanceRecord) -> Result<i64, StoreError> {
    Err(disk_gone())
  }

  fn list_pending(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
    Err(disk_gone())
  }

  fn mark_synced(&self, _local_id: i64, _server_id: i64) -> Result<(), StoreError> {
    Err(disk_gone())
  }

  fn clear(&self) -> Result<(), StoreError> {
    Err(disk_gone())
  }

  fn stats(&self) -> Result<StoreStats, StoreError> {
    Err(disk_gone())
  }

  fn try_acquire_sync_lease(&self, _holder: &str, _ttl: Duration) -> Result<bool, StoreError> {
    Err(disk_gone())
  }

  fn release_sync_lease(&self, _holder: &str) -> Result<(), StoreError> {
    Err(disk_gone())
  }
}
