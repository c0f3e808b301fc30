//! Durable local store and its SQLite implementation.
//!
//! The store doubles as the offline write queue: records created while the
//! remote service is unreachable are kept here as `pending` under a negative
//! surrogate id until a sync pass replaces it with the server id.

use chrono::{NaiveDate, NaiveTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::attendance::{AttendanceRecord, DateRange, SyncState};
use crate::error::StoreError;

/// Diagnostic snapshot of the local store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
  pub count: usize,
  pub pending: usize,
  pub oldest_date: Option<NaiveDate>,
  pub newest_date: Option<NaiveDate>,
  pub size_bytes: u64,
}

impl fmt::Display for StoreStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} records ({} pending), {} KiB",
      self.count,
      self.pending,
      self.size_bytes / 1024
    )?;
    if let (Some(oldest), Some(newest)) = (self.oldest_date, self.newest_date) {
      write!(f, ", dates {}..{}", oldest, newest)?;
    }
    Ok(())
  }
}

/// Trait for local store backends.
///
/// All calls block on disk I/O. Any underlying failure surfaces as a
/// `StoreError`; an empty result is never used to signal failure.
pub trait LocalStore: Send + Sync + 'static {
  /// Insert or replace server-acknowledged records by id, as one batch.
  fn upsert(&self, records: &[AttendanceRecord]) -> Result<(), StoreError>;

  /// Records dated within the range, newest date then latest check-in first.
  fn query_by_date_range(&self, range: &DateRange) -> Result<Vec<AttendanceRecord>, StoreError>;

  /// Queue a record created offline and return its surrogate id.
  fn save_offline(&self, record: &AttendanceRecord) -> Result<i64, StoreError>;

  /// All queued records, oldest first.
  fn list_pending(&self) -> Result<Vec<AttendanceRecord>, StoreError>;

  /// Flip a queued record to synced and swap its surrogate id for `server_id`.
  fn mark_synced(&self, local_id: i64, server_id: i64) -> Result<(), StoreError>;

  /// Remove every record, queued ones included.
  fn clear(&self) -> Result<(), StoreError>;

  fn stats(&self) -> Result<StoreStats, StoreError>;

  /// Take or renew the store-wide sync lease for `holder`.
  ///
  /// Returns `false` while another holder's lease is unexpired. The lease
  /// lives in the store, so it also keeps separate processes sharing one
  /// database from pushing the same queue at the same time.
  fn try_acquire_sync_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError>;

  /// Give the lease up if `holder` still owns it.
  fn release_sync_lease(&self, holder: &str) -> Result<(), StoreError>;
}

/// SQLite-based local store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
      row.get::<_, String>(0)
    })?;

    Self::with_connection(conn)
  }

  /// Open a throwaway store that lives only as long as the process.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    conn.execute_batch(STORE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }
}

/// Schema for the attendance store.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS attendance (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    username TEXT NOT NULL,
    kind TEXT NOT NULL,
    date TEXT NOT NULL,
    check_in_time TEXT,
    check_out_time TEXT,
    status TEXT NOT NULL,
    method TEXT NOT NULL,
    note TEXT NOT NULL DEFAULT '',
    sync_state TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
CREATE INDEX IF NOT EXISTS idx_attendance_sync_state ON attendance(sync_state);

-- Surrogate id sequence; only ever decreases so ids are never reused
CREATE TABLE IF NOT EXISTS local_ids (
    name TEXT PRIMARY KEY,
    last_value INTEGER NOT NULL
);

INSERT OR IGNORE INTO local_ids (name, last_value) VALUES ('attendance', 0);

-- At most one sync pass per database; expires_at is unix millis
CREATE TABLE IF NOT EXISTS sync_lease (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

const RECORD_COLUMNS: &str = "id, user_id, username, kind, date, check_in_time, check_out_time, \
   status, method, note, sync_state";

const INSERT_RECORD: &str = "INSERT OR REPLACE INTO attendance
   (id, user_id, username, kind, date, check_in_time, check_out_time, status, method, note, sync_state, cached_at)
   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'))";

impl LocalStore for SqliteStore {
  fn upsert(&self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    {
      let mut stmt = tx.prepare_cached(INSERT_RECORD)?;
      for record in records {
        // Dropping `tx` on any early return rolls back the rows already written.
        if record.id <= 0 {
          return Err(StoreError::SurrogateId(record.id));
        }
        // Anything carrying a server id is authoritative.
        insert_record(&mut stmt, record, record.id, SyncState::Synced)?;
      }
    }
    tx.commit()?;

    Ok(())
  }

  fn query_by_date_range(&self, range: &DateRange) -> Result<Vec<AttendanceRecord>, StoreError> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM attendance
       WHERE date BETWEEN ?1 AND ?2
       ORDER BY date DESC, check_in_time DESC, id DESC",
      RECORD_COLUMNS
    );

    let mut stmt = conn.prepare_cached(&sql)?;
    let records = stmt
      .query_map(
        params![range.start.to_string(), range.end.to_string()],
        record_from_row,
      )?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
  }

  fn save_offline(&self, record: &AttendanceRecord) -> Result<i64, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let local_id: i64 = tx.query_row(
      "UPDATE local_ids SET last_value = last_value - 1
       WHERE name = 'attendance'
       RETURNING last_value",
      [],
      |row| row.get(0),
    )?;

    {
      let mut stmt = tx.prepare_cached(INSERT_RECORD)?;
      insert_record(&mut stmt, record, local_id, SyncState::Pending)?;
    }
    tx.commit()?;

    Ok(local_id)
  }

  fn list_pending(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
    let conn = self.lock()?;
    // Surrogate ids count down, so creation order is descending id.
    let sql = format!(
      "SELECT {} FROM attendance WHERE sync_state = ?1 ORDER BY id DESC",
      RECORD_COLUMNS
    );

    let mut stmt = conn.prepare_cached(&sql)?;
    let records = stmt
      .query_map(params![SyncState::Pending.as_str()], record_from_row)?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
  }

  fn mark_synced(&self, local_id: i64, server_id: i64) -> Result<(), StoreError> {
    if server_id <= 0 {
      return Err(StoreError::SurrogateId(server_id));
    }

    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let state: Option<String> = tx
      .query_row(
        "SELECT sync_state FROM attendance WHERE id = ?1",
        params![local_id],
        |row| row.get(0),
      )
      .optional()?;

    if state.as_deref() != Some(SyncState::Pending.as_str()) {
      return Err(StoreError::NotPending(local_id));
    }

    // A read may already have cached the server copy.
    tx.execute("DELETE FROM attendance WHERE id = ?1", params![server_id])?;
    tx.execute(
      "UPDATE attendance SET id = ?1, sync_state = ?2, cached_at = datetime('now')
       WHERE id = ?3",
      params![server_id, SyncState::Synced.as_str(), local_id],
    )?;
    tx.commit()?;

    Ok(())
  }

  fn clear(&self) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM attendance", [])?;
    Ok(())
  }

  fn stats(&self) -> Result<StoreStats, StoreError> {
    let conn = self.lock()?;

    let (count, pending, oldest, newest): (i64, Option<i64>, Option<String>, Option<String>) =
      conn.query_row(
        "SELECT COUNT(*), SUM(sync_state = ?1), MIN(date), MAX(date) FROM attendance",
        params![SyncState::Pending.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )?;

    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

    Ok(StoreStats {
      count: count as usize,
      pending: pending.unwrap_or(0) as usize,
      oldest_date: oldest.and_then(|d| d.parse().ok()),
      newest_date: newest.and_then(|d| d.parse().ok()),
      size_bytes: (page_count * page_size).max(0) as u64,
    })
  }

  fn try_acquire_sync_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
    let conn = self.lock()?;
    let now = Utc::now().timestamp_millis();
    let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

    let changed = conn.execute(
      "INSERT INTO sync_lease (name, holder, expires_at) VALUES (?1, ?2, ?3)
       ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
       WHERE sync_lease.holder = excluded.holder OR sync_lease.expires_at < ?4",
      params![SYNC_LEASE, holder, expires_at, now],
    )?;

    Ok(changed == 1)
  }

  fn release_sync_lease(&self, holder: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM sync_lease WHERE name = ?1 AND holder = ?2",
      params![SYNC_LEASE, holder],
    )?;
    Ok(())
  }
}

const SYNC_LEASE: &str = "sync";

fn insert_record(
  stmt: &mut rusqlite::CachedStatement<'_>,
  record: &AttendanceRecord,
  id: i64,
  sync_state: SyncState,
) -> rusqlite::Result<usize> {
  stmt.execute(params![
    id,
    record.user_id,
    record.username,
    record.kind.as_str(),
    record.date.to_string(),
    record.check_in_time.map(|t| t.to_string()),
    record.check_out_time.map(|t| t.to_string()),
    record.status.as_str(),
    record.method.as_str(),
    record.note,
    sync_state.as_str(),
  ])
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
  Ok(AttendanceRecord {
    id: row.get(0)?,
    user_id: row.get(1)?,
    username: row.get(2)?,
    kind: parse_column(row, 3)?,
    date: parse_column(row, 4)?,
    check_in_time: parse_optional_time(row, 5)?,
    check_out_time: parse_optional_time(row, 6)?,
    status: parse_column(row, 7)?,
    method: parse_column(row, 8)?,
    note: row.get(9)?,
    sync_state: parse_column(row, 10)?,
  })
}

/// Parse a TEXT column through `FromStr`.
fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  let text: String = row.get(idx)?;
  text
    .parse()
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveTime>> {
  let text: Option<String> = row.get(idx)?;
  text
    .map(|t| {
      t.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}
