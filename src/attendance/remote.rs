//! Contract for the remote attendance service.

use chrono::NaiveDate;
use futures::future::BoxFuture;

use crate::error::RemoteError;

use super::types::AttendanceRecord;

/// Request/response access to the authoritative attendance service.
///
/// Calls may be slow, fail, or never return; callers bound them with a timeout.
pub trait RemoteSource: Send + Sync + 'static {
  /// List records whose date falls in `start..=end`.
  fn fetch(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> BoxFuture<'_, Result<Vec<AttendanceRecord>, RemoteError>>;

  /// Create a record and return it with the server-assigned id.
  fn create<'a>(
    &'a self,
    record: &'a AttendanceRecord,
  ) -> BoxFuture<'a, Result<AttendanceRecord, RemoteError>>;
}
