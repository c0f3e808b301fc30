//! Serde types matching the attendance API payloads.
//!
//! These types are separate from domain types so the wire format can evolve
//! without touching the cache or the store.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use super::types::{AttendanceRecord, AttendanceStatus, CheckMethod, PersonKind, SyncState};

// ============================================================================
// Attendance record as returned by list and create
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAttendance {
  pub id: i64,
  pub user_id: i64,
  #[serde(default)]
  pub username: String,
  pub kind: PersonKind,
  pub date: NaiveDate,
  pub check_in_time: Option<NaiveTime>,
  pub check_out_time: Option<NaiveTime>,
  pub status: AttendanceStatus,
  pub method: CheckMethod,
  #[serde(default)]
  pub note: Option<String>,
}

impl ApiAttendance {
  /// Anything the server hands back is authoritative.
  pub fn into_record(self) -> AttendanceRecord {
    AttendanceRecord {
      id: self.id,
      user_id: self.user_id,
      username: self.username,
      kind: self.kind,
      date: self.date,
      check_in_time: self.check_in_time,
      check_out_time: self.check_out_time,
      status: self.status,
      method: self.method,
      note: self.note.unwrap_or_default(),
      sync_state: SyncState::Synced,
    }
  }
}

// ============================================================================
// Create request body
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCreateAttendance<'a> {
  pub user_id: i64,
  pub username: &'a str,
  pub kind: PersonKind,
  pub date: NaiveDate,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub check_in_time: Option<NaiveTime>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub check_out_time: Option<NaiveTime>,
  pub status: AttendanceStatus,
  pub method: CheckMethod,
  pub note: &'a str,
}

impl<'a> From<&'a AttendanceRecord> for ApiCreateAttendance<'a> {
  fn from(record: &'a AttendanceRecord) -> Self {
    Self {
      user_id: record.user_id,
      username: &record.username,
      kind: record.kind,
      date: record.date,
      check_in_time: record.check_in_time,
      check_out_time: record.check_out_time,
      status: record.status,
      method: record.method,
      note: &record.note,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_list_payload() {
    let json = r#"[
      {"id": 17, "userId": 4, "username": "nguyen.an", "kind": "student",
       "date": "2025-01-03", "checkInTime": "07:29:10", "checkOutTime": null,
       "status": "present", "method": "rfid", "note": null},
      {"id": 18, "userId": 9, "kind": "teacher", "date": "2025-01-03",
       "status": "left_early", "method": "face"}
    ]"#;

    let parsed: Vec<ApiAttendance> = serde_json::from_str(json).unwrap();
    let records: Vec<AttendanceRecord> = parsed.into_iter().map(ApiAttendance::into_record).collect();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].username, "nguyen.an");
    assert_eq!(
      records[0].check_in_time,
      NaiveTime::from_hms_opt(7, 29, 10)
    );
    assert_eq!(records[1].status, AttendanceStatus::LeftEarly);
    assert_eq!(records[1].note, "");
    assert!(records.iter().all(|r| r.sync_state == SyncState::Synced));
  }

  #[test]
  fn test_create_body_omits_id_and_sync_state() {
    let record = AttendanceRecord {
      id: -3,
      user_id: 4,
      username: "nguyen.an".to_string(),
      kind: PersonKind::Student,
      date: NaiveDate::from_ymd_opt(2025, 1, 3).unwrap(),
      check_in_time: None,
      check_out_time: None,
      status: AttendanceStatus::Absent,
      method: CheckMethod::Manual,
      note: "sick".to_string(),
      sync_state: SyncState::Pending,
    };

    let body = serde_json::to_value(ApiCreateAttendance::from(&record)).unwrap();
    assert_eq!(body["userId"], 4);
    assert_eq!(body["status"], "absent");
    assert!(body.get("id").is_none());
    assert!(body.get("syncState").is_none());
    assert!(body.get("checkInTime").is_none());
  }
}
