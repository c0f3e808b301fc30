use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Who the attendance record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonKind {
  Student,
  Teacher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
  Present,
  Late,
  Absent,
  Excused,
  LeftEarly,
}

/// How the check-in was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMethod {
  Manual,
  Rfid,
  Barcode,
  Face,
}

/// Whether the remote service has acknowledged a record.
///
/// A `Synced` record always carries a server-assigned (positive) id. A `Pending`
/// record carries a negative surrogate id until the sync pass replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
  Synced,
  Pending,
}

/// A single attendance entry for one person on one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
  pub id: i64,
  pub user_id: i64,
  pub username: String,
  pub kind: PersonKind,
  pub date: NaiveDate,
  pub check_in_time: Option<NaiveTime>,
  pub check_out_time: Option<NaiveTime>,
  pub status: AttendanceStatus,
  pub method: CheckMethod,
  pub note: String,
  pub sync_state: SyncState,
}

impl AttendanceRecord {
  pub fn is_pending(&self) -> bool {
    self.sync_state == SyncState::Pending
  }
}

/// Inclusive date range used as the read query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

impl DateRange {
  /// Build a range, swapping the bounds if they were given backwards.
  pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
    if start <= end {
      Self { start, end }
    } else {
      Self {
        start: end,
        end: start,
      }
    }
  }
}

impl fmt::Display for DateRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}..{}", self.start, self.end)
  }
}

// ============================================================================
// Text forms (used by the SQLite columns and the CLI)
// ============================================================================

/// Error returned when a text value does not name a known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
  pub kind: &'static str,
  pub value: String,
}

macro_rules! text_enum {
  ($ty:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
    impl $ty {
      pub fn as_str(&self) -> &'static str {
        match self {
          $(Self::$variant => $text,)+
        }
      }
    }

    impl fmt::Display for $ty {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
      }
    }

    impl FromStr for $ty {
      type Err = UnknownVariant;

      fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
          $($text => Ok(Self::$variant),)+
          _ => Err(UnknownVariant {
            kind: $label,
            value: s.to_string(),
          }),
        }
      }
    }
  };
}

text_enum!(PersonKind, "person kind", {
  Student => "student",
  Teacher => "teacher",
});

text_enum!(AttendanceStatus, "status", {
  Present => "present",
  Late => "late",
  Absent => "absent",
  Excused => "excused",
  LeftEarly => "left_early",
});

text_enum!(CheckMethod, "check method", {
  Manual => "manual",
  Rfid => "rfid",
  Barcode => "barcode",
  Face => "face",
});

text_enum!(SyncState, "sync state", {
  Synced => "synced",
  Pending => "pending",
});
