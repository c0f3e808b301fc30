//! Attendance domain types and the remote service they come from.

pub mod api_types;
pub mod client;
pub mod remote;
pub mod types;

pub use client::HttpRemoteSource;
pub use remote::RemoteSource;
pub use types::{
  AttendanceRecord, AttendanceStatus, CheckMethod, DateRange, PersonKind, SyncState,
};
