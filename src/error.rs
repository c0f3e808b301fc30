//! Error taxonomy for the attendance cache.
//!
//! `RemoteError` and `StoreError` describe failures of the two collaborators.
//! `Error` is what the read/write entry points hand back to callers.

use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheKey;

/// Maximum length for response bodies embedded in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Error, Debug)]
pub enum RemoteError {
  #[error("Network error: {0}")]
  Network(#[from] reqwest::Error),

  #[error("Request timed out after {0:?}")]
  Timeout(Duration),

  #[error("Server error {status}: {body}")]
  Server { status: u16, body: String },

  #[error("Request rejected with {status}: {body}")]
  Rejected { status: u16, body: String },

  #[error("Invalid response: {0}")]
  InvalidResponse(String),
}

impl RemoteError {
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      return body.to_string();
    }
    let mut cut = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(cut) {
      cut -= 1;
    }
    format!(
      "{}... (truncated, {} total bytes)",
      &body[..cut],
      body.len()
    )
  }

  pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
    let body = Self::truncate_body(body);
    let status = status.as_u16();
    match status {
      500..=599 => RemoteError::Server { status, body },
      400..=499 => RemoteError::Rejected { status, body },
      _ => RemoteError::InvalidResponse(format!("Status {}: {}", status, body)),
    }
  }
}

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Store lock poisoned")]
  LockPoisoned,

  #[error("Record {0} has no server-assigned id")]
  SurrogateId(i64),

  #[error("Record {0} is not pending")]
  NotPending(i64),
}

#[derive(Error, Debug)]
pub enum Error {
  #[error("Remote source unavailable: {0}")]
  RemoteUnavailable(#[from] RemoteError),

  #[error("Local store unavailable: {0}")]
  StoreUnavailable(#[from] StoreError),

  #[error("No cached data for {key}")]
  NoCachedData { key: CacheKey },

  #[error("Failed to push record {local_id}: {source}")]
  SyncPushFailed {
    local_id: i64,
    #[source]
    source: RemoteError,
  },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::StatusCode;

  #[test]
  fn test_from_status_classifies() {
    assert!(matches!(
      RemoteError::from_status(StatusCode::BAD_GATEWAY, "down"),
      RemoteError::Server { status: 502, .. }
    ));
    assert!(matches!(
      RemoteError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "bad date"),
      RemoteError::Rejected { status: 422, .. }
    ));
    assert!(matches!(
      RemoteError::from_status(StatusCode::MOVED_PERMANENTLY, ""),
      RemoteError::InvalidResponse(_)
    ));
  }

  #[test]
  fn test_long_bodies_are_truncated() {
    let body = "x".repeat(2000);
    let err = RemoteError::from_status(StatusCode::INTERNAL_SERVER_ERROR, &body);
    let msg = err.to_string();
    assert!(msg.contains("truncated, 2000 total bytes"));
    assert!(msg.len() < 700);
  }
}
