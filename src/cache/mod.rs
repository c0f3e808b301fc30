//! Offline-capable caching for attendance data.
//!
//! This module provides:
//! - A short-lived in-memory cache of query results keyed by date range
//! - A durable SQLite store used as a read fallback and as an offline write queue
//! - The `AttendanceCache` service that combines both in front of the remote source

mod layer;
mod memory;
mod storage;
mod traits;

pub use layer::{AttendanceCache, CacheStats};
pub use memory::{CacheEntry, MemoryCache};
pub use storage::{LocalStore, SqliteStore, StoreStats};
pub use traits::{CacheKey, CacheResult, CacheSource};
