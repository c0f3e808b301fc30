//! Background reconciliation of the offline write queue.
//!
//! A pass reads every pending record from the local store, pushes each one to
//! the remote source independently, and marks successes as synced. Only one
//! pass runs at a time; a trigger that arrives mid-pass is skipped, and the
//! next scheduled tick picks up whatever is left.
//!
//! "One at a time" holds across processes too: besides the in-process flag,
//! a pass holds a lease row in the local store, so `attcache sync` run next to
//! a `watch` session skips instead of pushing the same records twice.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::attendance::{AttendanceRecord, RemoteSource};
use crate::cache::{AttendanceCache, LocalStore};
use crate::error::Error;

/// Summary of a completed pass, sent to observers.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
  pub attempted: usize,
  /// Records now synced, carrying their server ids
  pub synced: Vec<AttendanceRecord>,
  pub failed: usize,
}

/// What happened when a pass was requested.
#[derive(Debug, Clone)]
pub enum PassOutcome {
  /// Another pass was already running
  Skipped,
  Completed(SyncReport),
}

/// How long a pass may go without renewing its lease before another
/// process is allowed to take over the queue.
const LEASE_TTL: Duration = Duration::from_secs(120);

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(0);

/// Resets the running flag however the pass ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Releases the store lease however the pass ends.
struct LeaseGuard<'a, S: LocalStore> {
  store: &'a S,
  holder: &'a str,
}

impl<S: LocalStore> Drop for LeaseGuard<'_, S> {
  fn drop(&mut self) {
    if let Err(e) = self.store.release_sync_lease(self.holder) {
      warn!(error = %e, "failed to release sync lease");
    }
  }
}

/// Drains the offline queue against the remote source.
pub struct SyncCoordinator<R: RemoteSource, S: LocalStore> {
  cache: AttendanceCache<R, S>,
  running: Arc<AtomicBool>,
  /// Lease owner name, unique per coordinator and process
  holder: Arc<str>,
  observer: Option<mpsc::UnboundedSender<SyncReport>>,
}

impl<R: RemoteSource, S: LocalStore> SyncCoordinator<R, S> {
  pub fn new(cache: AttendanceCache<R, S>) -> Self {
    Self {
      cache,
      running: Arc::new(AtomicBool::new(false)),
      holder: format!(
        "{}:{}",
        std::process::id(),
        NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
      )
      .into(),
      observer: None,
    }
  }

  /// Send a report to `observer` after every pass that synced something.
  pub fn with_observer(mut self, observer: mpsc::UnboundedSender<SyncReport>) -> Self {
    self.observer = Some(observer);
    self
  }

  /// Run one reconciliation pass unless one is already in progress.
  pub async fn run_pass(&self) -> PassOutcome {
    if self
      .running
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("sync pass already running, skipping");
      return PassOutcome::Skipped;
    }
    let _guard = RunningGuard(&self.running);

    let store = self.cache.store();
    match store.try_acquire_sync_lease(&self.holder, LEASE_TTL) {
      Ok(true) => {}
      Ok(false) => {
        debug!("another process holds the sync lease, skipping");
        return PassOutcome::Skipped;
      }
      Err(e) => {
        error!(error = %e, "cannot take sync lease");
        return PassOutcome::Completed(SyncReport::default());
      }
    }
    let _lease = LeaseGuard {
      store,
      holder: &self.holder,
    };

    let pending = match store.list_pending() {
      Ok(pending) => pending,
      Err(e) => {
        error!(error = %e, "cannot read offline queue");
        return PassOutcome::Completed(SyncReport::default());
      }
    };

    if pending.is_empty() {
      return PassOutcome::Completed(SyncReport::default());
    }

    let mut report = SyncReport {
      attempted: pending.len(),
      ..SyncReport::default()
    };

    for record in pending {
      match store.try_acquire_sync_lease(&self.holder, LEASE_TTL) {
        Ok(true) => {}
        Ok(false) => {
          warn!("sync lease lost mid-pass, leaving the rest for the next pass");
          break;
        }
        Err(e) => warn!(error = %e, "cannot renew sync lease"),
      }

      let local_id = record.id;
      match self.push(&record).await {
        Ok(synced) => report.synced.push(synced),
        Err(e) => {
          warn!(local_id, error = %e, "record left pending");
          report.failed += 1;
        }
      }
    }

    if !report.synced.is_empty() {
      self.cache.invalidate_memory();
      if let Some(observer) = &self.observer {
        let _ = observer.send(report.clone());
      }
    }

    info!(
      attempted = report.attempted,
      synced = report.synced.len(),
      failed = report.failed,
      "sync pass finished"
    );

    PassOutcome::Completed(report)
  }

  async fn push(&self, record: &AttendanceRecord) -> Result<AttendanceRecord, Error> {
    let local_id = record.id;
    let created = self
      .cache
      .remote_create(record)
      .await
      .map_err(|source| Error::SyncPushFailed { local_id, source })?;

    self.cache.store().mark_synced(local_id, created.id)?;
    debug!(local_id, server_id = created.id, "record synced");

    Ok(AttendanceRecord {
      id: created.id,
      sync_state: created.sync_state,
      ..record.clone()
    })
  }

  /// Start the recurring task. The first pass runs immediately.
  pub fn spawn(self, interval: Duration) -> SyncHandle<R, S> {
    let coordinator = Arc::new(self);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let ticker = Arc::clone(&coordinator);
    let task = tokio::spawn(async move {
      let mut ticks = tokio::time::interval(interval);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
        tokio::select! {
          _ = ticks.tick() => {
            ticker.run_pass().await;
          }
          changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
              break;
            }
          }
        }
      }
      debug!("sync ticker stopped");
    });

    SyncHandle {
      coordinator,
      task,
      shutdown: shutdown_tx,
    }
  }
}

impl<R: RemoteSource, S: LocalStore> Clone for SyncCoordinator<R, S> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      running: Arc::clone(&self.running),
      holder: Arc::clone(&self.holder),
      observer: self.observer.clone(),
    }
  }
}

/// Handle to the recurring sync task.
pub struct SyncHandle<R: RemoteSource, S: LocalStore> {
  coordinator: Arc<SyncCoordinator<R, S>>,
  task: JoinHandle<()>,
  shutdown: watch::Sender<bool>,
}

impl<R: RemoteSource, S: LocalStore> SyncHandle<R, S> {
  /// Request an immediate pass. Subject to the same overlap guard as the ticker.
  pub fn trigger(&self) -> JoinHandle<PassOutcome> {
    let coordinator = Arc::clone(&self.coordinator);
    tokio::spawn(async move { coordinator.run_pass().await })
  }

  /// Stop the ticker. A pass already in flight finishes first.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    if let Err(e) = self.task.await {
      error!(error = %e, "sync task panicked");
    }
  }
}
