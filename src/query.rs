//! Async query abstraction for the monitor loop.
//!
//! A `Query<T>` runs its fetcher as a task on the runtime and hands the result
//! back over a channel. The loop that owns the query polls it on each tick, so
//! results are marshalled back to the owner instead of being written into
//! shared state by the worker.
//!
//! # Example
//!
//! ```ignore
//! let cache = cache.clone();
//! let mut query = Query::new(move || {
//!     let cache = cache.clone();
//!     async move { cache.get_by_range(range).await.map_err(|e| e.to_string()) }
//! })
//! .with_stale_time(Duration::from_secs(30));
//!
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     render(query.state());
//! }
//! if query.needs_refresh() {
//!     query.refetch();
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// A boxed future that returns a Result<T, String>
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Async query for data fetching with state management.
pub struct Query<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, String>>>,
  /// When the last fetch finished, successfully or not
  settled_at: Option<Instant>,
  stale_time: Duration,
}

impl<T: Send + 'static> Query<T> {
  /// Create a new query with the given fetcher function.
  ///
  /// The fetcher is called each time `fetch()` or `refetch()` is invoked.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: Box::new(move || Box::pin(fetcher())),
      receiver: None,
      settled_at: None,
      stale_time: Duration::from_secs(60),
    }
  }

  /// Set how long a settled result is kept before `needs_refresh()` fires.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// True once a settled result (data or error) is older than the stale time.
  pub fn needs_refresh(&self) -> bool {
    match &self.state {
      QueryState::Success(_) | QueryState::Error(_) => self
        .settled_at
        .map(|t| t.elapsed() > self.stale_time)
        .unwrap_or(true),
      QueryState::Idle => true,
      QueryState::Loading => false,
    }
  }

  /// Start fetching data if not already loading.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch, dropping any fetch still in flight.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed (data arrived or error occurred).
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(Ok(data)) => {
        self.settle(QueryState::Success(data));
        true
      }
      Ok(Err(error)) => {
        self.settle(QueryState::Error(error));
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.settle(QueryState::Error("Query was cancelled".to_string()));
        true
      }
    }
  }

  fn settle(&mut self, state: QueryState<T>) {
    self.state = state;
    self.settled_at = Some(Instant::now());
    self.receiver = None;
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let future = (self.fetcher)();
    tokio::spawn(async move {
      // Receiver may have been dropped by a refetch
      let _ = tx.send(future.await);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("settled_at", &self.settled_at)
      .field("stale_time", &self.stale_time)
      .finish_non_exhaustive()
  }
}
