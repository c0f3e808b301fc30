use std::time::Duration;
use tokio::sync::mpsc;

use crate::sync::SyncReport;

/// Events driving the monitor loop
#[derive(Debug)]
pub enum Event {
  /// Periodic tick for query polling and refresh
  Tick,
  /// A sync pass pushed queued records to the remote
  Synced(SyncReport),
  /// Ctrl-C
  Quit,
}

/// Event handler that produces events from a tick timer and the interrupt signal
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticks = tokio::time::interval(tick_rate);
      loop {
        ticks.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    let quit_tx = tx.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = quit_tx.send(Event::Quit);
      }
    });

    Self { tx, rx }
  }

  /// Sender for events produced elsewhere (e.g. sync notifications)
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_ticks_and_forwarded_events() {
    let mut events = EventHandler::new(Duration::from_millis(5));
    assert!(matches!(events.next().await, Some(Event::Tick)));

    events
      .sender()
      .send(Event::Synced(SyncReport::default()))
      .unwrap();

    let mut saw_sync = false;
    for _ in 0..10 {
      if let Some(Event::Synced(_)) = events.next().await {
        saw_sync = true;
        break;
      }
    }
    assert!(saw_sync);
  }
}
