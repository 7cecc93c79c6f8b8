//! Live progress of in-flight units.
//!
//! [`ProgressTracker`] is an in-memory view for status queries; it is never
//! persisted. [`EventSink`] fans scheduler events out to the caller's channel
//! and the tracker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;

use super::models::{ProgressEvent, SchedulerEvent};

/// Thread-safe store of the latest progress event per unit, keyed by
/// fingerprint. Shared across the application via `AppContext`.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, ProgressEvent>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, fingerprint: &str, event: ProgressEvent) {
        let mut map = self.inner.write().await;
        map.insert(fingerprint.to_string(), event);
    }

    pub async fn get(&self, fingerprint: &str) -> Option<ProgressEvent> {
        let map = self.inner.read().await;
        map.get(fingerprint).cloned()
    }

    /// Called when the unit reaches a terminal state.
    pub async fn remove(&self, fingerprint: &str) {
        let mut map = self.inner.write().await;
        map.remove(fingerprint);
    }

    pub async fn get_all(&self) -> HashMap<String, ProgressEvent> {
        let map = self.inner.read().await;
        map.clone()
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }
}

/// Where a run reports to. Both outputs are optional.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SchedulerEvent>>,
    tracker: Option<ProgressTracker>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::Sender<SchedulerEvent>>, tracker: Option<ProgressTracker>) -> Self {
        Self { tx, tracker }
    }

    /// Lifecycle events are delivered reliably; a dropped receiver is ignored.
    pub async fn lifecycle(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    /// Byte progress is best effort: if the consumer lags, intermediate
    /// events are dropped rather than stalling the transfer. The final event
    /// of a unit (`bytes_transferred == total_bytes`) is always delivered.
    pub async fn progress(&self, fingerprint: &str, event: ProgressEvent) {
        if let Some(tracker) = &self.tracker {
            tracker.update(fingerprint, event.clone()).await;
        }
        if let Some(tx) = &self.tx {
            if event.bytes_transferred >= event.total_bytes {
                let _ = tx.send(SchedulerEvent::Progress(event)).await;
            } else {
                let _ = tx.try_send(SchedulerEvent::Progress(event));
            }
        }
    }

    pub async fn finished(&self, fingerprint: &str) {
        if let Some(tracker) = &self.tracker {
            tracker.remove(fingerprint).await;
        }
    }
}

/// Throughput over the interval since the previous sample.
#[derive(Debug)]
pub struct SpeedMeter {
    last_at: Instant,
    last_bytes: u64,
}

impl SpeedMeter {
    pub fn new(start_bytes: u64) -> Self {
        Self {
            last_at: Instant::now(),
            last_bytes: start_bytes,
        }
    }

    /// Bytes per second since the previous call.
    pub fn sample(&mut self, bytes: u64) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_at).max(Duration::from_millis(1));
        let delta = bytes.saturating_sub(self.last_bytes);
        self.last_at = now;
        self.last_bytes = bytes;
        delta as f64 / elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(index: usize, bytes: u64) -> ProgressEvent {
        ProgressEvent {
            unit_index: index,
            unit_name: format!("unit-{index}"),
            bytes_transferred: bytes,
            total_bytes: 1000,
            speed_bps: 0.0,
        }
    }

    #[tokio::test]
    async fn lagging_consumer_still_sees_the_final_event() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(Some(tx), None);

        sink.progress("fp-1", event(0, 500)).await;
        sink.progress("fp-1", event(0, 700)).await;
        let last = tokio::spawn({
            let sink = sink.clone();
            async move { sink.progress("fp-1", event(0, 1000)).await }
        });

        let mut seen = Vec::new();
        for _ in 0..2 {
            if let Some(SchedulerEvent::Progress(p)) = rx.recv().await {
                seen.push(p.bytes_transferred);
            }
        }
        last.await.unwrap();
        assert_eq!(seen, vec![500, 1000]);
    }

    #[tokio::test]
    async fn test_progress_tracker_basic_operations() {
        let tracker = ProgressTracker::new();

        assert_eq!(tracker.active_count().await, 0);
        assert!(tracker.get("fp-1").await.is_none());

        tracker.update("fp-1", event(0, 500)).await;
        assert_eq!(tracker.active_count().await, 1);
        assert_eq!(tracker.get("fp-1").await.unwrap().bytes_transferred, 500);

        tracker.update("fp-1", event(0, 750)).await;
        assert_eq!(tracker.get("fp-1").await.unwrap().bytes_transferred, 750);

        tracker.remove("fp-1").await;
        assert_eq!(tracker.active_count().await, 0);
        assert!(tracker.get("fp-1").await.is_none());
    }

    #[tokio::test]
    async fn test_progress_tracker_multiple_units() {
        let tracker = ProgressTracker::new();
        tracker.update("fp-1", event(0, 1)).await;
        tracker.update("fp-2", event(1, 2)).await;
        tracker.update("fp-3", event(2, 3)).await;

        let all = tracker.get_all().await;
        assert_eq!(all.len(), 3);
        assert!(all.contains_key("fp-2"));
    }

    #[tokio::test]
    async fn lagging_consumer_drops_progress() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(Some(tx), None);

        sink.progress("fp", event(0, 1)).await;
        sink.progress("fp", event(0, 2)).await;

        match rx.recv().await.unwrap() {
            SchedulerEvent::Progress(e) => assert_eq!(e.bytes_transferred, 1),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn speed_is_measured_per_interval() {
        let mut meter = SpeedMeter::new(0);
        tokio::time::advance(Duration::from_secs(2)).await;
        let speed = meter.sample(1000);
        assert!((speed - 500.0).abs() < 1.0);
    }
}
