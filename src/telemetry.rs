//! Metrics broadcast for external observers.
//!
//! Sending never blocks and never fails the caller: with no subscribers the
//! event is simply dropped, and slow subscribers lag rather than back-pressure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Snapshot emitted after any worker-count or activity change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub active_workers: usize,
    pub active_tasks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Fire-and-forget metrics sender.
#[derive(Debug, Clone)]
pub struct Telemetry {
    tx: broadcast::Sender<MetricsEvent>,
}

impl Telemetry {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, active_workers: usize, active_tasks: usize, message: Option<String>) {
        let event = MetricsEvent {
            active_workers,
            active_tasks,
            message,
            timestamp: Utc::now(),
        };
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`; lagged items surface as `Err` entries.
    pub fn stream(&self) -> BroadcastStream<MetricsEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn test_emit_without_subscribers() {
        let telemetry = Telemetry::new(4);
        telemetry.emit(1, 0, None);
    }

    #[tokio::test]
    async fn test_subscriber_receives() {
        let telemetry = Telemetry::new(4);
        let mut rx = telemetry.subscribe();
        telemetry.emit(2, 1, Some("spawned".to_string()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.active_workers, 2);
        assert_eq!(event.active_tasks, 1);
        assert_eq!(event.message.as_deref(), Some("spawned"));
    }

    #[tokio::test]
    async fn test_stream() {
        let telemetry = Telemetry::new(4);
        let mut stream = telemetry.stream();
        telemetry.emit(3, 0, None);

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.active_workers, 3);
    }
}
