// Notification sink for blacklist transitions

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::proxy::Platform;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AvailabilityEvent {
    Blacklisted {
        platform: Platform,
        provider: String,
        until: DateTime<Utc>,
        level: u32,
        consecutive_failures: u32,
    },
    Recovered {
        platform: Platform,
        provider: String,
        manual: bool,
    },
}

/// Fire-and-forget delivery; failures must never reach the caller.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &AvailabilityEvent);
}

/// Drops events after a debug log line.
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, event: &AvailabilityEvent) {
        tracing::debug!("availability event: {:?}", event);
    }
}

/// Fans events out to any number of subscribers (the management SSE stream).
pub struct BroadcastNotifier {
    tx: broadcast::Sender<AvailabilityEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AvailabilityEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl NotificationSink for BroadcastNotifier {
    fn notify(&self, event: &AvailabilityEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_without_subscribers_does_not_fail() {
        let notifier = BroadcastNotifier::default();
        notifier.notify(&AvailabilityEvent::Recovered {
            platform: Platform::Claude,
            provider: "a".into(),
            manual: false,
        });
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let notifier = BroadcastNotifier::default();
        let mut rx = notifier.subscribe();
        let event = AvailabilityEvent::Recovered {
            platform: Platform::Codex,
            provider: "b".into(),
            manual: true,
        };
        notifier.notify(&event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = AvailabilityEvent::Recovered {
            platform: Platform::Custom("droid".into()),
            provider: "c".into(),
            manual: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "recovered");
        assert_eq!(json["platform"], "custom:droid");
    }
}
