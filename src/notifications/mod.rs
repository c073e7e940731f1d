//! Fan-out of instance lifecycle events.
//!
//! Delivery is best-effort: publishing never blocks and succeeds even when
//! nobody is subscribed. Slow subscribers miss events rather than stall the
//! orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::registry::{Instance, InstanceStatus};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    StatusChanged,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub kind: EventKind,
    pub instance_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<InstanceStatus>,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn created(instance: &Instance) -> Self {
        Self::new(EventKind::Created, instance, None)
    }

    pub fn status_changed(instance: &Instance, previous: InstanceStatus) -> Self {
        Self::new(EventKind::StatusChanged, instance, Some(previous))
    }

    pub fn deleted(instance: &Instance) -> Self {
        Self::new(EventKind::Deleted, instance, Some(instance.status))
    }

    fn new(kind: EventKind, instance: &Instance, previous: Option<InstanceStatus>) -> Self {
        Self {
            kind,
            instance_id: instance.id.clone(),
            name: instance.name.clone(),
            previous,
            status: instance.status,
            message: instance.error_message.clone(),
            at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct StatusNotifier {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StatusEvent) {
        tracing::debug!(
            instance = %event.instance_id,
            kind = ?event.kind,
            status = %event.status,
            "Publishing instance event"
        );
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::fixtures;

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = StatusNotifier::new();
        let instance = fixtures::instance("ab12cd34", "demo", 8100);
        notifier.publish(StatusEvent::created(&instance));

        // Later subscribers only see later events.
        let mut rx = notifier.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribers_receive_transitions() {
        let notifier = StatusNotifier::new();
        let mut rx = notifier.subscribe();

        let mut instance = fixtures::instance("ab12cd34", "demo", 8100);
        let previous = instance.transition(InstanceStatus::Error, Some("script failed".to_string()));
        notifier.publish(StatusEvent::status_changed(&instance, previous));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::StatusChanged);
        assert_eq!(event.previous, Some(InstanceStatus::Running));
        assert_eq!(event.status, InstanceStatus::Error);
        assert_eq!(event.message.as_deref(), Some("script failed"));
    }

    #[test]
    fn test_event_serializes_to_json() {
        let instance = fixtures::instance("ab12cd34", "demo", 8100);
        let json = serde_json::to_value(StatusEvent::deleted(&instance)).unwrap();
        assert_eq!(json["kind"], "deleted");
        assert_eq!(json["instance_id"], "ab12cd34");
        assert_eq!(json["status"], "running");
        assert!(json.get("message").is_none());
    }
}
