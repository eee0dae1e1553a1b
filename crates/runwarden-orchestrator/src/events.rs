//! Event sink and in-process fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use runwarden_core::EventRecord;

use crate::store::Store;

/// Receives every event emitted by the services.
///
/// Emission is fire-and-forget: a failed sink never fails the state change
/// that produced the event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: EventRecord);
}

/// Persists events through the store and broadcasts them to subscribers.
pub struct EventBus {
    store: Arc<dyn Store>,
    tx: broadcast::Sender<EventRecord>,
}

impl EventBus {
    /// Create a new EventBus.
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { store, tx }
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn emit(&self, event: EventRecord) {
        if let Err(e) = self.store.append_event(event.clone()).await {
            warn!(
                event_type = ?event.event_type,
                project_id = %event.project_id,
                error = %e,
                "Failed to persist event"
            );
        }

        debug!(event_type = ?event.event_type, project_id = %event.project_id, "Event emitted");

        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use runwarden_core::{EventType, ProjectId};

    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn emit_persists_and_broadcasts() {
        let store = Arc::new(InMemoryStore::new());
        let bus = EventBus::new(store.clone(), 8);
        let mut rx = bus.subscribe();

        let project = ProjectId::new("p");
        let event = EventRecord::new(
            project.clone(),
            EventType::TaskCreated,
            serde_json::json!({"task_id": "t1"}),
            Some("trace-1".to_string()),
            Utc::now(),
        );
        bus.emit(event.clone()).await;

        assert_eq!(rx.recv().await.unwrap(), event);
        assert_eq!(store.list_events(&project).await.unwrap(), vec![event]);
    }

    #[tokio::test]
    async fn emit_without_subscribers_still_persists() {
        let store = Arc::new(InMemoryStore::new());
        let bus = EventBus::new(store.clone(), 8);
        let project = ProjectId::new("p");
        bus.emit(EventRecord::new(
            project.clone(),
            EventType::RunCreated,
            serde_json::Value::Null,
            None,
            Utc::now(),
        ))
        .await;
        assert_eq!(store.list_events(&project).await.unwrap().len(), 1);
    }
}
