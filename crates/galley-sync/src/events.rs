// File: galley-sync/src/events.rs
// Purpose: Local-device event bus for flush triggers and change notifications

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Named reasons to drain the change queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// The gate saw the network come back
    ConnectivityRestored,
    /// Someone asked for a flush (e.g. a "sync now" action)
    ExplicitFlushRequested,
    /// Scheduler heartbeat
    PeriodicTick,
}

/// "Entity type X updated" for one tenant, sent by the context `origin`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityChanged {
    pub tenant_id: String,
    pub entity_type: String,
    pub origin: Uuid,
}

/// Events carried on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Trigger { trigger: SyncTrigger },
    EntityChanged(EntityChanged),
    /// A queued mutation ran out of retries
    Conflict {
        tenant_id: String,
        entity_type: String,
        entity_id: String,
        attempts: u32,
    },
}

/// Broadcast bus shared by every context on a device
///
/// Not a remote-push mechanism: it only tells other open contexts to re-run
/// their reads.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn trigger(&self, trigger: SyncTrigger) {
        tracing::debug!(?trigger, "sync trigger");
        self.publish(SyncEvent::Trigger { trigger });
    }

    pub fn entity_changed(&self, tenant_id: &str, entity_type: &str, origin: Uuid) {
        self.publish(SyncEvent::EntityChanged(EntityChanged {
            tenant_id: tenant_id.to_string(),
            entity_type: entity_type.to_string(),
            origin,
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
