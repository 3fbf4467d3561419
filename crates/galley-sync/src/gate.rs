// File: galley-sync/src/gate.rs
// Purpose: Connectivity gate choosing the write path for each mutation

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::events::{EventBus, SyncTrigger};

/// Connectivity signal as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

/// How a mutation reaches the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    /// Remote call first, then local write tagged `synced`.
    /// Falls back to `Queued` on network failure.
    Direct,
    /// Local write tagged `pending`, then enqueue
    Queued,
}

pub fn decide_write_path(signal: Connectivity) -> WritePath {
    match signal {
        Connectivity::Online => WritePath::Direct,
        Connectivity::Offline => WritePath::Queued,
    }
}

/// Holds the current connectivity signal
///
/// Transitioning from offline to online publishes
/// [`SyncTrigger::ConnectivityRestored`].
pub struct ConnectivityGate {
    tx: watch::Sender<Connectivity>,
    bus: EventBus,
}

impl ConnectivityGate {
    pub fn new(initial: Connectivity, bus: EventBus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx, bus }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == Connectivity::Online
    }

    pub fn write_path(&self) -> WritePath {
        decide_write_path(self.current())
    }

    /// Record a new signal from the platform
    pub fn set(&self, signal: Connectivity) {
        let previous = self.tx.send_replace(signal);
        if previous == signal {
            return;
        }

        tracing::info!(?previous, current = ?signal, "connectivity changed");
        if signal == Connectivity::Online {
            self.bus.trigger(SyncTrigger::ConnectivityRestored);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;

    #[test]
    fn test_decide_write_path() {
        assert_eq!(decide_write_path(Connectivity::Online), WritePath::Direct);
        assert_eq!(decide_write_path(Connectivity::Offline), WritePath::Queued);
    }

    #[test]
    fn test_reconnect_publishes_trigger_once() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let gate = ConnectivityGate::new(Connectivity::Offline, bus);

        gate.set(Connectivity::Offline);
        assert!(rx.try_recv().is_err());

        gate.set(Connectivity::Online);
        gate.set(Connectivity::Online);
        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::Trigger {
                trigger: SyncTrigger::ConnectivityRestored
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(gate.write_path(), WritePath::Direct);
    }

    #[test]
    fn test_going_offline_switches_to_queued() {
        let gate = ConnectivityGate::new(Connectivity::Online, EventBus::new());
        let watcher = gate.subscribe();

        gate.set(Connectivity::Offline);

        assert!(!gate.is_online());
        assert_eq!(gate.write_path(), WritePath::Queued);
        assert_eq!(*watcher.borrow(), Connectivity::Offline);
    }
}
