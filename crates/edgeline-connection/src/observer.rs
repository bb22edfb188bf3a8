//! Connection lifecycle events

use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the event channel; slow subscribers lag instead of blocking handlers
const EVENT_BUFFER: usize = 64;

/// Kind of lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Connection registered with the edge at `location`
    Connected { location: String },
    /// Connection is about to be unregistered
    Unregistering,
    /// Unregistration finished (or was given up on)
    Unregistered,
}

/// Lifecycle event tagged with its connection index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub index: u8,
    pub kind: EventKind,
}

/// Event sink shared by every connection of a tunnel
#[derive(Debug, Clone)]
pub struct Observer {
    events: broadcast::Sender<ConnectionEvent>,
}

impl Observer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { events }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn send_connected_event(&self, index: u8, location: &str) {
        self.send_event(ConnectionEvent {
            index,
            kind: EventKind::Connected {
                location: location.to_string(),
            },
        });
    }

    pub fn send_unregistering_event(&self, index: u8) {
        debug!(conn_index = index, "Unregistering tunnel connection");
        self.send_event(ConnectionEvent {
            index,
            kind: EventKind::Unregistering,
        });
    }

    pub fn log_unregistered(&self, index: u8) {
        info!(conn_index = index, "Unregistered tunnel connection");
        self.send_event(ConnectionEvent {
            index,
            kind: EventKind::Unregistered,
        });
    }

    fn send_event(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}
