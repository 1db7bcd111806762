//! Connection events and non-blocking broadcast emitter.

use tokio::sync::broadcast;

use crate::connection::Connection;

/// Connection lifecycle events.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection finished upgrading and is live.
    Opened(Connection),
    /// A connection reached its terminal state. Emitted exactly once per
    /// connection, always after its `Opened` event.
    Closed(Connection),
}

impl ConnectionEvent {
    /// The connection the event is about.
    pub fn connection(&self) -> &Connection {
        match self {
            Self::Opened(connection) | Self::Closed(connection) => connection,
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Non-blocking broadcast emitter. Slow subscribers drop events
/// independently without affecting the emitting side.
#[derive(Debug)]
pub struct ConnectionEvents {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl Clone for ConnectionEvents {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl Default for ConnectionEvents {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ConnectionEvents {
    /// Emitter with room for `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events emitted from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // Send only fails when nobody is listening, which is fine.
        let _ = self.tx.send(event);
    }
}
