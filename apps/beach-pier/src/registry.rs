use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::protocol::{ConnectionId, ServerMessage};

pub const DEFAULT_CONNECTION_BUFFER: usize = 64;

/// Read side of the connection registry, as seen by the matchmaking core.
pub trait Directory: Send + Sync {
    fn is_live(&self, id: ConnectionId) -> bool;

    /// Hand a message to the connection's writer without waiting.
    fn deliver(&self, id: ConnectionId, message: ServerMessage) -> Delivery;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The connection's outbound buffer is full; the message was dropped.
    Full,
    /// The connection is not registered or its writer has gone away.
    Gone,
}

impl Delivery {
    pub fn is_delivered(self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

/// Live connections and their outbound channels.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connections: DashMap<ConnectionId, mpsc::Sender<ServerMessage>>,
    per_connection_buffer: usize,
}

pub struct Registration {
    pub connection_id: ConnectionId,
    pub receiver: mpsc::Receiver<ServerMessage>,
}

impl ConnectionRegistry {
    pub fn new(per_connection_buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                per_connection_buffer: per_connection_buffer.max(1),
            }),
        }
    }

    pub fn register(&self) -> Registration {
        let (tx, rx) = mpsc::channel(self.inner.per_connection_buffer);
        let connection_id = ConnectionId::generate();
        self.inner.connections.insert(connection_id, tx);
        counter!("beach_pier_connections_opened_total", 1);
        Registration {
            connection_id,
            receiver: rx,
        }
    }

    /// Returns whether the connection was registered. Safe to call repeatedly.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.inner.connections.remove(&id).is_some();
        if removed {
            counter!("beach_pier_connections_closed_total", 1);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_BUFFER)
    }
}

impl Directory for ConnectionRegistry {
    fn is_live(&self, id: ConnectionId) -> bool {
        self.inner
            .connections
            .get(&id)
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    fn deliver(&self, id: ConnectionId, message: ServerMessage) -> Delivery {
        // Clone the sender so no map guard is held while sending.
        let Some(sender) = self.inner.connections.get(&id).map(|entry| entry.clone()) else {
            return Delivery::Gone;
        };
        let kind = message.kind();
        match sender.try_send(message) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                debug!(connection_id = %id, kind, "outbound buffer full, dropping message");
                counter!("beach_pier_delivery_dropped_total", 1, "reason" => "full");
                Delivery::Full
            }
            Err(TrySendError::Closed(_)) => {
                counter!("beach_pier_delivery_dropped_total", 1, "reason" => "closed");
                Delivery::Gone
            }
        }
    }
}
