use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, trace};
use messenger_core::{ConnectionId, Message};
use tokio::sync::{mpsc, Notify};

/// Per-connection delivery handle, owned by the server state
#[derive(Debug)]
pub struct ConnectionHandle {
    pub name: String,
    pub peer_addr: String,
    outbound: mpsc::Sender<Message>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(
        name: String,
        peer_addr: String,
        outbound: mpsc::Sender<Message>,
        close: Arc<Notify>,
    ) -> Self {
        Self {
            name,
            peer_addr,
            outbound,
            close,
        }
    }
}

/// Server state tracking live connections and their outbound queues
#[derive(Debug, Default)]
pub struct ServerState {
    pub connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ConnectionId, handle: ConnectionHandle) {
        self.connections.insert(id, handle);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    /// Queue `message` for each recipient without waiting.
    ///
    /// A recipient whose queue is full or whose writer is gone misses the
    /// message; nobody else is held up. Returns how many were queued.
    pub fn deliver(&self, recipients: &[ConnectionId], message: &Message) -> usize {
        let mut delivered = 0;
        for id in recipients {
            let Some(handle) = self.connections.get(id) else {
                trace!("Connection {} left before delivery of {}", id, message.msg_type());
                continue;
            };
            match handle.outbound.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(
                        "Outbound queue full for connection {} ({}), dropping {}",
                        id,
                        handle.name,
                        message.msg_type()
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!("Connection {} is closing, dropping {}", id, message.msg_type());
                }
            }
        }
        delivered
    }

    /// Ask the connection's task to close its socket. Returns false if unknown.
    pub fn close(&self, id: ConnectionId) -> bool {
        match self.connections.get(&id) {
            Some(handle) => {
                handle.close.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
