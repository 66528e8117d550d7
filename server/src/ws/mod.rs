pub mod actor;
pub mod handler;
pub mod protocol;

use axum::extract::ws::{CloseFrame, Message};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::db::models::UserId;
use crate::error::DeliveryError;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Registry-allocated identity of one physical connection.
pub type ConnectionId = u64;

/// Close code sent to a connection replaced by a newer one for the same user.
pub const CLOSE_SUPERSEDED: u16 = 4000;

/// Handle to one live connection: its outbound queue plus a shutdown signal
/// that the owning session's reader selects on.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: ConnectionSender,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its session watches for shutdown.
    pub fn new(id: ConnectionId, tx: ConnectionSender) -> (Self, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = Self {
            id,
            tx,
            shutdown: Arc::new(shutdown),
        };
        (handle, shutdown_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame for this connection's writer. Never blocks.
    pub fn send(&self, msg: Message) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::ConnectionClosed(self.id));
        }
        self.tx
            .send(msg)
            .map_err(|_| DeliveryError::ConnectionClosed(self.id))
    }

    /// Queue a close frame and signal the owning session to stop reading.
    /// Never blocks; safe to call while holding the registry entry.
    pub fn close(&self, code: u16, reason: &str) {
        if *self.shutdown.borrow() {
            return;
        }
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })));
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.tx.is_closed()
    }
}

/// Connection registry: at most one live connection per user.
///
/// Every operation goes through the map's entry locks, so a `get` racing an
/// `add` observes either the old handle (not yet closed) or the new one.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<UserId, ConnectionHandle>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle with a fresh connection id around `tx`.
    pub fn open_handle(&self, tx: ConnectionSender) -> (ConnectionHandle, watch::Receiver<bool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        ConnectionHandle::new(id, tx)
    }

    /// Register `handle` as the live connection for `user_id`.
    /// A previous handle is closed before this returns (last writer wins).
    pub fn add(&self, user_id: UserId, handle: ConnectionHandle) {
        match self.connections.entry(user_id) {
            Entry::Occupied(mut entry) => {
                let new_id = handle.id();
                let previous = entry.insert(handle);
                if previous.id() != new_id {
                    previous.close(CLOSE_SUPERSEDED, "Superseded by a newer connection");
                    tracing::info!(
                        user_id = %user_id,
                        previous = previous.id(),
                        current = new_id,
                        "Connection superseded"
                    );
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
            }
        }
    }

    /// Drop the entry for `user_id`, if any.
    pub fn remove(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.remove(&user_id).map(|(_, handle)| handle)
    }

    /// Drop the entry for `user_id` only if it is still connection `id`.
    /// Returns whether an entry was removed.
    pub fn release(&self, user_id: UserId, id: ConnectionId) -> bool {
        self.connections
            .remove_if(&user_id, |_, handle| handle.id() == id)
            .is_some()
    }

    /// The current live connection for `user_id`.
    pub fn get(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.get(&user_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
