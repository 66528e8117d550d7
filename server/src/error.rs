//! Error taxonomy for the relay.
//!
//! Only `HandshakeRejected` and `Transport` end a session. Everything else is
//! recovered inside the read loop and logged.

use thiserror::Error;

use crate::db::models::UserId;

/// Why a credential could not be mapped to a user identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential expired")]
    Expired,

    #[error("credential invalid: {0}")]
    Invalid(String),
}

/// Message store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    Task(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Forwarding to a recipient's live handle failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection {0} already closed")]
    ConnectionClosed(u64),

    #[error("failed to encode outbound frame: {0}")]
    Encode(String),
}

/// Relay error taxonomy.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("handshake rejected: {0}")]
    HandshakeRejected(#[from] CredentialError),

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("failed to persist message from {sender} to {receiver}: {source}")]
    Persist {
        sender: UserId,
        receiver: UserId,
        #[source]
        source: StoreError,
    },

    #[error("failed to deliver to {receiver}: {source}")]
    Delivery {
        receiver: UserId,
        #[source]
        source: DeliveryError,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Whether the session must stop reading after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::HandshakeRejected(_) | RelayError::Transport(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Decode(err.to_string())
    }
}
