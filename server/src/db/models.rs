//! Database row types.
//! These correspond 1:1 to the SQLite schema defined in migrations.rs.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Server-assigned user identity. Owned by the identity subsystem; the relay
/// never creates or destroys one.
pub type UserId = i64;

/// Store-assigned message identity.
pub type MessageId = i64;

/// Message record in the messages table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "msg")]
    pub body: String,
    #[serde(rename = "time")]
    pub sent_at: DateTime<Utc>,
}

impl StoredMessage {
    /// The participant that is not `user_id`.
    pub fn counterpart_of(&self, user_id: UserId) -> UserId {
        if self.sender_id == user_id {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}
