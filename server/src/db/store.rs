//! Message store: durable append plus the two conversation queries.
//!
//! The trait is synchronous like rusqlite itself; async callers
//! go through `tokio::task::spawn_blocking`.

use chrono::Utc;
use rusqlite::{params, Row};

use super::models::{StoredMessage, UserId};
use super::DbPool;
use crate::error::StoreError;

/// Durable message log consumed by the relay and the history endpoints.
pub trait MessageStore: Send + Sync + 'static {
    /// Persist one message and return the stored record.
    fn append(
        &self,
        sender: UserId,
        receiver: UserId,
        body: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// All messages exchanged between `a` and `b`, oldest first.
    fn history(&self, a: UserId, b: UserId) -> Result<Vec<StoredMessage>, StoreError>;

    /// The newest message per distinct counterpart of `user`, newest first.
    fn recent_contacts(&self, user: UserId) -> Result<Vec<StoredMessage>, StoreError>;
}

/// SQLite-backed [`MessageStore`].
#[derive(Clone)]
pub struct SqliteMessageStore {
    db: DbPool,
}

impl SqliteMessageStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        body: row.get(3)?,
        sent_at: row.get(4)?,
    })
}

impl MessageStore for SqliteMessageStore {
    fn append(
        &self,
        sender: UserId,
        receiver: UserId,
        body: &str,
    ) -> Result<StoredMessage, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;
        let sent_at = Utc::now();

        conn.execute(
            "INSERT INTO messages (sender_id, receiver_id, body, sent_at) VALUES (?1, ?2, ?3, ?4)",
            params![sender, receiver, body, sent_at],
        )?;

        Ok(StoredMessage {
            id: conn.last_insert_rowid(),
            sender_id: sender,
            receiver_id: receiver,
            body: body.to_string(),
            sent_at,
        })
    }

    fn history(&self, a: UserId, b: UserId) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, receiver_id, body, sent_at
             FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY id ASC",
        )?;

        let messages = stmt
            .query_map(params![a, b], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn recent_contacts(&self, user: UserId) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.sender_id, m.receiver_id, m.body, m.sent_at
             FROM messages m
             JOIN (
                 SELECT CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END AS other_id,
                        MAX(id) AS last_id
                 FROM messages
                 WHERE sender_id = ?1 OR receiver_id = ?1
                 GROUP BY other_id
             ) latest ON m.id = latest.last_id
             ORDER BY m.id DESC",
        )?;

        let messages = stmt
            .query_map(params![user], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }
}
