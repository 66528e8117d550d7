//! Relay protocol: the inbound envelope and the persist-then-forward decision.

use axum::extract::ws::Message;
use serde::Deserialize;

use crate::config::ForwardMode;
use crate::db::models::{MessageId, StoredMessage, UserId};
use crate::error::{DeliveryError, RelayError, StoreError};
use crate::state::AppState;

/// Inbound message envelope. The sender is never read from the client;
/// unknown fields such as a client-supplied `sender_id` are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundEnvelope {
    #[serde(alias = "receiver")]
    pub receiver_id: UserId,
    #[serde(alias = "body")]
    pub msg: String,
}

/// What happened to a message that was accepted and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Queued on the receiver's live connection.
    Delivered(MessageId),
    /// Receiver not connected; available through history only.
    Stored(MessageId),
}

/// Decode a JSON envelope sent by `sender` from a text or binary frame payload.
/// A message always names two distinct identities, so a receiver equal to the
/// sender is rejected like any other malformed frame.
pub fn decode_envelope(data: &[u8], sender: UserId) -> Result<InboundEnvelope, RelayError> {
    let envelope: InboundEnvelope = serde_json::from_slice(data)?;
    if envelope.receiver_id <= 0 {
        return Err(RelayError::Decode(format!(
            "receiver_id {} is not a valid identity",
            envelope.receiver_id
        )));
    }
    if envelope.receiver_id == sender {
        return Err(RelayError::Decode(format!(
            "user {} cannot message itself",
            sender
        )));
    }
    Ok(envelope)
}

/// Handle one inbound data frame from `sender`: decode, persist, forward.
///
/// The returned error is always recoverable for the sender's session.
pub async fn relay_frame(
    state: &AppState,
    sender: UserId,
    frame: Message,
) -> Result<RelayOutcome, RelayError> {
    let envelope = match &frame {
        Message::Text(text) => decode_envelope(text.as_str().as_bytes(), sender)?,
        Message::Binary(data) => decode_envelope(data, sender)?,
        _ => return Err(RelayError::Decode("not a data frame".to_string())),
    };
    let receiver = envelope.receiver_id;

    let stored = persist(state, sender, receiver, envelope.msg).await?;

    let Some(handle) = state.connections.get(receiver) else {
        return Ok(RelayOutcome::Stored(stored.id));
    };

    let outbound = match state.session.forward_mode {
        ForwardMode::Verbatim => frame,
        ForwardMode::Enriched => enriched_frame(&stored).map_err(|source| {
            RelayError::Delivery { receiver, source }
        })?,
    };

    handle
        .send(outbound)
        .map_err(|source| RelayError::Delivery { receiver, source })?;

    Ok(RelayOutcome::Delivered(stored.id))
}

/// Build the server-side frame for a persisted message.
pub fn enriched_frame(stored: &StoredMessage) -> Result<Message, DeliveryError> {
    let json = serde_json::to_string(stored).map_err(|e| DeliveryError::Encode(e.to_string()))?;
    Ok(Message::Text(json.into()))
}

/// Append through the store on the blocking pool. No registry lock is held here.
async fn persist(
    state: &AppState,
    sender: UserId,
    receiver: UserId,
    body: String,
) -> Result<StoredMessage, RelayError> {
    let store = state.store.clone();

    tokio::task::spawn_blocking(move || store.append(sender, receiver, &body))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))
        .and_then(|result| result)
        .map_err(|source| RelayError::Persist {
            sender,
            receiver,
            source,
        })
}
