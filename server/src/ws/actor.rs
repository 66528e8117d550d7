use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::db::models::UserId;
use crate::error::RelayError;
use crate::state::AppState;
use crate::ws::protocol::{self, RelayOutcome};
use crate::ws::{ConnectionId, ConnectionRegistry};

/// Removes the session's registry entry when dropped, including on panic
/// unwinds and task cancellation. Leaves a successor's entry untouched.
struct Registration {
    registry: ConnectionRegistry,
    user_id: UserId,
    connection_id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let removed = self.registry.release(self.user_id, self.connection_id);
        tracing::debug!(
            user_id = %self.user_id,
            connection_id = self.connection_id,
            removed,
            "Connection unregistered"
        );
    }
}

/// Run the relay session for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader loop: decodes inbound frames and relays them one at a time
///
/// The loop ends on client close, transport error, keepalive failure, or when
/// the registry supersedes this connection and flips its shutdown signal.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: UserId) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let (handle, mut shutdown) = state.connections.open_handle(tx.clone());
    let connection_id = handle.id();

    state.connections.add(user_id, handle.clone());
    let registration = Registration {
        registry: state.connections.clone(),
        user_id,
        connection_id,
    };

    tracing::info!(
        user_id = %user_id,
        connection_id,
        "WebSocket session started"
    );

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    let ping_handle = {
        let handle = handle.clone();
        let ping_interval = state.session.ping_interval();
        let pong_timeout = state.session.pong_timeout();
        tokio::spawn(async move {
            let mut ping_timer = interval(ping_interval);
            // Skip the first immediate tick
            ping_timer.tick().await;

            loop {
                ping_timer.tick().await;

                if handle.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                    break;
                }

                match timeout(pong_timeout, pong_rx.recv()).await {
                    Ok(Some(())) => {}
                    _ => {
                        tracing::warn!("Pong timeout, closing connection");
                        handle.close(1001, "Pong timeout");
                        break;
                    }
                }
            }
        })
    };

    loop {
        // Shutdown wins over frames already buffered on a superseded socket
        let next = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!(user_id = %user_id, connection_id, "Connection closed by server");
                    break;
                }
                continue;
            }
            next = ws_receiver.next() => next,
        };

        match next {
            Some(Ok(msg)) => match msg {
                Message::Text(_) | Message::Binary(_) => {
                    if !relay(&state, user_id, msg).await {
                        break;
                    }
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = handle.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                let err = RelayError::Transport(e.to_string());
                tracing::warn!(
                    user_id = %user_id,
                    error = %err,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(user_id = %user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Unregister first so no new frames are routed here, then let the writer
    // flush whatever is queued (a supersede close frame, typically).
    drop(registration);
    ping_handle.abort();
    handle.close(1000, "Session ended");
    drop(handle);
    drop(tx);

    if timeout(state.session.close_grace(), &mut writer_handle)
        .await
        .is_err()
    {
        writer_handle.abort();
    }

    tracing::info!(
        user_id = %user_id,
        connection_id,
        "WebSocket session stopped"
    );
}

/// Relay one data frame. Returns false only when the session must stop;
/// recoverable failures are logged and absorbed.
async fn relay(state: &AppState, user_id: UserId, frame: Message) -> bool {
    match protocol::relay_frame(state, user_id, frame).await {
        Ok(RelayOutcome::Delivered(message_id)) => {
            tracing::debug!(user_id = %user_id, message_id, "Message delivered");
        }
        Ok(RelayOutcome::Stored(message_id)) => {
            tracing::debug!(
                user_id = %user_id,
                message_id,
                "Receiver not connected, message stored only"
            );
        }
        Err(e @ RelayError::Decode(_)) => {
            tracing::debug!(user_id = %user_id, error = %e, "Ignoring malformed frame");
        }
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Message not relayed");
            return !e.is_fatal();
        }
    }
    true
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
/// Stops after a close frame has been written.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = ws_sender.close().await;
}

/// Close frame for a rejected handshake.
pub fn rejection_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
