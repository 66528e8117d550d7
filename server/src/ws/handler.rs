use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;

use crate::error::{CredentialError, RelayError};
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for WebSocket connection.
#[derive(Debug, Default, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// WebSocket close codes for a rejected handshake.
pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
pub const CLOSE_TOKEN_INVALID: u16 = 4002;

/// GET /ws?token=JWT
/// WebSocket upgrade endpoint. Authenticates via query parameter, falling back
/// to an `Authorization: Bearer` header for clients that can set one.
/// On auth failure, upgrades then immediately closes with the matching close code.
/// On success, runs the relay session for the connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ws = ws.max_message_size(state.session.max_message_bytes);

    let credential = params.token.or_else(|| {
        headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    });

    let verified = match credential {
        Some(token) => state.verifier.verify(&token),
        None => Err(CredentialError::Invalid("no credential supplied".to_string())),
    };

    match verified {
        Ok(user_id) => {
            tracing::info!(user_id = %user_id, "WebSocket connection authenticated");
            ws.on_upgrade(move |socket| actor::run_connection(socket, state, user_id))
        }
        Err(err) => {
            let (close_code, reason) = match err {
                CredentialError::Expired => (CLOSE_TOKEN_EXPIRED, "Token expired"),
                CredentialError::Invalid(_) => (CLOSE_TOKEN_INVALID, "Token invalid"),
            };

            let err = RelayError::from(err);
            tracing::warn!(
                close_code = close_code,
                error = %err,
                "WebSocket auth failed"
            );

            // Upgrade the connection, then immediately close with the error code
            ws.on_upgrade(move |mut socket| async move {
                let _ = socket
                    .send(actor::rejection_frame(close_code, reason))
                    .await;
            })
        }
    }
}
