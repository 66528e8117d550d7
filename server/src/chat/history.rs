//! History endpoints: the conversation with one user, and the caller's
//! latest message per contact.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::auth::middleware::AuthUser;
use crate::db::models::{StoredMessage, UserId};
use crate::error::StoreError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ChatHistoryResponse {
    pub user_id: UserId,
    pub messages: Vec<StoredMessage>,
}

/// Latest message exchanged with one contact.
#[derive(Debug, Serialize)]
pub struct ChatSummary {
    pub contact_id: UserId,
    #[serde(flatten)]
    pub last_message: StoredMessage,
}

#[derive(Debug, Serialize)]
pub struct RecentChatsResponse {
    pub chats: Vec<ChatSummary>,
}

/// GET /api/chat/{id} -- Messages between the caller and user `id`, oldest first.
pub async fn get_chat_history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(other_id): Path<UserId>,
) -> Result<Json<ChatHistoryResponse>, StatusCode> {
    if other_id <= 0 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let store = state.store.clone();
    let messages = tokio::task::spawn_blocking(move || store.history(user_id, other_id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(internal)?;

    Ok(Json(ChatHistoryResponse {
        user_id: other_id,
        messages,
    }))
}

/// GET /api/messages -- The caller's most recent message per contact, newest first.
pub async fn get_recent_chats(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<RecentChatsResponse>, StatusCode> {
    let store = state.store.clone();
    let chats = tokio::task::spawn_blocking(move || store.recent_contacts(user_id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(internal)?;

    let chats = chats
        .into_iter()
        .map(|last_message| ChatSummary {
            contact_id: last_message.counterpart_of(user_id),
            last_message,
        })
        .collect();

    Ok(Json(RecentChatsResponse { chats }))
}

fn internal(e: StoreError) -> StatusCode {
    tracing::error!(error = %e, "History query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}
