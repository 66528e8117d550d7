use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};

use crate::db::models::UserId;
use crate::state::AppState;

/// The caller's identity, resolved from `Authorization: Bearer <token>`.
/// Implements axum's FromRequestParts for use as an extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let user_id = state.verifier.verify(token).map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer token");
            StatusCode::UNAUTHORIZED
        })?;

        Ok(AuthUser(user_id))
    }
}
