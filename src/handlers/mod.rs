//! HTTP and WebSocket request handlers

pub mod conversations;
pub mod health;
pub mod messages;
pub mod websocket;

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
};

use crate::{
    error::{AppError, Result},
    models::Conversation,
    AppState,
};

/// Header installed by the authentication gateway in front of this service.
/// The gateway verifies the caller's identity; this core trusts what it is
/// handed.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated user context extracted from request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .ok_or(AppError::Unauthorized)?;

        Ok(AuthUser {
            user_id: user_id.to_string(),
        })
    }
}

/// Load a conversation and reject callers who are not a participant.
/// Unknown conversation and non-membership are distinct failures.
pub(crate) async fn fetch_conversation_for(
    state: &AppState,
    conversation_id: &str,
    user_id: &str,
) -> Result<Conversation> {
    let conversation = state
        .store
        .find_conversation(conversation_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("conversation {}", conversation_id)))?;

    if !conversation.is_participant(user_id) {
        return Err(AppError::NotParticipant);
    }

    Ok(conversation)
}
