//! Conversation handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::{
    error::{AppError, Result},
    models::*,
    AppState,
};

use super::{fetch_conversation_for, AuthUser};

/// List the caller's conversations, most recently active first
pub async fn list_conversations(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<ConversationSummary>>> {
    let conversations = state.store.conversations_for_user(&auth.user_id).await?;

    let mut summaries = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let last_message = match conversation.last_message_id.as_deref() {
            Some(message_id) => state.store.find_message(message_id).await?,
            None => None,
        };
        summaries.push(ConversationSummary {
            peer_id: conversation.other_participant(&auth.user_id).to_string(),
            unread: conversation.unread_for(&auth.user_id),
            last_message,
            updated_at: conversation.updated_at,
            conversation_id: conversation.conversation_id,
        });
    }

    Ok(Json(summaries))
}

/// Find or create the conversation with a peer. Idempotent: concurrent opens
/// for the same pair converge on one record.
pub async fn open_conversation(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<OpenConversationRequest>,
) -> Result<Json<Conversation>> {
    let peer_id = req.peer_id.trim();
    if peer_id.is_empty() {
        return Err(AppError::BadRequest("peer_id is required".to_string()));
    }
    if peer_id == auth.user_id {
        return Err(AppError::BadRequest("cannot open a conversation with yourself".to_string()));
    }

    let conversation = state
        .store
        .find_or_create_conversation(&auth.user_id, peer_id)
        .await?;

    Ok(Json(conversation))
}

/// Page of message history before a cursor, oldest first, respecting the
/// caller's cleared-at floor and local deletions.
pub async fn get_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>> {
    let conversation = fetch_conversation_for(&state, &conversation_id, &auth.user_id).await?;

    let limit = query.limit.unwrap_or(50).min(200);
    let messages = state
        .store
        .messages_before(
            &conversation.conversation_id,
            &auth.user_id,
            conversation.cleared_at_for(&auth.user_id),
            query.before.as_deref(),
            limit,
        )
        .await?;

    Ok(Json(messages))
}

/// Mark everything from the other participant as read
pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let conversation = fetch_conversation_for(&state, &conversation_id, &auth.user_id).await?;
    state.delivery.mark_read(&conversation, &auth.user_id).await?;

    Ok(Json(serde_json::json!({ "success": true })))
}

/// Clear the conversation for the caller only
pub async fn clear_conversation(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let conversation = fetch_conversation_for(&state, &conversation_id, &auth.user_id).await?;
    state.delivery.clear_conversation(&conversation, &auth.user_id).await?;

    Ok(Json(serde_json::json!({ "success": true })))
}
