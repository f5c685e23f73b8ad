//! Message handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;

use crate::{
    error::{AppError, Result},
    models::*,
    AppState,
};

use super::{fetch_conversation_for, AuthUser};

/// Send a message into a conversation. Classification of the recipient and
/// all receipt/notification side effects happen in the delivery engine.
pub async fn send_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Message>> {
    let conversation = fetch_conversation_for(&state, &conversation_id, &auth.user_id).await?;

    let body = req.body.unwrap_or_default();
    let message = state
        .delivery
        .send_message(&conversation, &auth.user_id, body.trim(), &req.attachments)
        .await?;

    Ok(Json(message))
}

/// Edit a message body. Sender only; a globally deleted message cannot be
/// edited.
pub async fn edit_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<String>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<Message>> {
    let message = state
        .store
        .find_message(&message_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("message {}", message_id)))?;

    if message.sender_id != auth.user_id {
        return Err(AppError::Forbidden);
    }
    if message.deleted {
        return Err(AppError::BadRequest("message was deleted".to_string()));
    }
    let body = req.body.trim();
    if body.is_empty() {
        return Err(AppError::EmptyMessage);
    }

    state.store.edit_message(&message.message_id, body, Utc::now()).await?;
    let updated = state
        .store
        .find_message(&message.message_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("message {}", message_id)))?;

    if let Some(conversation) = state.store.find_conversation(&message.conversation_id).await? {
        let event = ServerEvent::MessageEdited(updated.clone());
        state.presence.send_to_user(&conversation.participant_a, &event);
        state.presence.send_to_user(&conversation.participant_b, &event);
    }

    Ok(Json(updated))
}

/// Delete a message for the caller only, or (sender only) for everyone.
/// Delete-for-everyone strips the content but keeps the row so history
/// positions do not shift.
pub async fn delete_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<serde_json::Value>> {
    let message = state
        .store
        .find_message(&message_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("message {}", message_id)))?;

    let conversation = state
        .store
        .find_conversation(&message.conversation_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("conversation {}", message.conversation_id)))?;
    if !conversation.is_participant(&auth.user_id) {
        return Err(AppError::NotParticipant);
    }

    match query.scope.unwrap_or(DeleteScope::Me) {
        DeleteScope::Me => {
            state.store.delete_for_user(&message.message_id, &auth.user_id).await?;
        }
        DeleteScope::Everyone => {
            if message.sender_id != auth.user_id {
                return Err(AppError::Forbidden);
            }
            state.store.delete_for_everyone(&message.message_id).await?;

            let event = ServerEvent::MessageDeleted {
                conversation_id: conversation.conversation_id.clone(),
                message_id: message.message_id.clone(),
            };
            state.presence.send_to_user(&conversation.participant_a, &event);
            state.presence.send_to_user(&conversation.participant_b, &event);
            state.delivery.broadcast_conversation_updated(&conversation);
        }
    }

    Ok(Json(serde_json::json!({ "success": true })))
}
