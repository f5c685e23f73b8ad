//! WebSocket handler: the real-time channel
//!
//! One task per connection. The connection registers with the presence
//! registry, gets the online roster, and has its missed delivery receipts
//! reconciled; after that it is a pump between the client and the event
//! channel the rest of the system pushes into.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{ClientEvent, ServerEvent},
    AppState,
};

use super::{fetch_conversation_for, AuthUser};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    auth: AuthUser,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, auth.user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for events destined to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let conn_id = Uuid::new_v4().to_string();

    // Task to forward events from the channel to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    // Presence: register, tell everyone else, hand this client the roster
    state.presence.mark_online(&user_id, &conn_id, tx.clone());
    state.presence.broadcast_except(
        &user_id,
        &ServerEvent::Presence {
            user_id: user_id.clone(),
            online: true,
            last_seen: None,
        },
    );
    let _ = tx.send(ServerEvent::OnlineUsers {
        user_ids: state.presence.online_users(),
    });

    // Deferred delivery receipts for everything sent while we were away
    state.delivery.reconcile_on_connect(&user_id).await;

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => handle_client_event(&state, &user_id, &conn_id, &tx, event).await,
                Err(e) => {
                    tracing::warn!("Failed to parse WebSocket event: {}", e);
                    let _ = tx.send(ServerEvent::Error {
                        code: "PARSE_ERROR".to_string(),
                        message: format!("Invalid event format: {}", e),
                    });
                }
            },
            Ok(Message::Binary(_)) => {
                // Binary frames not supported
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Handled by the WebSocket library
            }
            Ok(Message::Close(_)) => {
                break;
            }
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
        }
    }

    // Cleanup
    state.rooms.leave_all(&conn_id);
    if let Some(last_seen) = state.presence.mark_offline(&user_id, &conn_id) {
        // Last connection gone: the user is offline for real
        state.presence.broadcast_except(
            &user_id,
            &ServerEvent::Presence {
                user_id: user_id.clone(),
                online: false,
                last_seen: Some(last_seen),
            },
        );
        state.calls.handle_disconnect(&user_id).await;
    }

    send_task.abort();
}

async fn handle_client_event(
    state: &AppState,
    user_id: &str,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Join { conversation_id } => {
            match fetch_conversation_for(state, &conversation_id, user_id).await {
                Ok(_) => state.rooms.join(conn_id, &conversation_id),
                Err(e) => send_error(tx, &e),
            }
        }

        ClientEvent::Leave { conversation_id } => {
            state.rooms.leave(conn_id, &conversation_id);
        }

        ClientEvent::Typing { conversation_id, is_typing } => {
            // Relayed to the other participant only, never persisted
            if let Ok(conversation) = fetch_conversation_for(state, &conversation_id, user_id).await {
                state.presence.send_to_user(
                    conversation.other_participant(user_id),
                    &ServerEvent::Typing {
                        conversation_id,
                        user_id: user_id.to_string(),
                        is_typing,
                    },
                );
            }
        }

        ClientEvent::CallInvite { conversation_id, media } => {
            if let Err(e) = state.calls.invite(user_id, &conversation_id, media).await {
                send_error(tx, &e);
            }
        }

        ClientEvent::CallAnswer { conversation_id, accept } => {
            state.calls.answer(user_id, &conversation_id, accept).await;
        }

        ClientEvent::CallSignal { conversation_id, payload } => {
            if let Err(e) = state.calls.relay_signal(user_id, &conversation_id, payload).await {
                send_error(tx, &e);
            }
        }

        ClientEvent::CallEnd { conversation_id } => {
            state.calls.end(user_id, &conversation_id).await;
        }

        ClientEvent::Ping => {
            let _ = tx.send(ServerEvent::Pong);
        }
    }
}

fn send_error(tx: &mpsc::UnboundedSender<ServerEvent>, err: &AppError) {
    let _ = tx.send(ServerEvent::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    });
}
