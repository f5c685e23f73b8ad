//! Delivery engine
//!
//! On send, the single recipient of a two-party conversation is classified as
//! actively viewing, online, or offline, and receipts, unread counters,
//! pushes and notifications follow from that classification. Receipt state
//! only ever moves forward: pending -> delivered -> read.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::DeliveryConfig;
use crate::error::{AppError, Result};
use crate::models::*;
use crate::notify::Notifier;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomMembership;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq)]
enum RecipientState {
    /// A live connection is joined to the conversation's room
    Viewing,
    /// Connected somewhere, but not looking at this conversation
    Online,
    Offline,
}

pub struct DeliveryEngine {
    store: Arc<Store>,
    presence: Arc<PresenceRegistry>,
    rooms: Arc<RoomMembership>,
    notifier: Arc<Notifier>,
    sweep_lookback: Duration,
    sweep_batch: u32,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<Store>,
        presence: Arc<PresenceRegistry>,
        rooms: Arc<RoomMembership>,
        notifier: Arc<Notifier>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            store,
            presence,
            rooms,
            notifier,
            sweep_lookback: Duration::hours(config.sweep_lookback_hours as i64),
            sweep_batch: config.sweep_batch_size,
        }
    }

    fn classify(&self, user_id: &str, conversation_id: &str) -> RecipientState {
        let connections = self.presence.connection_ids(user_id);
        if connections.is_empty() {
            RecipientState::Offline
        } else if connections.iter().any(|c| self.rooms.is_member(c, conversation_id)) {
            RecipientState::Viewing
        } else {
            RecipientState::Online
        }
    }

    /// Persist a new text message and apply the recipient's classification.
    /// The message exists before any receipt is computed against it; a
    /// connection opening or closing between classification and persistence
    /// is tolerated and self-corrects via the reconciliation sweep.
    pub async fn send_message(
        &self,
        conversation: &Conversation,
        sender_id: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<Message> {
        if body.trim().is_empty() && attachments.is_empty() {
            return Err(AppError::EmptyMessage);
        }

        let recipient = conversation.other_participant(sender_id).to_string();
        let conversation_id = conversation.conversation_id.as_str();
        let state = self.classify(&recipient, conversation_id);

        let (delivered_to, read_by) = match state {
            RecipientState::Viewing => (vec![recipient.clone()], vec![recipient.clone()]),
            RecipientState::Online => (vec![recipient.clone()], Vec::new()),
            RecipientState::Offline => (Vec::new(), Vec::new()),
        };

        let message = self
            .store
            .create_message(
                conversation_id,
                sender_id,
                body,
                attachments,
                MessageKind::Text,
                None,
                &delivered_to,
                &read_by,
            )
            .await?;

        match state {
            RecipientState::Viewing => {
                self.store.reset_unread(conversation_id, &recipient).await?;
                self.presence
                    .send_to_user(&recipient, &ServerEvent::NewMessage(message.clone()));
                self.presence.send_to_user(
                    sender_id,
                    &ServerEvent::MessageRead {
                        conversation_id: conversation_id.to_string(),
                        reader_id: recipient.clone(),
                    },
                );
            }
            RecipientState::Online => {
                self.store.increment_unread(conversation_id, &recipient).await?;
                self.presence
                    .send_to_user(&recipient, &ServerEvent::NewMessage(message.clone()));
                self.presence.send_to_user(
                    sender_id,
                    &ServerEvent::MessageDelivered {
                        conversation_id: conversation_id.to_string(),
                        message_ids: vec![message.message_id.clone()],
                        user_id: recipient.clone(),
                    },
                );
                self.notify_new_message(&recipient, sender_id, &message).await;
            }
            RecipientState::Offline => {
                self.store.increment_unread(conversation_id, &recipient).await?;
                self.notify_new_message(&recipient, sender_id, &message).await;
            }
        }

        self.store
            .touch_last_message(conversation_id, &message.message_id, message.created_at)
            .await?;
        self.broadcast_conversation_updated(conversation);

        Ok(message)
    }

    async fn notify_new_message(&self, recipient: &str, sender_id: &str, message: &Message) {
        let preview = if message.body.is_empty() {
            "sent you an attachment".to_string()
        } else {
            format!("sent you a message: {}", truncate(&message.body, 80))
        };
        let link = format!("/messages/{}", message.conversation_id);

        self.notifier
            .notify(recipient, sender_id, "message", &preview, Some(&link))
            .await;
    }

    /// Reconciliation sweep, run on every new connection: mark pending
    /// undelivered messages as delivered and tell the original senders, in
    /// batches grouped by (sender, conversation). Bounded by the lookback
    /// window and batch size so an old account cannot trigger an unbounded
    /// backfill.
    pub async fn reconcile_on_connect(&self, user_id: &str) {
        let since = Utc::now() - self.sweep_lookback;
        let pending = match self.store.undelivered_for(user_id, since, self.sweep_batch).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!("Reconciliation sweep failed for {}: {}", user_id, e);
                return;
            }
        };

        if pending.is_empty() {
            return;
        }

        let ids: Vec<String> = pending.iter().map(|m| m.message_id.clone()).collect();
        if let Err(e) = self.store.mark_delivered(&ids, user_id).await {
            tracing::warn!("Failed to mark {} messages delivered for {}: {}", ids.len(), user_id, e);
            return;
        }

        let mut groups: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for message in &pending {
            groups
                .entry((message.sender_id.clone(), message.conversation_id.clone()))
                .or_default()
                .push(message.message_id.clone());
        }

        for ((sender_id, conversation_id), message_ids) in groups {
            self.presence.send_to_user(
                &sender_id,
                &ServerEvent::MessageDelivered {
                    conversation_id,
                    message_ids,
                    user_id: user_id.to_string(),
                },
            );
        }

        tracing::debug!("Reconciled {} undelivered messages for {}", ids.len(), user_id);
    }

    /// Mark every message from the other participant as read and zero the
    /// reader's unread counter.
    pub async fn mark_read(&self, conversation: &Conversation, user_id: &str) -> Result<()> {
        let conversation_id = conversation.conversation_id.as_str();

        self.store.mark_conversation_read(conversation_id, user_id).await?;
        self.store.reset_unread(conversation_id, user_id).await?;

        let other = conversation.other_participant(user_id);
        self.presence.send_to_user(
            other,
            &ServerEvent::MessageRead {
                conversation_id: conversation_id.to_string(),
                reader_id: user_id.to_string(),
            },
        );
        self.broadcast_conversation_updated(conversation);

        Ok(())
    }

    /// Clear-for-me: moves the caller's visibility floor to now and zeroes
    /// their unread counter. The other participant's view and the message
    /// rows are untouched.
    pub async fn clear_conversation(&self, conversation: &Conversation, user_id: &str) -> Result<()> {
        let conversation_id = conversation.conversation_id.as_str();

        self.store.set_cleared_at(conversation_id, user_id, Utc::now()).await?;
        self.store.reset_unread(conversation_id, user_id).await?;

        Ok(())
    }

    pub fn broadcast_conversation_updated(&self, conversation: &Conversation) {
        let event = ServerEvent::ConversationUpdated {
            conversation_id: conversation.conversation_id.clone(),
        };
        self.presence.send_to_user(&conversation.participant_a, &event);
        self.presence.send_to_user(&conversation.participant_b, &event);
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
