//! Data models for the Pulse real-time core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Conversation Models
// ============================================================================

/// Two-party conversation. `participant_a` is always the lexicographically
/// smaller id, so the pair maps to exactly one row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub conversation_id: String,
    pub participant_key: String,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_id: Option<String>,
    pub unread_a: i64,
    pub unread_b: i64,
    pub cleared_at_a: Option<DateTime<Utc>>,
    pub cleared_at_b: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    pub fn other_participant(&self, user_id: &str) -> &str {
        if self.participant_a == user_id {
            &self.participant_b
        } else {
            &self.participant_a
        }
    }

    pub fn unread_for(&self, user_id: &str) -> i64 {
        if self.participant_a == user_id {
            self.unread_a
        } else {
            self.unread_b
        }
    }

    pub fn cleared_at_for(&self, user_id: &str) -> Option<DateTime<Utc>> {
        if self.participant_a == user_id {
            self.cleared_at_a
        } else {
            self.cleared_at_b
        }
    }
}

/// Identity key for a participant pair, stable across argument order.
pub fn participant_key(a: &str, b: &str) -> String {
    let mut pair = [a, b];
    pair.sort();
    pair.join(":")
}

// ============================================================================
// Message Models
// ============================================================================

/// Raw database row. Set-valued columns are JSON text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub attachments: String,
    pub kind: String,
    pub call_info: Option<String>,
    pub delivered_to: String,
    pub read_by: String,
    pub deleted_for: String,
    pub deleted: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub kind: MessageKind,
    pub call_info: Option<CallInfo>,
    pub delivered_to: Vec<String>,
    pub read_by: Vec<String>,
    pub deleted_for: Vec<String>,
    pub deleted: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            message_id: row.message_id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            body: row.body,
            attachments: serde_json::from_str(&row.attachments).unwrap_or_default(),
            kind: row.kind.into(),
            call_info: row.call_info.as_deref().and_then(|s| serde_json::from_str(s).ok()),
            delivered_to: serde_json::from_str(&row.delivered_to).unwrap_or_default(),
            read_by: serde_json::from_str(&row.read_by).unwrap_or_default(),
            deleted_for: serde_json::from_str(&row.deleted_for).unwrap_or_default(),
            deleted: row.deleted,
            edited_at: row.edited_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Call,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Call => "call",
        }
    }
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "call" => MessageKind::Call,
            _ => MessageKind::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub location: String,
    pub mime: String,
    pub size: i64,
    pub original_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

// ============================================================================
// Call Models
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CallMedia {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Missed,
    Declined,
    Ended,
}

/// Summary persisted into the message history when a call terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    pub media: CallMedia,
    pub outcome: CallOutcome,
    pub initiated_by: String,
    pub received_by: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
}

// ============================================================================
// Notification Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub notification_id: String,
    pub user_id: String,
    pub actor_id: String,
    pub kind: String,
    pub body: String,
    pub link: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// WebSocket Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "join")]
    Join { conversation_id: String },

    #[serde(rename = "leave")]
    Leave { conversation_id: String },

    #[serde(rename = "typing")]
    Typing { conversation_id: String, is_typing: bool },

    #[serde(rename = "call_invite")]
    CallInvite { conversation_id: String, media: CallMedia },

    #[serde(rename = "call_answer")]
    CallAnswer { conversation_id: String, accept: bool },

    #[serde(rename = "call_signal")]
    CallSignal { conversation_id: String, payload: serde_json::Value },

    #[serde(rename = "call_end")]
    CallEnd { conversation_id: String },

    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "new_message")]
    NewMessage(Message),

    #[serde(rename = "message_edited")]
    MessageEdited(Message),

    #[serde(rename = "message_deleted")]
    MessageDeleted { conversation_id: String, message_id: String },

    #[serde(rename = "message_delivered")]
    MessageDelivered {
        conversation_id: String,
        message_ids: Vec<String>,
        user_id: String,
    },

    #[serde(rename = "message_read")]
    MessageRead { conversation_id: String, reader_id: String },

    #[serde(rename = "conversation_updated")]
    ConversationUpdated { conversation_id: String },

    #[serde(rename = "typing")]
    Typing {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },

    #[serde(rename = "presence")]
    Presence {
        user_id: String,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    },

    #[serde(rename = "online_users")]
    OnlineUsers { user_ids: Vec<String> },

    #[serde(rename = "call_invite")]
    CallInvite {
        conversation_id: String,
        from: String,
        media: CallMedia,
    },

    #[serde(rename = "call_answer")]
    CallAnswer {
        conversation_id: String,
        from: String,
        accept: bool,
    },

    #[serde(rename = "call_signal")]
    CallSignal {
        conversation_id: String,
        from: String,
        payload: serde_json::Value,
    },

    #[serde(rename = "call_end")]
    CallEnd { conversation_id: String },

    #[serde(rename = "notification")]
    Notification(Notification),

    #[serde(rename = "pong")]
    Pong,
}

// ============================================================================
// API Request/Response Models
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OpenConversationRequest {
    pub peer_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub peer_id: String,
    pub unread: i64,
    pub last_message: Option<Message>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub before: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeleteScope {
    Me,
    Everyone,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub scope: Option<DeleteScope>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_key_order_independent() {
        assert_eq!(participant_key("alice", "bob"), participant_key("bob", "alice"));
        assert_eq!(participant_key("alice", "bob"), "alice:bob");
    }

    #[test]
    fn test_client_event_tagging() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"join","payload":{"conversation_id":"c1"}}"#).unwrap();
        match event {
            ClientEvent::Join { conversation_id } => assert_eq!(conversation_id, "c1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_message_row_defaults_on_bad_json() {
        let row = MessageRow {
            message_id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "alice".to_string(),
            body: "hi".to_string(),
            attachments: "not-json".to_string(),
            kind: "text".to_string(),
            call_info: None,
            delivered_to: "[\"bob\"]".to_string(),
            read_by: "[]".to_string(),
            deleted_for: "[]".to_string(),
            deleted: false,
            edited_at: None,
            created_at: Utc::now(),
        };

        let message = Message::from(row);
        assert!(message.attachments.is_empty());
        assert_eq!(message.delivered_to, vec!["bob".to_string()]);
        assert_eq!(message.kind, MessageKind::Text);
    }
}
