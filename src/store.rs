//! Database storage layer for the Pulse real-time core
//!
//! Conversations, messages and notifications live in SQLite. Set-valued
//! message columns (delivered-to, read-by, deleted-for, attachments) are JSON
//! text; receipt updates only ever append to the sets, which is what makes
//! receipt state monotonic.

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    ConnectOptions, Pool, Sqlite,
};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::*;

pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn new(database_path: &str) -> anyhow::Result<Self> {
        // Ensure directory exists
        if let Some(parent) = Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", database_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        Ok(store)
    }

    /// In-memory store for tests. A shared-cache in-memory database with a
    /// pinned connection keeps every query on the same ephemeral database,
    /// even when the pool recycles its connection mid-test.
    pub async fn in_memory() -> anyhow::Result<Self> {
        // A named shared-cache in-memory database is shared across every
        // connection to the same name; a bare `:memory:` gives each connection
        // its own private database. The name is unique per store so parallel
        // tests stay isolated from one another.
        //
        // SQLite destroys a shared-cache in-memory database the moment its last
        // connection closes. A pool recycles connections underneath us, which
        // can briefly drop to zero open connections mid-test and wipe the
        // schema. Pin one standalone connection open for the whole test process
        // (deliberately leaked) so the database can never be destroyed while
        // tests run against it.
        let url = format!(
            "sqlite:file:pulse_mem_{}?mode=memory&cache=shared",
            Uuid::new_v4()
        );
        let guard = SqliteConnectOptions::from_str(&url)?.connect().await?;
        std::mem::forget(guard);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(SqliteConnectOptions::from_str(&url)?)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        Ok(store)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                participant_key TEXT NOT NULL UNIQUE,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                last_message_id TEXT,
                unread_a INTEGER NOT NULL DEFAULT 0,
                unread_b INTEGER NOT NULL DEFAULT 0,
                cleared_at_a TEXT,
                cleared_at_b TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                attachments TEXT NOT NULL DEFAULT '[]',
                kind TEXT NOT NULL DEFAULT 'text',
                call_info TEXT,
                delivered_to TEXT NOT NULL DEFAULT '[]',
                read_by TEXT NOT NULL DEFAULT '[]',
                deleted_for TEXT NOT NULL DEFAULT '[]',
                deleted INTEGER NOT NULL DEFAULT 0,
                edited_at TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(conversation_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS notifications (
                notification_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                link TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_a ON conversations(participant_a);
            CREATE INDEX IF NOT EXISTS idx_conversations_b ON conversations(participant_b);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Conversation Operations
    // ========================================================================

    /// Find or create the conversation for a participant pair. Concurrent
    /// creation attempts converge on one row via the unique participant key:
    /// the insert is a no-op on conflict and the lookup returns the winner.
    pub async fn find_or_create_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> anyhow::Result<Conversation> {
        let key = participant_key(user_a, user_b);
        let (first, second) = if user_a <= user_b { (user_a, user_b) } else { (user_b, user_a) };
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO conversations
             (conversation_id, participant_key, participant_a, participant_b, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(participant_key) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&key)
        .bind(first)
        .bind(second)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_conversation_by_key(&key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("conversation vanished after upsert: {}", key))
    }

    pub async fn find_conversation(&self, conversation_id: &str) -> anyhow::Result<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT conversation_id, participant_key, participant_a, participant_b,
                    last_message_id, unread_a, unread_b, cleared_at_a, cleared_at_b,
                    created_at, updated_at
             FROM conversations WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conversation)
    }

    pub async fn find_conversation_by_key(&self, key: &str) -> anyhow::Result<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT conversation_id, participant_key, participant_a, participant_b,
                    last_message_id, unread_a, unread_b, cleared_at_a, cleared_at_b,
                    created_at, updated_at
             FROM conversations WHERE participant_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conversation)
    }

    pub async fn conversations_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Conversation>> {
        let conversations = sqlx::query_as::<_, Conversation>(
            "SELECT conversation_id, participant_key, participant_a, participant_b,
                    last_message_id, unread_a, unread_b, cleared_at_a, cleared_at_b,
                    created_at, updated_at
             FROM conversations
             WHERE participant_a = ? OR participant_b = ?
             ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(conversations)
    }

    pub async fn touch_last_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE conversations SET last_message_id = ?, updated_at = ? WHERE conversation_id = ?",
        )
        .bind(message_id)
        .bind(at)
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn increment_unread(&self, conversation_id: &str, user_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE conversations SET
                unread_a = unread_a + (CASE WHEN participant_a = ? THEN 1 ELSE 0 END),
                unread_b = unread_b + (CASE WHEN participant_b = ? THEN 1 ELSE 0 END)
             WHERE conversation_id = ?",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn reset_unread(&self, conversation_id: &str, user_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE conversations SET
                unread_a = (CASE WHEN participant_a = ? THEN 0 ELSE unread_a END),
                unread_b = (CASE WHEN participant_b = ? THEN 0 ELSE unread_b END)
             WHERE conversation_id = ?",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_cleared_at(
        &self,
        conversation_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE conversations SET
                cleared_at_a = (CASE WHEN participant_a = ? THEN ? ELSE cleared_at_a END),
                cleared_at_b = (CASE WHEN participant_b = ? THEN ? ELSE cleared_at_b END)
             WHERE conversation_id = ?",
        )
        .bind(user_id)
        .bind(at)
        .bind(user_id)
        .bind(at)
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Message Operations
    // ========================================================================

    /// Persist a new message. The creation timestamp is assigned here, at
    /// persistence time, so racing sends order by whichever write lands
    /// first.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
        attachments: &[Attachment],
        kind: MessageKind,
        call_info: Option<&CallInfo>,
        delivered_to: &[String],
        read_by: &[String],
    ) -> anyhow::Result<Message> {
        let message_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let attachments_json = serde_json::to_string(attachments)?;
        let call_info_json = call_info.map(serde_json::to_string).transpose()?;
        let delivered_json = serde_json::to_string(delivered_to)?;
        let read_json = serde_json::to_string(read_by)?;

        sqlx::query(
            "INSERT INTO messages
             (message_id, conversation_id, sender_id, body, attachments, kind, call_info,
              delivered_to, read_by, deleted_for, deleted, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '[]', 0, ?)",
        )
        .bind(&message_id)
        .bind(conversation_id)
        .bind(sender_id)
        .bind(body)
        .bind(&attachments_json)
        .bind(kind.as_str())
        .bind(&call_info_json)
        .bind(&delivered_json)
        .bind(&read_json)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(Message {
            message_id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            attachments: attachments.to_vec(),
            kind,
            call_info: call_info.cloned(),
            delivered_to: delivered_to.to_vec(),
            read_by: read_by.to_vec(),
            deleted_for: Vec::new(),
            deleted: false,
            edited_at: None,
            created_at,
        })
    }

    pub async fn find_message(&self, message_id: &str) -> anyhow::Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT message_id, conversation_id, sender_id, body, attachments, kind, call_info,
                    delivered_to, read_by, deleted_for, deleted, edited_at, created_at
             FROM messages WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Message::from))
    }

    /// Page of history before a cursor message, oldest first. Messages at or
    /// below the caller's cleared-at floor and messages the caller locally
    /// deleted are excluded; globally deleted rows stay in place as
    /// tombstones.
    pub async fn messages_before(
        &self,
        conversation_id: &str,
        user_id: &str,
        cleared_floor: Option<DateTime<Utc>>,
        before: Option<&str>,
        limit: u32,
    ) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT message_id, conversation_id, sender_id, body, attachments, kind, call_info,
                    delivered_to, read_by, deleted_for, deleted, edited_at, created_at
             FROM messages
             WHERE conversation_id = ?
               AND (? IS NULL OR created_at > ?)
               AND NOT EXISTS (SELECT 1 FROM json_each(messages.deleted_for) WHERE json_each.value = ?)
               AND (? IS NULL OR created_at < (SELECT created_at FROM messages WHERE message_id = ?))
             ORDER BY created_at DESC
             LIMIT ?",
        )
        .bind(conversation_id)
        .bind(cleared_floor)
        .bind(cleared_floor)
        .bind(user_id)
        .bind(before)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows.into_iter().map(Message::from).collect();
        messages.reverse();
        Ok(messages)
    }

    /// Add a user to the delivered-to set of each message. Append-only.
    pub async fn mark_delivered(&self, message_ids: &[String], user_id: &str) -> anyhow::Result<()> {
        for message_id in message_ids {
            sqlx::query(
                "UPDATE messages SET delivered_to = json_insert(delivered_to, '$[#]', ?)
                 WHERE message_id = ?
                   AND NOT EXISTS (SELECT 1 FROM json_each(messages.delivered_to) WHERE json_each.value = ?)",
            )
            .bind(user_id)
            .bind(message_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Add the reader to the read-by set of every message in the conversation
    /// sent by someone else. Append-only.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET read_by = json_insert(read_by, '$[#]', ?)
             WHERE conversation_id = ? AND sender_id != ?
               AND NOT EXISTS (SELECT 1 FROM json_each(messages.read_by) WHERE json_each.value = ?)",
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(user_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Messages addressed to the user that never got a delivery receipt,
    /// bounded by a lookback window and batch size.
    pub async fn undelivered_for(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT m.message_id, m.conversation_id, m.sender_id, m.body, m.attachments, m.kind,
                    m.call_info, m.delivered_to, m.read_by, m.deleted_for, m.deleted, m.edited_at,
                    m.created_at
             FROM messages m
             JOIN conversations c ON c.conversation_id = m.conversation_id
             WHERE (c.participant_a = ? OR c.participant_b = ?)
               AND m.sender_id != ?
               AND m.deleted = 0
               AND m.created_at > ?
               AND NOT EXISTS (SELECT 1 FROM json_each(m.delivered_to) WHERE json_each.value = ?)
             ORDER BY m.created_at ASC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(since)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    pub async fn edit_message(
        &self,
        message_id: &str,
        body: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE messages SET body = ?, edited_at = ? WHERE message_id = ?")
            .bind(body)
            .bind(at)
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Hide a message from one participant's view only.
    pub async fn delete_for_user(&self, message_id: &str, user_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE messages SET deleted_for = json_insert(deleted_for, '$[#]', ?)
             WHERE message_id = ?
               AND NOT EXISTS (SELECT 1 FROM json_each(messages.deleted_for) WHERE json_each.value = ?)",
        )
        .bind(user_id)
        .bind(message_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Strip content and flag the row. The row stays so history positions
    /// around it do not shift.
    pub async fn delete_for_everyone(&self, message_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE messages SET body = '', attachments = '[]', deleted = 1 WHERE message_id = ?",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Notification Operations
    // ========================================================================

    pub async fn create_notification(
        &self,
        user_id: &str,
        actor_id: &str,
        kind: &str,
        body: &str,
        link: Option<&str>,
    ) -> anyhow::Result<Notification> {
        let notification_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();

        sqlx::query(
            "INSERT INTO notifications (notification_id, user_id, actor_id, kind, body, link, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&notification_id)
        .bind(user_id)
        .bind(actor_id)
        .bind(kind)
        .bind(body)
        .bind(link)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(Notification {
            notification_id,
            user_id: user_id.to_string(),
            actor_id: actor_id.to_string(),
            kind: kind.to_string(),
            body: body.to_string(),
            link: link.map(|s| s.to_string()),
            created_at,
        })
    }

    pub async fn notifications_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Notification>> {
        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT notification_id, user_id, actor_id, kind, body, link, created_at
             FROM notifications WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }
}
