//! Presence registry for the Pulse real-time core
//!
//! Process-local bookkeeping of live connections. Nothing here is persisted;
//! a restart loses all presence state and clients re-establish it on
//! reconnect.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::models::ServerEvent;

/// Represents an active client connection
#[derive(Clone)]
pub struct Connection {
    pub conn_id: String,
    pub sender: mpsc::UnboundedSender<ServerEvent>,
}

/// Tracks which users have live connections
pub struct PresenceRegistry {
    /// Map of user_id -> Vec<Connection> (multiple connections per user)
    connections: DashMap<String, Vec<Connection>>,
    /// Stamped when a user's connection set empties
    last_seen: DashMap<String, DateTime<Utc>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            last_seen: DashMap::new(),
        }
    }

    /// Register a new connection, creating the user's record if absent
    pub fn mark_online(&self, user_id: &str, conn_id: &str, sender: mpsc::UnboundedSender<ServerEvent>) {
        let connection = Connection {
            conn_id: conn_id.to_string(),
            sender,
        };

        self.connections
            .entry(user_id.to_string())
            .or_insert_with(Vec::new)
            .push(connection);

        tracing::info!("Connection registered: user={}, conn={}", user_id, conn_id);
    }

    /// Remove a connection. Returns the last-seen instant when this was the
    /// user's final connection, i.e. the user just went offline.
    pub fn mark_offline(&self, user_id: &str, conn_id: &str) -> Option<DateTime<Utc>> {
        let mut went_offline = false;

        if let Some(mut connections) = self.connections.get_mut(user_id) {
            connections.retain(|c| c.conn_id != conn_id);
            if connections.is_empty() {
                drop(connections);
                self.connections.remove(user_id);
                went_offline = true;
            }
        }

        tracing::info!("Connection unregistered: user={}, conn={}", user_id, conn_id);

        if went_offline {
            let now = Utc::now();
            self.last_seen.insert(user_id.to_string(), now);
            Some(now)
        } else {
            None
        }
    }

    /// Check if a user is online (has any active connections)
    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.get(user_id).map(|c| !c.is_empty()).unwrap_or(false)
    }

    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(user_id).map(|e| *e.value())
    }

    /// Get all connection ids for a user
    pub fn connection_ids(&self, user_id: &str) -> Vec<String> {
        self.connections
            .get(user_id)
            .map(|connections| connections.iter().map(|c| c.conn_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Get all online user IDs
    pub fn online_users(&self) -> Vec<String> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Send an event to a specific user (all connections). Transport failures
    /// are logged and swallowed; persisted state is the source of truth.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        if let Some(connections) = self.connections.get(user_id) {
            for conn in connections.iter() {
                if let Err(e) = conn.sender.send(event.clone()) {
                    tracing::warn!("Failed to send to connection {}: {}", conn.conn_id, e);
                }
            }
        }
    }

    /// Broadcast an event to every online user except `exclude_user_id`
    pub fn broadcast_except(&self, exclude_user_id: &str, event: &ServerEvent) {
        for entry in self.connections.iter() {
            if entry.key() != exclude_user_id {
                for conn in entry.value().iter() {
                    if let Err(e) = conn.sender.send(event.clone()) {
                        tracing::warn!("Failed to send to connection {}: {}", conn.conn_id, e);
                    }
                }
            }
        }
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_management() {
        let registry = PresenceRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.mark_online("user1", "conn1", tx.clone());
        assert!(registry.is_online("user1"));
        assert!(!registry.is_online("user2"));

        // Second connection for the same user
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.mark_online("user1", "conn2", tx2);
        assert_eq!(registry.connection_ids("user1").len(), 2);

        // Dropping one connection keeps the user online
        assert!(registry.mark_offline("user1", "conn1").is_none());
        assert!(registry.is_online("user1"));
        assert_eq!(registry.connection_ids("user1").len(), 1);

        // Dropping the last connection stamps last-seen
        let last_seen = registry.mark_offline("user1", "conn2");
        assert!(last_seen.is_some());
        assert!(!registry.is_online("user1"));
        assert_eq!(registry.last_seen("user1"), last_seen);
    }

    #[test]
    fn test_send_to_user_delivers_to_all_connections() {
        let registry = PresenceRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        registry.mark_online("user1", "conn1", tx1);
        registry.mark_online("user1", "conn2", tx2);

        registry.send_to_user("user1", &ServerEvent::Pong);
        assert!(matches!(rx1.try_recv(), Ok(ServerEvent::Pong)));
        assert!(matches!(rx2.try_recv(), Ok(ServerEvent::Pong)));
    }

    #[test]
    fn test_broadcast_except_skips_origin() {
        let registry = PresenceRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        registry.mark_online("user1", "conn1", tx1);
        registry.mark_online("user2", "conn2", tx2);

        registry.broadcast_except("user1", &ServerEvent::Pong);
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(ServerEvent::Pong)));
    }
}
