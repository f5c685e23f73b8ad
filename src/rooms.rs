//! Conversation room membership
//!
//! A room is a conversation's logical channel; a connection joins it while
//! the client has that conversation open on screen. The delivery engine uses
//! membership to distinguish an actively-viewing recipient from one who is
//! merely online.

use dashmap::DashMap;
use std::collections::HashSet;

pub struct RoomMembership {
    /// Map of room_id -> connection ids currently joined
    rooms: DashMap<String, HashSet<String>>,
    /// Map of conn_id -> rooms the connection is joined to
    joined: DashMap<String, HashSet<String>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            joined: DashMap::new(),
        }
    }

    pub fn join(&self, conn_id: &str, room_id: &str) {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(HashSet::new)
            .insert(conn_id.to_string());
        self.joined
            .entry(conn_id.to_string())
            .or_insert_with(HashSet::new)
            .insert(room_id.to_string());
    }

    pub fn leave(&self, conn_id: &str, room_id: &str) {
        if let Some(mut members) = self.rooms.get_mut(room_id) {
            members.remove(conn_id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(room_id);
            }
        }
        if let Some(mut rooms) = self.joined.get_mut(conn_id) {
            rooms.remove(room_id);
        }
    }

    /// Drop every membership held by a connection (disconnect cleanup)
    pub fn leave_all(&self, conn_id: &str) {
        if let Some((_, rooms)) = self.joined.remove(conn_id) {
            for room_id in rooms {
                if let Some(mut members) = self.rooms.get_mut(&room_id) {
                    members.remove(conn_id);
                    if members.is_empty() {
                        drop(members);
                        self.rooms.remove(&room_id);
                    }
                }
            }
        }
    }

    pub fn is_member(&self, conn_id: &str, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|members| members.contains(conn_id))
            .unwrap_or(false)
    }

    pub fn members_of(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for RoomMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_leave() {
        let rooms = RoomMembership::new();

        rooms.join("conn1", "room1");
        rooms.join("conn2", "room1");
        assert!(rooms.is_member("conn1", "room1"));
        assert_eq!(rooms.members_of("room1").len(), 2);

        rooms.leave("conn1", "room1");
        assert!(!rooms.is_member("conn1", "room1"));
        assert!(rooms.is_member("conn2", "room1"));
    }

    #[test]
    fn test_leave_all_clears_every_room() {
        let rooms = RoomMembership::new();

        rooms.join("conn1", "room1");
        rooms.join("conn1", "room2");
        rooms.join("conn2", "room2");

        rooms.leave_all("conn1");
        assert!(!rooms.is_member("conn1", "room1"));
        assert!(!rooms.is_member("conn1", "room2"));
        assert!(rooms.is_member("conn2", "room2"));
        assert!(rooms.members_of("room1").is_empty());
    }
}
