//! Room and connection bookkeeping.
//!
//! The gateway is the exclusive owner of room membership; everything
//! here is plain data mutated under the gateway's lock.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use crate::protocol::ServerFrame;

/// Opaque connection identifier.
pub type ConnId = String;

/// One authenticated connection.
pub struct ConnectionEntry {
    pub user_id: String,
    /// Deployment ids this connection subscribes to.
    pub subscriptions: HashSet<String>,
    /// Unix timestamp (milliseconds) of the last client activity.
    pub last_activity_at: u64,
    /// Bounded send queue feeding the socket writer task.
    pub sender: mpsc::Sender<ServerFrame>,
}

/// Connection and room maps.
#[derive(Default)]
pub struct RoomRegistry {
    connections: HashMap<ConnId, ConnectionEntry>,
    /// room_id (= deployment_id) → member connection ids.
    rooms: HashMap<String, HashSet<ConnId>>,
}

impl RoomRegistry {
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_size(&self, deployment_id: &str) -> usize {
        self.rooms.get(deployment_id).map_or(0, HashSet::len)
    }

    pub fn subscription_count(&self, conn_id: &str) -> usize {
        self.connections
            .get(conn_id)
            .map_or(0, |c| c.subscriptions.len())
    }

    pub fn add_connection(
        &mut self,
        conn_id: &str,
        user_id: &str,
        sender: mpsc::Sender<ServerFrame>,
        now: u64,
    ) {
        self.connections.insert(
            conn_id.to_string(),
            ConnectionEntry {
                user_id: user_id.to_string(),
                subscriptions: HashSet::new(),
                last_activity_at: now,
                sender,
            },
        );
    }

    /// Remove a connection and its room memberships. Dropping the entry
    /// drops its sender, which ends the socket writer.
    pub fn remove_connection(&mut self, conn_id: &str) {
        if let Some(entry) = self.connections.remove(conn_id) {
            for deployment_id in entry.subscriptions {
                if let Some(members) = self.rooms.get_mut(&deployment_id) {
                    members.remove(conn_id);
                    if members.is_empty() {
                        self.rooms.remove(&deployment_id);
                    }
                }
            }
        }
    }

    /// Place a connection into a deployment's room.
    pub fn join(&mut self, conn_id: &str, deployment_id: &str) {
        if let Some(entry) = self.connections.get_mut(conn_id) {
            entry.subscriptions.insert(deployment_id.to_string());
            self.rooms
                .entry(deployment_id.to_string())
                .or_default()
                .insert(conn_id.to_string());
        }
    }

    /// Remove a connection from a room. Returns whether it was a member.
    pub fn leave(&mut self, conn_id: &str, deployment_id: &str) -> bool {
        let mut was_member = false;
        if let Some(entry) = self.connections.get_mut(conn_id) {
            was_member = entry.subscriptions.remove(deployment_id);
        }
        if let Some(members) = self.rooms.get_mut(deployment_id) {
            members.remove(conn_id);
            if members.is_empty() {
                self.rooms.remove(deployment_id);
            }
        }
        was_member
    }

    pub fn user_of(&self, conn_id: &str) -> Option<&str> {
        self.connections.get(conn_id).map(|c| c.user_id.as_str())
    }

    pub fn touch(&mut self, conn_id: &str, now: u64) {
        if let Some(entry) = self.connections.get_mut(conn_id) {
            entry.last_activity_at = now;
        }
    }

    /// Senders for every member of a room.
    pub fn room_senders(&self, deployment_id: &str) -> Vec<(ConnId, mpsc::Sender<ServerFrame>)> {
        let Some(members) = self.rooms.get(deployment_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| {
                self.connections
                    .get(id)
                    .map(|c| (id.clone(), c.sender.clone()))
            })
            .collect()
    }

    /// Connection ids idle since before `cutoff`.
    pub fn idle_connections(&self, cutoff: u64) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|(_, c)| c.last_activity_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::Sender<ServerFrame> {
        mpsc::channel(8).0
    }

    #[test]
    fn join_and_leave_restore_membership() {
        let mut registry = RoomRegistry::default();
        registry.add_connection("c1", "u1", sender(), 100);

        registry.join("c1", "d1");
        assert_eq!(registry.room_size("d1"), 1);
        assert_eq!(registry.subscription_count("c1"), 1);

        assert!(registry.leave("c1", "d1"));
        assert_eq!(registry.room_size("d1"), 0);
        assert_eq!(registry.subscription_count("c1"), 0);
        assert!(!registry.leave("c1", "d1"));
    }

    #[test]
    fn remove_connection_empties_rooms() {
        let mut registry = RoomRegistry::default();
        registry.add_connection("c1", "u1", sender(), 100);
        registry.add_connection("c2", "u2", sender(), 100);
        registry.join("c1", "d1");
        registry.join("c2", "d1");

        registry.remove_connection("c1");
        assert_eq!(registry.room_size("d1"), 1);
        assert_eq!(registry.connection_count(), 1);

        registry.remove_connection("c2");
        assert_eq!(registry.room_size("d1"), 0);
    }

    #[test]
    fn idle_connections_by_cutoff() {
        let mut registry = RoomRegistry::default();
        registry.add_connection("old", "u1", sender(), 100);
        registry.add_connection("fresh", "u2", sender(), 100);
        registry.touch("fresh", 1_000);

        let idle = registry.idle_connections(500);
        assert_eq!(idle, vec!["old".to_string()]);
    }

    #[test]
    fn room_senders_skip_unknown_members() {
        let mut registry = RoomRegistry::default();
        registry.add_connection("c1", "u1", sender(), 100);
        registry.join("c1", "d1");
        assert_eq!(registry.room_senders("d1").len(), 1);
        assert!(registry.room_senders("other").is_empty());
    }
}
