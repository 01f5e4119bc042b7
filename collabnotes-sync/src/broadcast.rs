//! Fan-out broadcast to the other members of a document room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! member gets an independent receiver buffering up to `capacity` frames;
//! lagging members drop the oldest frames rather than stalling the room.
//! Frames are delivered to every subscriber including the sender — filtering
//! out the sender's own echoes happens in each connection's send loop, which
//! knows its own connection id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::auth::Identity;
use crate::protocol::{ProtocolError, WireMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_members: usize,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    /// Broadcast channel sender, shared by the room
    sender: broadcast::Sender<Arc<Vec<u8>>>,

    /// Connected members: connection id → resolved identity
    members: RwLock<HashMap<Uuid, Identity>>,

    /// Channel capacity (frames buffered per receiver)
    capacity: usize,

    /// Lock-free frame counter
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a member and return its receiver.
    pub async fn add_member(
        &self,
        connection_id: Uuid,
        identity: Identity,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut members = self.members.write().await;
        members.insert(connection_id, identity);
        self.sender.subscribe()
    }

    /// Remove a member. Returns its identity if it was registered.
    pub async fn remove_member(&self, connection_id: &Uuid) -> Option<Identity> {
        let mut members = self.members.write().await;
        members.remove(connection_id)
    }

    /// Broadcast a message to the room.
    ///
    /// The message is encoded once and shared; returns the number of
    /// receivers it reached. No lock is taken on this path.
    pub fn broadcast(&self, msg: &WireMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Current member count.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Identities of all current members.
    pub async fn members(&self) -> Vec<Identity> {
        self.members.read().await.values().cloned().collect()
    }

    /// Check whether a connection is registered.
    pub async fn has_member(&self, connection_id: &Uuid) -> bool {
        self.members.read().await.contains_key(connection_id)
    }

    /// Broadcast statistics snapshot.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    /// Channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a member (used by observers in tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> Identity {
        Identity {
            user_id: format!("user-{}", name.to_lowercase()),
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_remove_member() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();

        let _rx = group.add_member(conn, identity("Alice")).await;
        assert_eq!(group.member_count().await, 1);
        assert!(group.has_member(&conn).await);

        let removed = group.remove_member(&conn).await;
        assert_eq!(removed.unwrap().display_name, "Alice");
        assert_eq!(group.member_count().await, 0);
        assert!(!group.has_member(&conn).await);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_receivers() {
        let group = BroadcastGroup::new(16);

        let mut rx1 = group.add_member(Uuid::new_v4(), identity("Alice")).await;
        let mut rx2 = group.add_member(Uuid::new_v4(), identity("Bob")).await;
        let mut rx3 = group.add_member(Uuid::new_v4(), identity("Charlie")).await;

        let msg = WireMessage::update(Uuid::new_v4(), vec![1, 2, 3]);
        let count = group.broadcast(&msg).unwrap();

        // All 3 receivers get it (sender filtering is the send loop's job)
        assert_eq!(count, 3);
        let _ = rx1.recv().await.unwrap();
        let _ = rx2.recv().await.unwrap();
        let _ = rx3.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_raw_zero_copy() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.add_member(Uuid::new_v4(), identity("Alice")).await;

        let data = Arc::new(vec![10, 20, 30]);
        let count = group.broadcast_raw(data.clone());
        assert_eq!(count, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(*received, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();
        let _rx = group.add_member(conn, identity("Alice")).await;

        let msg = WireMessage::ping(conn);
        group.broadcast(&msg).unwrap();
        group.broadcast(&msg).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.active_members, 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(16);
        let msg = WireMessage::ping(Uuid::new_v4());
        // No receivers — send is counted but reaches nobody
        assert_eq!(group.broadcast(&msg).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_capacity() {
        let group = BroadcastGroup::new(32);
        assert_eq!(group.capacity(), 32);
    }

    #[tokio::test]
    async fn test_members_list() {
        let group = BroadcastGroup::new(16);
        let _rx1 = group.add_member(Uuid::new_v4(), identity("Alice")).await;
        let _rx2 = group.add_member(Uuid::new_v4(), identity("Bob")).await;

        let members = group.members().await;
        assert_eq!(members.len(), 2);
        let names: Vec<&str> = members.iter().map(|m| m.display_name.as_str()).collect();
        assert!(names.contains(&"Alice"));
        assert!(names.contains(&"Bob"));
    }
}
