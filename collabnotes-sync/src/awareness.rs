//! Ephemeral presence tracking per document room.
//!
//! Each room keeps a map of connection id → [`PresenceState`] (identity,
//! cursor color, optional cursor position). The map is never persisted; every
//! mutation rebroadcasts the full map to all members, and entries are removed
//! synchronously when their connection closes — there is no staleness timer,
//! the transport's close detection is the source of truth.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::Identity;
use crate::protocol::ProtocolError;

/// Fixed palette of presence colors, one assigned per connection.
pub const CURSOR_PALETTE: [&str; 16] = [
    "#F44336", "#E91E63", "#9C27B0", "#673AB7", "#3F51B5", "#2196F3", "#03A9F4", "#00BCD4",
    "#009688", "#4CAF50", "#8BC34A", "#CDDC39", "#FFC107", "#FF9800", "#FF5722", "#795548",
];

/// Pick a palette color for a connection.
///
/// Derived from the connection id hash; connection ids are random per
/// session, so the pick is effectively random while staying stable for the
/// connection's lifetime.
pub fn palette_color(connection_id: Uuid) -> &'static str {
    let hash = connection_id.as_u128();
    CURSOR_PALETTE[(hash % CURSOR_PALETTE.len() as u128) as usize]
}

/// Cursor position inside the note's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub line: u32,
    pub column: u32,
}

/// Presence metadata for one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user_id: String,
    pub display_name: String,
    /// Hex color from [`CURSOR_PALETTE`]
    pub color: String,
    /// Current cursor, if the client reported one
    pub cursor: Option<CursorPos>,
}

impl PresenceState {
    /// Seed presence for a freshly joined connection.
    pub fn joined(identity: &Identity, color: &str) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            color: color.to_string(),
            cursor: None,
        }
    }
}

/// Full presence map as it travels over the wire.
///
/// Serialized inside `WireMessage::Awareness` payloads. Subscribers always
/// receive the complete current map, so a missing entry doubles as the
/// removal signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwarenessFrame {
    pub entries: Vec<(Uuid, PresenceState)>,
}

impl AwarenessFrame {
    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    /// Look up a connection's presence entry.
    pub fn get(&self, connection_id: &Uuid) -> Option<&PresenceState> {
        self.entries
            .iter()
            .find(|(id, _)| id == connection_id)
            .map(|(_, state)| state)
    }
}

/// Per-room presence map.
pub struct PresenceRoom {
    states: RwLock<HashMap<Uuid, PresenceState>>,
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Set (or replace) a connection's presence state.
    pub async fn set_state(&self, connection_id: Uuid, state: PresenceState) {
        self.states.write().await.insert(connection_id, state);
    }

    /// Remove a connection's entry. Returns the removed state, if any.
    pub async fn remove(&self, connection_id: &Uuid) -> Option<PresenceState> {
        self.states.write().await.remove(connection_id)
    }

    /// Snapshot the full map as a wire frame.
    ///
    /// Entries are sorted by connection id so repeated snapshots of the same
    /// map encode identically.
    pub async fn snapshot(&self) -> AwarenessFrame {
        let states = self.states.read().await;
        let mut entries: Vec<(Uuid, PresenceState)> =
            states.iter().map(|(id, s)| (*id, s.clone())).collect();
        entries.sort_by_key(|(id, _)| *id);
        AwarenessFrame { entries }
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    pub async fn contains(&self, connection_id: &Uuid) -> bool {
        self.states.read().await.contains_key(connection_id)
    }
}

impl Default for PresenceRoom {
    fn default() -> Self {
        Self::new()
    }
}
