//! Binary wire protocol for note synchronization.
//!
//! Every WebSocket frame carries one bincode-encoded [`WireMessage`]:
//! ```text
//! ┌──────────┬───────────────┬──────────┐
//! │ msg_type │ connection_id │ payload  │
//! │ 1 byte   │ 16 bytes      │ variable │
//! └──────────┴───────────────┴──────────┘
//! ```
//!
//! The first frame on a connection must be [`MessageType::Join`] carrying a
//! [`JoinRequest`]. After the server acknowledges the join, the connection
//! multiplexes three logical channels: document sync (`SyncRequest` /
//! `SyncState` / `Update`), awareness (`Awareness`), and heartbeat
//! (`Ping` / `Pong`).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Prefix every collaborative document name must carry.
pub const DOCUMENT_PREFIX: &str = "note:";

/// Minimum total length of a valid document name (prefix + note id).
pub const MIN_DOCUMENT_NAME_LEN: usize = 10;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake: client requests to join a document room
    Join = 1,
    /// Server accepted the join; payload is a [`JoinAck`]
    JoinAccepted = 2,
    /// Server refused the join; payload is a [`JoinRefusal`]
    JoinRefused = 3,
    /// Client state vector requesting a diff
    SyncRequest = 4,
    /// Document state (full or diff) as a CRDT update
    SyncState = 5,
    /// Incremental CRDT update
    Update = 6,
    /// Full presence map for the room
    Awareness = 7,
    /// A connection left the room
    PeerLeft = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Validated document name of the form `note:<id>`.
///
/// The suffix after the prefix is the durable note identifier used as the
/// persistence key. Validation happens once, at connection time; everything
/// downstream works with the already-checked name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentName(String);

impl DocumentName {
    /// Parse and validate a raw document name.
    ///
    /// Rejects names that don't start with `note:` or are shorter than
    /// [`MIN_DOCUMENT_NAME_LEN`] characters overall.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if !raw.starts_with(DOCUMENT_PREFIX) || raw.len() < MIN_DOCUMENT_NAME_LEN {
            return Err(ProtocolError::InvalidDocumentName(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// The full `note:<id>` name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The note identifier (everything after the prefix).
    pub fn note_id(&self) -> &str {
        &self.0[DOCUMENT_PREFIX.len()..]
    }
}

impl std::fmt::Display for DocumentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Join handshake sent as the first frame of every connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    /// Target document, `note:<id>`; validated server-side
    pub document_name: String,
    /// Optional bearer credential; absent or invalid falls back to anonymous
    pub token: Option<String>,
}

/// Server acknowledgement of a successful join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinAck {
    /// Connection id assigned by the server
    pub connection_id: Uuid,
    /// Resolved user id (`"anonymous"` if the credential didn't verify)
    pub user_id: String,
    /// Resolved display name
    pub display_name: String,
    /// Presence color assigned from the cursor palette
    pub color: String,
}

/// Server refusal of a join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRefusal {
    pub reason: String,
}

/// Top-level protocol message.
///
/// `connection_id` identifies the originating connection; the server stamps
/// it authoritatively when rebroadcasting, so receivers can filter their own
/// echoes. Server-originated frames use [`Uuid::nil`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub connection_id: Uuid,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Create a join handshake message.
    pub fn join(request: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Join,
            connection_id: Uuid::nil(),
            payload: encode_payload(request)?,
        })
    }

    /// Create a join acknowledgement.
    pub fn join_accepted(ack: &JoinAck) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::JoinAccepted,
            connection_id: Uuid::nil(),
            payload: encode_payload(ack)?,
        })
    }

    /// Create a join refusal.
    pub fn join_refused(reason: impl Into<String>) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::JoinRefused,
            connection_id: Uuid::nil(),
            payload: encode_payload(&JoinRefusal {
                reason: reason.into(),
            })?,
        })
    }

    /// Create a sync request carrying an encoded state vector.
    pub fn sync_request(connection_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncRequest,
            connection_id,
            payload: state_vector,
        }
    }

    /// Create a sync state message carrying an encoded CRDT update.
    pub fn sync_state(state: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncState,
            connection_id: Uuid::nil(),
            payload: state,
        }
    }

    /// Create an incremental update message.
    pub fn update(connection_id: Uuid, crdt_update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            connection_id,
            payload: crdt_update,
        }
    }

    /// Create an awareness message carrying pre-encoded presence data.
    pub fn awareness(connection_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            connection_id,
            payload,
        }
    }

    /// Create a peer-left notification.
    pub fn peer_left(connection_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            connection_id,
            payload: Vec::new(),
        }
    }

    /// Create a ping message.
    pub fn ping(connection_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            connection_id,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(connection_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            connection_id,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the join request payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse the join acknowledgement payload.
    pub fn join_ack(&self) -> Result<JoinAck, ProtocolError> {
        if self.msg_type != MessageType::JoinAccepted {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse the join refusal payload.
    pub fn join_refusal(&self) -> Result<JoinRefusal, ProtocolError> {
        if self.msg_type != MessageType::JoinRefused {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Invalid document name: {0:?}")]
    InvalidDocumentName(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Handshake timed out")]
    HandshakeTimeout,
}
