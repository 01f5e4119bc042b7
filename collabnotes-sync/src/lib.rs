//! # collabnotes-sync — Real-time collaboration server for CollabNotes
//!
//! WebSocket-based multiplayer note editing using CRDT synchronization.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (authority) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Yrs Doc     │                     │ DocumentRoom│
//! │ (local)     │                     │ per note:id │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                              ┌─────────────┼─────────────┐
//!                              ▼             ▼             ▼
//!                       BroadcastGroup  PresenceRoom  SnapshotStore
//!                       (fan-out)       (awareness)   (RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded [`WireMessage`])
//! - [`auth`] — Token verification with anonymous fallback, advisory ACL
//! - [`room`] — Document rooms, hydration, flush-then-evict lifecycle
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`awareness`] — Ephemeral presence (cursor, color, identity)
//! - [`storage`] — RocksDB snapshot persistence
//! - [`throttle`] — Per-address connection throttling
//! - [`server`] — The WebSocket sync server
//! - [`client`] — WebSocket sync client
//!
//! Identity is resolved once per connection and fails open to anonymous;
//! merge correctness is delegated entirely to the Yrs CRDT — the server
//! never touches document state outside Yrs transactions.

pub mod auth;
pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;
pub mod throttle;

// Re-exports for convenience
pub use auth::{
    AllowAll, AuthGate, Identity, NoteAccess, StaticNoteAccess, StaticUserDirectory,
    UserDirectory, UserRecord,
};
pub use awareness::{AwarenessFrame, CursorPos, PresenceRoom, PresenceState, CURSOR_PALETTE};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ClientEvent, ConnectionState, SyncClient};
pub use config::ServerConfig;
pub use protocol::{
    DocumentName, JoinAck, JoinRequest, MessageType, ProtocolError, WireMessage,
};
pub use room::{DocumentRoom, RoomError, RoomRegistry};
pub use server::{ServerError, ServerStats, SyncServer};
pub use storage::{SnapshotMetadata, SnapshotStore, StoreConfig, StoreError};
pub use throttle::{ConnectionThrottle, ThrottleConfig, ThrottleDecision};
