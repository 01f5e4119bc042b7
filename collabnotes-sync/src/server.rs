//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── DocumentRoom (note:<id>) ── Yrs Doc ── BroadcastGroup
//! Client B ──┘          │                                    │
//!                       │ hydrate / flush                    │ presence map
//!                       ▼                                    ▼
//!               SnapshotStore (RocksDB)              AwarenessFrame fan-out
//! ```
//!
//! Each connection runs one task that multiplexes its WebSocket with the
//! room's broadcast receiver. Join handshake order: throttle check (before
//! the WebSocket upgrade), document name validation, identity resolution,
//! advisory access check, room open (hydrated), then sync.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::{AllowAll, AuthGate, Identity, NoteAccess, StaticUserDirectory, UserDirectory};
use crate::awareness::{palette_color, PresenceState};
use crate::config::ServerConfig;
use crate::protocol::{
    DocumentName, JoinAck, MessageType, ProtocolError, WireMessage,
};
use crate::room::{DocumentRoom, RoomError, RoomRegistry};
use crate::storage::{SnapshotStore, StoreConfig, StoreError};
use crate::throttle::ConnectionThrottle;

/// Server-level errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Room(#[from] RoomError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub throttled_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    /// Open rooms, keyed by document name
    registry: Arc<RoomRegistry>,
    /// Identity resolution + advisory access checks
    gate: Arc<AuthGate>,
    /// Per-address connection throttle
    throttle: Arc<ConnectionThrottle>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    /// Snapshot store (None = in-memory only)
    store: Option<Arc<SnapshotStore>>,
    /// Shutdown signal; flipping to true stops the accept loop
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    /// Create a server with the default collaborator fakes: an empty user
    /// directory (every token resolves to anonymous) and an allow-all
    /// access policy.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        Self::with_collaborators(
            config,
            Arc::new(StaticUserDirectory::new()),
            Arc::new(AllowAll),
        )
    }

    /// Create a server wired to real user-store and access-policy
    /// collaborators.
    pub fn with_collaborators(
        config: ServerConfig,
        directory: Arc<dyn UserDirectory>,
        access: Arc<dyn NoteAccess>,
    ) -> Result<Self, ServerError> {
        let store = match config.storage_path {
            Some(ref path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(SnapshotStore::open(store_config)?))
            }
            None => None,
        };

        let gate = Arc::new(AuthGate::new(&config.jwt_secret, directory, access));
        let registry = Arc::new(RoomRegistry::new(store.clone(), config.broadcast_capacity));
        let throttle = Arc::new(ConnectionThrottle::new(config.throttle.clone()));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            gate,
            throttle,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
            shutdown,
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs until [`SyncServer::trigger_shutdown`] is called, then stops
    /// accepting, flushes every open room best-effort, and returns.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration sync server listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        let checkpoint_task = self.spawn_checkpoint_task();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;

                    if !self.throttle.check(addr.ip()).await.is_allowed() {
                        log::debug!("Refused connection from {addr} (throttled)");
                        let mut s = self.stats.write().await;
                        s.throttled_connections += 1;
                        continue;
                    }

                    log::debug!("New TCP connection from {addr}");
                    let registry = self.registry.clone();
                    let gate = self.gate.clone();
                    let stats = self.stats.clone();
                    let config = self.config.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, addr, registry, gate, stats, config)
                                .await
                        {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }

                _ = shutdown_rx.changed() => {
                    log::info!("Shutdown signal received; no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);
        self.registry.flush_all().await;
        checkpoint_task.abort();
        log::info!("Shutdown complete");
        Ok(())
    }

    /// Stop accepting connections and flush open rooms.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Periodic checkpoint: flush dirty rooms, sweep empty ones.
    fn spawn_checkpoint_task(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = self.config.checkpoint_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.checkpoint().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        gate: Arc<AuthGate>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // ---- Join handshake: first frame, within the join timeout ----
        let (name, identity, room) = match Self::handshake(
            &mut ws_sender,
            &mut ws_receiver,
            addr,
            &registry,
            &gate,
            &config,
        )
        .await
        {
            Ok(Some(joined)) => joined,
            Ok(None) | Err(_) => {
                let mut s = stats.write().await;
                s.active_connections -= 1;
                return Ok(());
            }
        };

        let connection_id = Uuid::new_v4();
        let color = palette_color(connection_id);
        let mut broadcast_rx = room.broadcast.add_member(connection_id, identity.clone()).await;

        // Seed presence and announce the new member to the whole room
        room.presence
            .set_state(connection_id, PresenceState::joined(&identity, color))
            .await;
        Self::broadcast_awareness(&room).await;

        {
            let mut s = stats.write().await;
            s.active_rooms = registry.room_count().await;
        }
        log::info!("{} joined {name}", identity.display_name);

        // A session error (send failure, socket reset) must still run the
        // cleanup below, so it never propagates past this point
        if let Err(e) = Self::serve_connection(
            &mut ws_sender,
            &mut ws_receiver,
            &mut broadcast_rx,
            &room,
            connection_id,
            color,
            &identity,
            &name,
            addr,
            &stats,
        )
        .await
        {
            log::debug!("Session for {connection_id} ended with error: {e}");
        }

        // ---- Cleanup: presence first, then membership, then room release ----
        room.broadcast.remove_member(&connection_id).await;
        room.presence.remove(&connection_id).await;
        let _ = room.broadcast.broadcast(&WireMessage::peer_left(connection_id));
        Self::broadcast_awareness(&room).await;
        log::info!("{} left {name}", identity.display_name);

        registry.release(&room, &identity).await;

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = registry.room_count().await;
        }

        Ok(())
    }

    /// Serve one joined connection: ack, initial state, then the main loop
    /// multiplexing the socket with the room broadcast.
    #[allow(clippy::too_many_arguments)]
    async fn serve_connection<Si, St>(
        ws_sender: &mut Si,
        ws_receiver: &mut St,
        broadcast_rx: &mut tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>,
        room: &Arc<DocumentRoom>,
        connection_id: Uuid,
        color: &str,
        identity: &Identity,
        name: &DocumentName,
        addr: SocketAddr,
        stats: &Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        Si: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        St: futures_util::Stream<
                Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        let ack = WireMessage::join_accepted(&JoinAck {
            connection_id,
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            color: color.to_string(),
        })?;
        ws_sender.send(Message::Binary(ack.encode()?.into())).await?;

        // Late joiners catch up from the full current state
        let state = room.encode_full_state().await;
        let state_msg = WireMessage::sync_state(state);
        ws_sender.send(Message::Binary(state_msg.encode()?.into())).await?;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let frame = match WireMessage::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            match frame.msg_type {
                                MessageType::Update => {
                                    match room.apply_update(&frame.payload, identity).await {
                                        Ok(()) => {
                                            // Restamp with the server-assigned id so
                                            // receivers can filter reliably
                                            let relay =
                                                WireMessage::update(connection_id, frame.payload);
                                            if let Err(e) = room.broadcast.broadcast(&relay) {
                                                log::warn!("Broadcast failed for {name}: {e}");
                                            }
                                        }
                                        Err(e) => {
                                            log::warn!("Rejected update from {addr}: {e}");
                                        }
                                    }
                                }

                                MessageType::SyncRequest => {
                                    match room.encode_diff(&frame.payload).await {
                                        Ok(diff) => {
                                            let response = WireMessage::sync_state(diff);
                                            ws_sender
                                                .send(Message::Binary(response.encode()?.into()))
                                                .await?;
                                        }
                                        Err(e) => {
                                            log::warn!("Bad sync request from {addr}: {e}");
                                        }
                                    }
                                }

                                MessageType::Awareness => {
                                    // Client supplies at most its cursor; identity and
                                    // color stay server-assigned
                                    let cursor = bincode::serde::decode_from_slice::<
                                        PresenceState,
                                        _,
                                    >(
                                        &frame.payload,
                                        bincode::config::standard(),
                                    )
                                    .map(|(state, _)| state.cursor)
                                    .unwrap_or_default();

                                    let mut state = PresenceState::joined(identity, color);
                                    state.cursor = cursor;
                                    room.presence.set_state(connection_id, state).await;
                                    Self::broadcast_awareness(room).await;
                                }

                                MessageType::Ping => {
                                    let pong = WireMessage::pong(connection_id);
                                    ws_sender
                                        .send(Message::Binary(pong.encode()?.into()))
                                        .await?;
                                }

                                other => {
                                    log::debug!("Unhandled message type from {addr}: {other:?}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                msg = broadcast_rx.recv() => {
                    match msg {
                        Ok(data) => {
                            // Don't echo a member's own frames back at it;
                            // server-originated frames (nil id) go to everyone
                            if let Ok(frame) = WireMessage::decode(&data) {
                                if frame.connection_id == connection_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {connection_id} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Run the join handshake. Returns `Ok(None)` when the connection was
    /// refused (refusal already sent) or timed out.
    async fn handshake<Si, St>(
        ws_sender: &mut Si,
        ws_receiver: &mut St,
        addr: SocketAddr,
        registry: &Arc<RoomRegistry>,
        gate: &Arc<AuthGate>,
        config: &ServerConfig,
    ) -> Result<Option<(DocumentName, Identity, Arc<DocumentRoom>)>, Box<dyn std::error::Error + Send + Sync>>
    where
        Si: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        St: futures_util::Stream<
                Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        let first = match tokio::time::timeout(config.join_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => data,
            Ok(_) => {
                log::debug!("Connection from {addr} closed before joining");
                return Ok(None);
            }
            Err(_) => {
                log::debug!("Connection from {addr} timed out before joining");
                return Ok(None);
            }
        };

        let bytes: Vec<u8> = first.into();
        let request = match WireMessage::decode(&bytes).and_then(|m| m.join_request()) {
            Ok(request) => request,
            Err(e) => {
                log::info!("Rejected malformed join from {addr}: {e}");
                Self::refuse(ws_sender, "malformed join frame").await;
                return Ok(None);
            }
        };

        // Validate the document name before doing any other work
        let name = match DocumentName::parse(&request.document_name) {
            Ok(name) => name,
            Err(_) => {
                log::info!(
                    "Rejected invalid document name from {addr}: {:?}",
                    request.document_name
                );
                Self::refuse(ws_sender, "invalid document name").await;
                return Ok(None);
            }
        };

        let identity = gate.authenticate(request.token.as_deref());
        // Advisory only: a denial is logged inside the gate, the join proceeds
        gate.authorize_read(&identity, name.note_id());

        let room = registry.open(&name).await;
        Ok(Some((name, identity, room)))
    }

    /// Send a refusal frame and close the socket, ignoring send failures.
    async fn refuse<Si>(ws_sender: &mut Si, reason: &str)
    where
        Si: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        if let Ok(refusal) = WireMessage::join_refused(reason) {
            if let Ok(encoded) = refusal.encode() {
                let _ = ws_sender.send(Message::Binary(encoded.into())).await;
            }
        }
        let _ = ws_sender.close().await;
    }

    /// Broadcast the room's full presence map to every member.
    async fn broadcast_awareness(room: &Arc<DocumentRoom>) {
        match room.presence.snapshot().await.encode() {
            Ok(payload) => {
                // Nil connection id: server-originated, delivered to everyone
                let frame = WireMessage::awareness(Uuid::nil(), payload);
                if let Err(e) = room.broadcast.broadcast(&frame) {
                    log::warn!("Awareness broadcast failed for {}: {e}", room.name());
                }
            }
            Err(e) => log::warn!("Failed to encode awareness frame: {e}"),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the snapshot store (if persistence is configured).
    pub fn store(&self) -> Option<&Arc<SnapshotStore>> {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation_defaults() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:1234");
        assert!(server.store().is_none());
    }

    #[test]
    fn test_server_custom_bind_addr() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert!(server.store().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.throttled_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_registry_starts_empty() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.registry().room_count().await, 0);
    }
}
