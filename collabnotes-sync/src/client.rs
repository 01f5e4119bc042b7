//! WebSocket sync client for connecting to the collaboration server.
//!
//! Drives the join handshake (document name + optional bearer token), then
//! exposes the connection as an event stream: remote updates, awareness
//! snapshots, peer departures. Used by editor frontends and by the
//! integration tests, which pair it with a local Yrs doc.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::awareness::{AwarenessFrame, CursorPos, PresenceState};
use crate::protocol::{JoinRequest, MessageType, ProtocolError, WireMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Socket open, join sent, waiting for the server's verdict
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Join accepted; carries the server-assigned connection id and the
    /// resolved identity (anonymous if the token didn't verify)
    Connected {
        connection_id: Uuid,
        user_id: String,
        display_name: String,
        color: String,
    },
    /// Join refused (malformed document name); the server closes after this
    Refused { reason: String },
    /// Connection lost or closed
    Disconnected,
    /// Full document state from the server
    StateSynced(Vec<u8>),
    /// Incremental CRDT update from another connection
    RemoteUpdate { origin: Uuid, update: Vec<u8> },
    /// Full presence map for the room
    Awareness(AwarenessFrame),
    /// Another connection left the room
    PeerLeft(Uuid),
    /// Heartbeat response
    Pong,
}

/// The sync client.
pub struct SyncClient {
    document_name: String,
    token: Option<String>,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,
    /// Server-assigned id, known once the join is acked
    connection_id: Arc<RwLock<Option<Uuid>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,
}

impl SyncClient {
    /// Create a new sync client for a document.
    pub fn new(
        document_name: impl Into<String>,
        token: Option<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            document_name: document_name.into(),
            token,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connection_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and send the join handshake.
    ///
    /// Spawns background reader/writer tasks; the join verdict arrives as a
    /// [`ClientEvent::Connected`] or [`ClientEvent::Refused`] event.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the WebSocket. The
        // sink lives in this task; dropping the channel closes the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            let mut writer = ws_writer;
            while let Some(data) = out_rx.recv().await {
                use futures_util::SinkExt;
                if writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // The join frame must be first on the wire
        let join = WireMessage::join(&JoinRequest {
            document_name: self.document_name.clone(),
            token: self.token.clone(),
        })?;
        self.send_raw(join.encode()?).await?;

        // Reader task: decode frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match WireMessage::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(_) => continue,
                        };

                        let own_id = *connection_id.read().await;
                        let event = match frame.msg_type {
                            MessageType::JoinAccepted => match frame.join_ack() {
                                Ok(ack) => {
                                    *connection_id.write().await = Some(ack.connection_id);
                                    *state.write().await = ConnectionState::Connected;
                                    Some(ClientEvent::Connected {
                                        connection_id: ack.connection_id,
                                        user_id: ack.user_id,
                                        display_name: ack.display_name,
                                        color: ack.color,
                                    })
                                }
                                Err(_) => None,
                            },
                            MessageType::JoinRefused => {
                                *state.write().await = ConnectionState::Disconnected;
                                frame
                                    .join_refusal()
                                    .ok()
                                    .map(|refusal| ClientEvent::Refused {
                                        reason: refusal.reason,
                                    })
                            }
                            MessageType::SyncState => Some(ClientEvent::StateSynced(frame.payload)),
                            MessageType::Update => {
                                // The server filters echoes; this guards
                                // against relays that don't
                                if own_id == Some(frame.connection_id) {
                                    None
                                } else {
                                    Some(ClientEvent::RemoteUpdate {
                                        origin: frame.connection_id,
                                        update: frame.payload,
                                    })
                                }
                            }
                            MessageType::Awareness => AwarenessFrame::decode(&frame.payload)
                                .ok()
                                .map(ClientEvent::Awareness),
                            MessageType::PeerLeft => {
                                Some(ClientEvent::PeerLeft(frame.connection_id))
                            }
                            MessageType::Pong => Some(ClientEvent::Pong),
                            _ => None,
                        };

                        if let Some(event) = event {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send a CRDT update to the server.
    ///
    /// Allowed as soon as the join frame is on the wire — the server applies
    /// frames in order, so updates sent before the ack still land after
    /// hydration.
    pub async fn send_update(&self, crdt_update: Vec<u8>) -> Result<(), ProtocolError> {
        if *self.state.read().await == ConnectionState::Disconnected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let origin = self.connection_id.read().await.unwrap_or(Uuid::nil());
        let msg = WireMessage::update(origin, crdt_update);
        self.send_raw(msg.encode()?).await
    }

    /// Request a diff against our state vector.
    pub async fn send_sync_request(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let origin = self.connection_id.read().await.unwrap_or(Uuid::nil());
        let msg = WireMessage::sync_request(origin, state_vector);
        self.send_raw(msg.encode()?).await
    }

    /// Report our cursor position.
    ///
    /// Identity and color are server-assigned; only the cursor travels.
    pub async fn send_cursor(&self, cursor: Option<CursorPos>) -> Result<(), ProtocolError> {
        let origin = self.connection_id.read().await.unwrap_or(Uuid::nil());
        let local = PresenceState {
            user_id: String::new(),
            display_name: String::new(),
            color: String::new(),
            cursor,
        };
        let payload = bincode::serde::encode_to_vec(&local, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let msg = WireMessage::awareness(origin, payload);
        self.send_raw(msg.encode()?).await
    }

    /// Send an application-level ping.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let origin = self.connection_id.read().await.unwrap_or(Uuid::nil());
        let msg = WireMessage::ping(origin);
        self.send_raw(msg.encode()?).await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        // Dropping the writer channel ends the writer task, which drops the
        // sink and closes the socket
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Server-assigned connection id, if the join has been acked.
    pub async fn connection_id(&self) -> Option<Uuid> {
        *self.connection_id.read().await
    }

    /// Document this client edits.
    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    async fn send_raw(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("note:abc1234567", None, "ws://127.0.0.1:9");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.connection_id().await.is_none());
        assert_eq!(client.document_name(), "note:abc1234567");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = SyncClient::new("note:abc1234567", None, "ws://127.0.0.1:9");
        assert!(client.send_update(vec![1, 2, 3]).await.is_err());
        assert!(client.send_ping().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_fails() {
        // Port 9 (discard) is not listening
        let mut client = SyncClient::new("note:abc1234567", None, "ws://127.0.0.1:9");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = SyncClient::new("note:abc1234567", None, "ws://127.0.0.1:9");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
