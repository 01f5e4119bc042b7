//! End-to-end tests for the WebSocket sync pipeline.
//!
//! These tests start a real server and connect real clients, covering the
//! join handshake, identity resolution, update broadcast, and convergence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use collabnotes_sync::auth::mint_token;
use collabnotes_sync::{
    ClientEvent, ServerConfig, StaticUserDirectory, SyncClient, SyncServer, ThrottleConfig,
    UserRecord, CURSOR_PALETTE,
};

const TEST_SECRET: &str = "integration-test-secret";

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Test config: throttle disabled so parallel clients from localhost pass.
fn test_config() -> ServerConfig {
    ServerConfig {
        jwt_secret: TEST_SECRET.to_string(),
        throttle: ThrottleConfig {
            min_interval: Duration::ZERO,
            ..ThrottleConfig::default()
        },
        ..ServerConfig::default()
    }
}

/// Start a server on a free port.
async fn start_server(mut config: ServerConfig) -> (u16, Arc<SyncServer>) {
    let port = free_port().await;
    config.bind_addr = format!("127.0.0.1:{port}");
    let server = Arc::new(SyncServer::new(config).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server)
}

/// Connect a client to a document on the given port.
async fn connect_client(
    port: u16,
    document: &str,
    token: Option<String>,
) -> (SyncClient, mpsc::Receiver<ClientEvent>) {
    let mut client = SyncClient::new(document, token, format!("ws://127.0.0.1:{port}"));
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    (client, events)
}

/// Wait (bounded) for the first event matching the predicate.
async fn next_matching<F>(events: &mut mpsc::Receiver<ClientEvent>, pred: F) -> Option<ClientEvent>
where
    F: Fn(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return Some(event),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Build a standalone update inserting `text` at `index` into "content".
fn update_inserting(text: &str, index: u32) -> Vec<u8> {
    use yrs::{Text, WriteTxn};
    let doc = yrs::Doc::new();
    {
        let mut txn = yrs::Transact::transact_mut(&doc);
        let root = txn.get_or_insert_text("content");
        root.insert(&mut txn, index, text);
    }
    let txn = yrs::Transact::transact(&doc);
    use yrs::ReadTxn;
    txn.encode_state_as_update_v1(&yrs::StateVector::default())
}

/// Apply a state/update blob to a fresh doc and read the "content" text.
fn content_of(state: &[u8]) -> String {
    use yrs::updates::decoder::Decode;
    use yrs::{GetString, ReadTxn};
    let doc = yrs::Doc::new();
    {
        let mut txn = yrs::Transact::transact_mut(&doc);
        let update = yrs::Update::decode_v1(state).unwrap();
        txn.apply_update(update).unwrap();
    }
    let txn = yrs::Transact::transact(&doc);
    match txn.get_text("content") {
        Some(text) => text.get_string(&txn),
        None => String::new(),
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, _server) = start_server(test_config()).await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_join_receives_identity_and_state() {
    let (port, _server) = start_server(test_config()).await;
    let (_client, mut events) = connect_client(port, "note:abc1234567", None).await;

    let connected = next_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. }))
        .await
        .expect("Should receive Connected");

    match connected {
        ClientEvent::Connected {
            user_id,
            display_name,
            color,
            ..
        } => {
            assert_eq!(user_id, "anonymous");
            assert_eq!(display_name, "Anonymous");
            assert!(CURSOR_PALETTE.contains(&color.as_str()));
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    let synced = next_matching(&mut events, |e| matches!(e, ClientEvent::StateSynced(_)))
        .await
        .expect("Should receive initial state");
    match synced {
        ClientEvent::StateSynced(state) => assert_eq!(content_of(&state), ""),
        other => panic!("Expected StateSynced, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_rejects_unprefixed_name() {
    let (port, _server) = start_server(test_config()).await;
    let (_client, mut events) = connect_client(port, "foo", None).await;

    let refused = next_matching(&mut events, |e| matches!(e, ClientEvent::Refused { .. }))
        .await
        .expect("Should be refused");
    match refused {
        ClientEvent::Refused { reason } => assert!(reason.contains("document name")),
        other => panic!("Expected Refused, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_rejects_short_name() {
    let (port, server) = start_server(test_config()).await;
    let (_client, mut events) = connect_client(port, "note:", None).await;

    assert!(
        next_matching(&mut events, |e| matches!(e, ClientEvent::Refused { .. }))
            .await
            .is_some(),
        "Should be refused"
    );
    // No room side effects for a rejected join
    assert_eq!(server.registry().room_count().await, 0);
}

#[tokio::test]
async fn test_join_accepts_minimum_length_name() {
    let (port, _server) = start_server(test_config()).await;
    let (_client, mut events) = connect_client(port, "note:0123456789", None).await;

    assert!(
        next_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. }))
            .await
            .is_some(),
        "note:0123456789 should be accepted"
    );
}

#[tokio::test]
async fn test_malformed_token_falls_back_to_anonymous() {
    let (port, _server) = start_server(test_config()).await;
    let (_client, mut events) =
        connect_client(port, "note:abc1234567", Some("not-a-valid-jwt".to_string())).await;

    let connected = next_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. }))
        .await
        .expect("Bad token must not reject the connection");
    match connected {
        ClientEvent::Connected {
            user_id,
            display_name,
            ..
        } => {
            assert_eq!(user_id, "anonymous");
            assert_eq!(display_name, "Anonymous");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_expired_token_falls_back_to_anonymous() {
    let directory = StaticUserDirectory::new().with_user(UserRecord {
        id: "user-alice".to_string(),
        username: "alice".to_string(),
        display_name: Some("Alice".to_string()),
        active: true,
    });
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..test_config()
    };
    let server = Arc::new(
        SyncServer::with_collaborators(
            config,
            Arc::new(directory),
            Arc::new(collabnotes_sync::AllowAll),
        )
        .unwrap(),
    );
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let expired = mint_token(TEST_SECRET, "user-alice", "alice", -3600).unwrap();
    let (_client, mut events) = connect_client(port, "note:abc1234567", Some(expired)).await;

    let connected = next_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. }))
        .await
        .unwrap();
    match connected {
        ClientEvent::Connected { user_id, .. } => assert_eq!(user_id, "anonymous"),
        other => panic!("Expected Connected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_valid_token_resolves_identity() {
    let directory = StaticUserDirectory::new().with_user(UserRecord {
        id: "user-alice".to_string(),
        username: "alice".to_string(),
        display_name: Some("Alice".to_string()),
        active: true,
    });
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..test_config()
    };
    let server = Arc::new(
        SyncServer::with_collaborators(
            config,
            Arc::new(directory),
            Arc::new(collabnotes_sync::AllowAll),
        )
        .unwrap(),
    );
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let token = mint_token(TEST_SECRET, "user-alice", "alice", 3600).unwrap();
    let (_client, mut events) = connect_client(port, "note:abc1234567", Some(token)).await;

    let connected = next_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. }))
        .await
        .unwrap();
    match connected {
        ClientEvent::Connected {
            user_id,
            display_name,
            ..
        } => {
            assert_eq!(user_id, "user-alice");
            assert_eq!(display_name, "Alice");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_update_broadcast_between_clients() {
    let (port, _server) = start_server(test_config()).await;

    let (alice, mut alice_events) = connect_client(port, "note:abc1234567", None).await;
    next_matching(&mut alice_events, |e| {
        matches!(e, ClientEvent::Connected { .. })
    })
    .await
    .unwrap();

    let (_bob, mut bob_events) = connect_client(port, "note:abc1234567", None).await;
    next_matching(&mut bob_events, |e| matches!(e, ClientEvent::Connected { .. }))
        .await
        .unwrap();

    let update = update_inserting("hello", 0);
    alice.send_update(update).await.unwrap();

    let received = next_matching(&mut bob_events, |e| {
        matches!(e, ClientEvent::RemoteUpdate { .. })
    })
    .await
    .expect("Bob should receive Alice's update");
    match received {
        ClientEvent::RemoteUpdate { update, .. } => assert_eq!(content_of(&update), "hello"),
        other => panic!("Expected RemoteUpdate, got {other:?}"),
    }

    // The sender never gets its own update echoed back
    assert!(
        timeout(Duration::from_millis(200), async {
            loop {
                match alice_events.recv().await {
                    Some(ClientEvent::RemoteUpdate { .. }) => return (),
                    Some(_) => continue,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await
        .is_err(),
        "Alice must not receive her own update"
    );
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    use yrs::updates::decoder::Decode;
    use yrs::{GetString, ReadTxn};

    let (port, _server) = start_server(test_config()).await;

    let (alice, mut alice_events) = connect_client(port, "note:abc1234567", None).await;
    next_matching(&mut alice_events, |e| {
        matches!(e, ClientEvent::Connected { .. })
    })
    .await
    .unwrap();
    let (bob, mut bob_events) = connect_client(port, "note:abc1234567", None).await;
    next_matching(&mut bob_events, |e| matches!(e, ClientEvent::Connected { .. }))
        .await
        .unwrap();

    // Independent docs, concurrent position-0 inserts
    let alice_doc = yrs::Doc::new();
    let bob_doc = yrs::Doc::new();
    let u1 = update_inserting("hello", 0);
    let u2 = update_inserting("world", 0);

    let apply = |doc: &yrs::Doc, bytes: &[u8]| {
        let mut txn = yrs::Transact::transact_mut(doc);
        txn.apply_update(yrs::Update::decode_v1(bytes).unwrap()).unwrap();
    };
    apply(&alice_doc, &u1);
    apply(&bob_doc, &u2);

    alice.send_update(u1).await.unwrap();
    bob.send_update(u2).await.unwrap();

    // Each side merges the other's update
    match next_matching(&mut bob_events, |e| {
        matches!(e, ClientEvent::RemoteUpdate { .. })
    })
    .await
    .unwrap()
    {
        ClientEvent::RemoteUpdate { update, .. } => apply(&bob_doc, &update),
        _ => unreachable!(),
    }
    match next_matching(&mut alice_events, |e| {
        matches!(e, ClientEvent::RemoteUpdate { .. })
    })
    .await
    .unwrap()
    {
        ClientEvent::RemoteUpdate { update, .. } => apply(&alice_doc, &update),
        _ => unreachable!(),
    }

    let read = |doc: &yrs::Doc| {
        let txn = yrs::Transact::transact(doc);
        txn.get_text("content").unwrap().get_string(&txn)
    };
    let alice_text = read(&alice_doc);
    let bob_text = read(&bob_doc);

    // Both replicas converge to the same deterministic merge of both inserts
    assert_eq!(alice_text, bob_text);
    assert!(alice_text.contains("hello"));
    assert!(alice_text.contains("world"));
    assert_eq!(alice_text.len(), "helloworld".len());
}

#[tokio::test]
async fn test_sync_request_returns_diff() {
    let (port, _server) = start_server(test_config()).await;

    let (alice, mut alice_events) = connect_client(port, "note:abc1234567", None).await;
    next_matching(&mut alice_events, |e| {
        matches!(e, ClientEvent::Connected { .. })
    })
    .await
    .unwrap();
    alice.send_update(update_inserting("hello", 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (bob, mut bob_events) = connect_client(port, "note:abc1234567", None).await;
    next_matching(&mut bob_events, |e| matches!(e, ClientEvent::Connected { .. }))
        .await
        .unwrap();

    // Initial full state already carries Alice's edit
    match next_matching(&mut bob_events, |e| matches!(e, ClientEvent::StateSynced(_)))
        .await
        .unwrap()
    {
        ClientEvent::StateSynced(state) => assert_eq!(content_of(&state), "hello"),
        _ => unreachable!(),
    }

    // An explicit diff request against the empty state vector returns it too
    use yrs::updates::encoder::Encode;
    let empty_sv = yrs::StateVector::default().encode_v1();
    bob.send_sync_request(empty_sv).await.unwrap();

    match next_matching(&mut bob_events, |e| matches!(e, ClientEvent::StateSynced(_)))
        .await
        .expect("Should receive diff response")
    {
        ClientEvent::StateSynced(diff) => assert_eq!(content_of(&diff), "hello"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let (port, _server) = start_server(test_config()).await;
    let (client, mut events) = connect_client(port, "note:abc1234567", None).await;
    next_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. }))
        .await
        .unwrap();

    client.send_ping().await.unwrap();
    assert!(
        next_matching(&mut events, |e| matches!(e, ClientEvent::Pong))
            .await
            .is_some(),
        "Should receive pong"
    );
}

#[tokio::test]
async fn test_peer_left_broadcast() {
    let (port, _server) = start_server(test_config()).await;

    let (_alice, mut alice_events) = connect_client(port, "note:abc1234567", None).await;
    next_matching(&mut alice_events, |e| {
        matches!(e, ClientEvent::Connected { .. })
    })
    .await
    .unwrap();

    let (mut bob, mut bob_events) = connect_client(port, "note:abc1234567", None).await;
    next_matching(&mut bob_events, |e| matches!(e, ClientEvent::Connected { .. }))
        .await
        .unwrap();

    bob.disconnect().await;

    assert!(
        next_matching(&mut alice_events, |e| matches!(e, ClientEvent::PeerLeft(_)))
            .await
            .is_some(),
        "Alice should see Bob leave"
    );
}

#[tokio::test]
async fn test_room_evicted_after_last_disconnect() {
    let (port, server) = start_server(test_config()).await;

    let (mut client, mut events) = connect_client(port, "note:abc1234567", None).await;
    next_matching(&mut events, |e| matches!(e, ClientEvent::Connected { .. }))
        .await
        .unwrap();
    assert_eq!(server.registry().room_count().await, 1);

    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.registry().room_count().await, 0);
}

#[tokio::test]
async fn test_throttle_refuses_rapid_connections() {
    let config = ServerConfig {
        throttle: ThrottleConfig {
            min_interval: Duration::from_secs(3600),
            max_violations: 1,
            ban_duration: Duration::from_secs(3600),
        },
        ..test_config()
    };
    let (port, server) = start_server(config).await;
    let url = format!("ws://127.0.0.1:{port}");

    // First connection passes the throttle
    let first = tokio_tungstenite::connect_async(&url).await;
    assert!(first.is_ok(), "First connection should be admitted");

    // An immediate second attempt from the same address is refused before
    // the WebSocket handshake
    let second = tokio_tungstenite::connect_async(&url).await;
    assert!(second.is_err(), "Rapid second connection should be refused");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.stats().await.throttled_connections, 1);
}
