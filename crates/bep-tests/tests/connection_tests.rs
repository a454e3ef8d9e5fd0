//! Connection lifecycle tests against a scripted peer.
//!
//! Covers:
//! - Hello and cluster config exchange
//! - Folders shared by the peer
//! - Protocol violations and peer-initiated close
//! - Client-side disconnect and connection events

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bep_client::ConnectionChange;
use bep_net::ConnectionState;
use bep_proto::bep::{self, ErrorCode, Request};
use bep_proto::Message;
use bep_tests::{spawn_peer, ClientFixture, TestPeer};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bep_client=debug,bep_tests=debug")
        .with_test_writer()
        .try_init();
}

/// Collects connection events.
#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<ConnectionChange>>>);

impl Events {
    fn push(&self, event: &ConnectionChange) {
        self.0.lock().unwrap().push(event.clone());
    }

    fn states(&self) -> Vec<ConnectionState> {
        self.0.lock().unwrap().iter().map(|e| e.state).collect()
    }
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

// ============================================================================
// Handshake
// ============================================================================

#[test]
fn test_handshake_exchanges_hello_and_cluster_config() {
    init_tracing();
    let peer = TestPeer::new("peer-one").unwrap();
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        let received = session.exchange_cluster_config(&["default"], 0)?;
        let empty_index = session.recv_until(|m| match m {
            Message::Index(index) => Some(index),
            _ => None,
        })?;
        Ok((received, empty_index))
    });

    let connection = fixture.client.connection_for_device(&peer_id).unwrap();
    let (session, (received, empty_index)) = script.join().unwrap().unwrap();

    assert!(connection.is_connected());
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.peer_name().as_deref(), Some("peer-one"));
    assert!(connection.has_folder("default"));
    assert!(!connection.has_folder("other"));
    assert_eq!(session.hello.device_name, "client-under-test");

    // our cluster config lists both devices on the configured folder
    assert_eq!(received.folders.len(), 1);
    let folder = &received.folders[0];
    assert_eq!(folder.id, "default");
    let devices: Vec<Vec<u8>> = folder.devices.iter().map(|d| d.id.clone()).collect();
    assert!(devices.contains(&client_id.to_hash_data()));
    assert!(devices.contains(&peer_id.to_hash_data()));

    assert_eq!(empty_index.folder, "default");
    assert!(empty_index.files.is_empty());

    // the peer name from Hello is remembered
    assert_eq!(fixture.config.peer(&peer_id).unwrap().name, "peer-one");

    // an established connection is reused
    let again = fixture.client.connection_for_device(&peer_id).unwrap();
    assert!(Arc::ptr_eq(&connection, &again));
}

#[test]
fn test_peer_shares_new_folder() {
    init_tracing();
    let peer = TestPeer::new("peer-two").unwrap();
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &[]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        let received = session.exchange_cluster_config(&["photos"], 0)?;
        Ok(received)
    });

    let connection = fixture.client.connection_for_device(&peer_id).unwrap();
    let (_session, received) = script.join().unwrap().unwrap();

    assert!(received.folders.is_empty());
    assert!(connection.has_folder("photos"));
    let folder = fixture.config.folder("photos").unwrap();
    assert_eq!(folder.label, "photos label");

    let info = connection.cluster_config_info().unwrap();
    let shared = info.folder("photos").unwrap();
    assert!(shared.is_announced);
    assert!(shared.is_shared);
}

#[test]
fn test_missing_cluster_config_times_out() {
    init_tracing();
    let peer = TestPeer::new("silent").unwrap();
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        // read the client's cluster config but never answer
        session.recv_until(|m| match m {
            Message::ClusterConfig(c) => Some(c),
            _ => None,
        })?;
        Ok(())
    });

    let started = Instant::now();
    let result = fixture.client.connection_for_device(&peer_id);
    assert!(result.is_err());
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert!(fixture.client.connections().is_empty());
    drop(script.join().unwrap());
}

#[test]
fn test_silent_tcp_peer_times_out() {
    init_tracing();
    let peer = Arc::new(TestPeer::new("mute").unwrap());
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();

    // accepts tcp but never answers the TLS client hello
    let accepting = peer.clone();
    let holder = thread::spawn(move || accepting.accept_tcp());

    let started = Instant::now();
    assert!(fixture.client.connection_for_device(&peer_id).is_err());
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(fixture.client.connections().is_empty());
    let _held = holder.join().unwrap().unwrap();

    // the listener backlog takes the next dial, which stalls the same way
    let started = Instant::now();
    assert!(fixture.client.connection_for_device(&peer_id).is_err());
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(fixture.client.connections().is_empty());
}

#[test]
fn test_missing_hello_times_out() {
    init_tracing();
    let peer = TestPeer::new("tongue-tied").unwrap();
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let holder = thread::spawn(move || peer.accept_tls(Some(client_id)));

    let started = Instant::now();
    assert!(fixture.client.connection_for_device(&peer_id).is_err());
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(fixture.client.connections().is_empty());
    let status = fixture.client.peer_status();
    assert_eq!(status[0].state, ConnectionState::Disconnected);
    let _socket = holder.join().unwrap().unwrap();
}

// ============================================================================
// Protocol violations and close
// ============================================================================

#[test]
fn test_second_cluster_config_closes_connection() {
    init_tracing();
    let peer = TestPeer::new("chatty").unwrap();
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();
    let events = Events::default();
    let sink = events.clone();
    fixture.client.subscribe_connection_changes(move |event: &ConnectionChange| sink.push(event));

    let script = spawn_peer(peer, client_id, |session| {
        session.exchange_cluster_config(&["default"], 0)?;
        Ok(())
    });
    let connection = fixture.client.connection_for_device(&peer_id).unwrap();
    let (mut session, ()) = script.join().unwrap().unwrap();

    let again = session.cluster_config(&["default"], 0);
    session.send(again).unwrap();

    let saw_close = session
        .recv_until(|m| match m {
            Message::Close(close) => Some(close),
            _ => None,
        })
        .is_ok();
    assert!(saw_close);
    assert!(wait_until(|| connection.is_closed()));
    assert!(wait_until(|| fixture.client.connections().is_empty()));
    assert!(wait_until(|| events.states().contains(&ConnectionState::Closed)));
    assert!(events.states().contains(&ConnectionState::Connected));
}

#[test]
fn test_peer_close_message_closes_connection() {
    init_tracing();
    let peer = TestPeer::new("leaving").unwrap();
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        session.exchange_cluster_config(&["default"], 0)?;
        Ok(())
    });
    let connection = fixture.client.connection_for_device(&peer_id).unwrap();
    let (mut session, ()) = script.join().unwrap().unwrap();

    session
        .send(bep::Close {
            reason: "going away".to_string(),
        })
        .unwrap();
    assert!(wait_until(|| connection.is_closed()));
    assert!(connection.send_message(bep::Ping {}).is_err());
}

#[test]
fn test_peer_eof_closes_connection() {
    init_tracing();
    let peer = TestPeer::new("vanishing").unwrap();
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        session.exchange_cluster_config(&["default"], 0)?;
        Ok(())
    });
    let connection = fixture.client.connection_for_device(&peer_id).unwrap();
    let (session, ()) = script.join().unwrap().unwrap();

    session.shutdown();
    drop(session);
    assert!(wait_until(|| connection.is_closed()));
}

#[test]
fn test_client_disconnect_sends_close() {
    init_tracing();
    let peer = TestPeer::new("peer-three").unwrap();
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        session.exchange_cluster_config(&["default"], 0)?;
        Ok(())
    });
    let connection = fixture.client.connection_for_device(&peer_id).unwrap();
    let (mut session, ()) = script.join().unwrap().unwrap();

    let status = fixture.client.peer_status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].state, ConnectionState::Connected);

    assert_eq!(fixture.client.disconnect(&peer_id), 1);
    assert!(connection.is_closed());
    let close = session
        .recv_until(|m| match m {
            Message::Close(close) => Some(close),
            _ => None,
        })
        .unwrap();
    assert!(!close.reason.is_empty());
    assert_eq!(fixture.client.peer_status()[0].state, ConnectionState::Disconnected);
    assert_eq!(fixture.client.disconnect(&peer_id), 0);
}

// ============================================================================
// Requests
// ============================================================================

#[test]
fn test_request_for_unknown_file_gets_no_such_file() {
    init_tracing();
    let peer = TestPeer::new("asking").unwrap();
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        session.exchange_cluster_config(&["default"], 0)?;
        Ok(())
    });
    let _connection = fixture.client.connection_for_device(&peer_id).unwrap();
    let (mut session, ()) = script.join().unwrap().unwrap();

    session
        .send(Request {
            id: 99,
            folder: "default".to_string(),
            name: "missing.txt".to_string(),
            offset: 0,
            size: 10,
            hash: vec![0; 32],
            from_temporary: false,
        })
        .unwrap();
    let response = session
        .recv_until(|m| match m {
            Message::Response(r) => Some(r),
            _ => None,
        })
        .unwrap();
    assert_eq!(response.id, 99);
    assert_eq!(response.code, ErrorCode::NoSuchFile as i32);
    assert!(response.data.is_empty());
}

#[test]
fn test_ping_is_ignored() {
    init_tracing();
    let peer = TestPeer::new("pinging").unwrap();
    let peer_id = peer.device_id();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        session.exchange_cluster_config(&["default"], 0)?;
        Ok(())
    });
    let connection = fixture.client.connection_for_device(&peer_id).unwrap();
    let (mut session, ()) = script.join().unwrap().unwrap();

    let before = connection.stats().messages_received;
    session.send(bep::Ping {}).unwrap();
    assert!(wait_until(|| connection.stats().messages_received > before));
    assert!(connection.is_connected());
}
