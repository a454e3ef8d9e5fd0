//! Block transfer tests against a scripted peer.
//!
//! Tests for:
//! - Downloading a multi-block file announced in the peer's index
//! - Transfers failing when the peer goes silent or away
//! - Uploads that complete only once the peer indexes the new record
//! - Directory and deletion announcements

use std::io::{Cursor, Read};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use bep_core::config::Timeouts;
use bep_core::{BlockList, FileInfo, FileType, BLOCK_SIZE};
use bep_proto::bep::{FileInfoType, Index, IndexUpdate};
use bep_proto::Message;
use bep_tests::{spawn_peer, test_timeouts, wire_dir, wire_file, ClientFixture, TestPeer, TestResult};
use rand::RngCore;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bep_client=debug,bep_index=debug,bep_tests=debug")
        .with_test_writer()
        .try_init();
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

// ============================================================================
// Downloads
// ============================================================================

#[test]
fn test_pull_three_block_file() {
    init_tracing();
    let data = random_bytes(2 * BLOCK_SIZE + 1000);
    let list = BlockList::from_bytes(&data);
    assert_eq!(list.blocks.len(), 3);

    let peer = TestPeer::new("source").unwrap();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let served = data.clone();
    let script = spawn_peer(peer, client_id, move |session| {
        session.exchange_cluster_config(&["default"], 1)?;
        session.send(Index {
            folder: "default".to_string(),
            files: vec![wire_file("docs/big.bin", &served, 100, 1)],
        })?;
        session.serve_requests(&served, 3)
    });

    let file_info = FileInfo::file("default", "docs/big.bin", data.len() as u64, list.hash.clone(), 100_000).unwrap();
    let observer = fixture.client.pull_file(&file_info).unwrap();

    let mut seen = Vec::new();
    while !observer.is_completed() {
        seen.push(observer.wait_for_progress_update().unwrap());
    }
    for pair in seen.windows(2) {
        assert!(pair[0] <= pair[1], "progress went backwards: {seen:?}");
    }
    for progress in &seen[..seen.len().saturating_sub(1)] {
        assert!(*progress < 1.0);
    }
    assert_eq!(observer.progress(), 1.0);
    assert!(observer.progress_message().starts_with("100%"));

    let mut content = Vec::new();
    observer.input_stream().unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content.len(), data.len());
    assert!(content == data);

    let (_session, requests) = script.join().unwrap().unwrap();
    let mut offsets: Vec<i64> = requests.iter().map(|r| r.offset).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, BLOCK_SIZE as i64, 2 * BLOCK_SIZE as i64]);
    assert!(requests.iter().all(|r| r.id != 0 && r.name == "docs/big.bin"));
    assert_eq!(requests.last().map(|r| r.size), Some(1000));
}

#[test]
fn test_pull_served_by_another_clients_upload() {
    init_tracing();
    let data = random_bytes(2 * BLOCK_SIZE + 777);
    let peer = Arc::new(TestPeer::new("relay").unwrap());
    let uploader = ClientFixture::new(&peer, &["default"]).unwrap();
    let downloader = ClientFixture::new(&peer, &["default"]).unwrap();
    let uploader_id = uploader.client.device_id();
    let downloader_id = downloader.client.device_id();
    assert_ne!(uploader_id, downloader_id);

    // the uploader announces the file to the peer
    let accepting = peer.clone();
    let first = thread::spawn(move || -> TestResult<_> {
        let mut session = accepting.accept(Some(uploader_id))?;
        session.exchange_cluster_config(&["default"], 0)?;
        let update = session.recv_until(|m| match m {
            Message::IndexUpdate(update) => Some(update),
            _ => None,
        })?;
        Ok((session, update))
    });
    let upload = uploader
        .client
        .push_file(Cursor::new(data.clone()), "default", "shared/f.bin")
        .unwrap();
    let (mut upload_session, update) = first.join().unwrap().unwrap();
    let mut record = update.files[0].clone();
    record.sequence = 1;

    // the peer offers it to the downloader and forwards its requests
    let accepting = peer.clone();
    let announced = record.clone();
    let second = thread::spawn(move || -> TestResult<_> {
        let mut session = accepting.accept(Some(downloader_id))?;
        session.exchange_cluster_config(&["default"], 1)?;
        session.send(Index {
            folder: "default".to_string(),
            files: vec![announced],
        })?;
        let mut forwarded = 0;
        while forwarded < 3 {
            let request = session.recv_until(|m| match m {
                Message::Request(r) => Some(r),
                _ => None,
            })?;
            let id = request.id;
            upload_session.send(request)?;
            let response = upload_session.recv_until(|m| match m {
                Message::Response(r) if r.id == id => Some(r),
                _ => None,
            })?;
            session.send(response)?;
            forwarded += 1;
        }
        Ok((upload_session, session))
    });

    let hash = BlockList::from_bytes(&data).hash;
    let last_modified = record.modified_s * 1000 + i64::from(record.modified_ns) / 1_000_000;
    let file_info = FileInfo::file("default", "shared/f.bin", data.len() as u64, hash, last_modified).unwrap();
    let observer = downloader.client.pull_file(&file_info).unwrap();

    let mut last = 0.0;
    while !observer.is_completed() {
        let progress = observer.wait_for_progress_update().unwrap();
        assert!(progress >= last);
        assert!(progress < 1.0 || observer.is_completed());
        last = progress;
    }
    assert_eq!(observer.progress(), 1.0);

    let mut content = Vec::new();
    observer.input_stream().unwrap().read_to_end(&mut content).unwrap();
    assert!(content == data);

    let _sessions = second.join().unwrap().unwrap();
    assert!(upload.progress_percentage() <= 100);
    assert!(!upload.is_completed());
}

#[test]
fn test_pull_rejects_corrupt_block() {
    init_tracing();
    let data = random_bytes(1000);
    let list = BlockList::from_bytes(&data);

    let peer = TestPeer::new("liar").unwrap();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let announced = data.clone();
    let script = spawn_peer(peer, client_id, move |session| {
        session.exchange_cluster_config(&["default"], 1)?;
        session.send(Index {
            folder: "default".to_string(),
            files: vec![wire_file("a.txt", &announced, 100, 1)],
        })?;
        let corrupt = vec![0u8; announced.len()];
        session.serve_requests(&corrupt, 1)
    });

    let file_info = FileInfo::file("default", "a.txt", data.len() as u64, list.hash, 100_000).unwrap();
    let observer = fixture.client.pull_file(&file_info).unwrap();
    let error = observer.wait_for_complete().err().unwrap();
    assert!(error.to_string().contains("hash"));
    assert!(!observer.is_completed());
    assert!(observer.input_stream().is_err());
    drop(script.join().unwrap());
}

#[test]
fn test_pull_fails_when_block_is_never_answered() {
    init_tracing();
    let data = random_bytes(1000);
    let list = BlockList::from_bytes(&data);

    let peer = TestPeer::new("stalling").unwrap();
    let timeouts = Timeouts {
        block_request_secs: 2,
        ..test_timeouts()
    };
    let fixture = ClientFixture::with_timeouts(&peer, &["default"], timeouts).unwrap();
    let client_id = fixture.client.device_id();

    let announced = data.clone();
    let script = spawn_peer(peer, client_id, move |session| {
        session.exchange_cluster_config(&["default"], 1)?;
        session.send(Index {
            folder: "default".to_string(),
            files: vec![wire_file("slow.bin", &announced, 100, 1)],
        })?;
        // swallow the request
        session.recv_until(|m| match m {
            Message::Request(r) => Some(r),
            _ => None,
        })
    });

    let file_info = FileInfo::file("default", "slow.bin", data.len() as u64, list.hash, 100_000).unwrap();
    let observer = fixture.client.pull_file(&file_info).unwrap();
    let started = Instant::now();
    let error = observer.wait_for_complete().err().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(error.to_string().contains("timeout waiting for block"), "{error}");
    assert!(!observer.is_completed());

    let (_session, request) = script.join().unwrap().unwrap();
    assert_eq!(request.name, "slow.bin");
    // the connection itself stays usable
    assert_eq!(fixture.client.connections().len(), 1);
    assert!(fixture.client.connections()[0].is_connected());
}

#[test]
fn test_pull_fails_when_peer_disconnects() {
    init_tracing();
    let data = random_bytes(BLOCK_SIZE + 10);
    let list = BlockList::from_bytes(&data);

    let peer = TestPeer::new("dropping").unwrap();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let announced = data.clone();
    let script = spawn_peer(peer, client_id, move |session| {
        session.exchange_cluster_config(&["default"], 1)?;
        session.send(Index {
            folder: "default".to_string(),
            files: vec![wire_file("gone.bin", &announced, 100, 1)],
        })?;
        session.recv_until(|m| match m {
            Message::Request(r) => Some(r),
            _ => None,
        })?;
        session.shutdown();
        Ok(())
    });

    let file_info = FileInfo::file("default", "gone.bin", data.len() as u64, list.hash, 100_000).unwrap();
    let observer = fixture.client.pull_file(&file_info).unwrap();
    let started = Instant::now();
    assert!(observer.wait_for_complete().is_err());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!observer.is_completed());
    drop(script.join().unwrap());
}

#[test]
fn test_pull_unknown_file_fails() {
    init_tracing();
    let peer = TestPeer::new("empty").unwrap();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        session.exchange_cluster_config(&["default"], 0)?;
        Ok(())
    });

    let file_info = FileInfo::file("default", "nope.bin", 10, "00", 1).unwrap();
    assert!(fixture.client.pull_file(&file_info).is_err());
    drop(script.join().unwrap());
}

// ============================================================================
// Uploads
// ============================================================================

#[test]
fn test_push_completes_only_after_index_echo() {
    init_tracing();
    let data = random_bytes(BLOCK_SIZE + 4096);
    let peer = TestPeer::new("sink").unwrap();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let (served_tx, served_rx) = mpsc::channel();
    let (echo_tx, echo_rx) = mpsc::channel::<()>();
    let script = spawn_peer(peer, client_id, move |session| {
        session.exchange_cluster_config(&["default"], 0)?;
        let update = session.recv_until(|m| match m {
            Message::IndexUpdate(update) => Some(update),
            _ => None,
        })?;
        let record = update.files[0].clone();
        let content = session.fetch_blocks("default", &record)?;
        served_tx.send(content)?;

        echo_rx.recv_timeout(Duration::from_secs(10))?;
        let mut echo = record.clone();
        echo.sequence = 1;
        session.send(IndexUpdate {
            folder: "default".to_string(),
            files: vec![echo],
        })?;
        Ok(record)
    });

    let observer = fixture
        .client
        .push_file(Cursor::new(data.clone()), "default", "up/new.bin")
        .unwrap();

    let fetched = served_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(fetched == data);
    // every block went out, but the peer has not indexed the file yet
    assert!(!observer.is_completed());

    echo_tx.send(()).unwrap();
    observer.wait_for_complete().unwrap();
    assert!(observer.is_completed());
    assert_eq!(observer.progress_percentage(), 100);

    let (_session, record) = script.join().unwrap().unwrap();
    assert_eq!(record.name, "up/new.bin");
    assert_eq!(record.r#type, FileInfoType::File as i32);
    assert_eq!(record.size, data.len() as i64);
    assert!(record.no_permissions);
    let counters = record.version.unwrap().counters;
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0].id, client_id.counter_id());

    observer.close().unwrap();
    let indexed = fixture
        .client
        .index_handler()
        .get_file_info_by_path("default", "up/new.bin")
        .unwrap()
        .unwrap();
    assert_eq!(indexed.hash.as_deref(), Some(BlockList::from_bytes(&data).hash.as_str()));
}

#[test]
fn test_push_fails_when_peer_disconnects() {
    init_tracing();
    let data = random_bytes(4096);
    let peer = TestPeer::new("vanishing").unwrap();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        session.exchange_cluster_config(&["default"], 0)?;
        session.recv_until(|m| match m {
            Message::IndexUpdate(update) => Some(update),
            _ => None,
        })?;
        session.shutdown();
        Ok(())
    });

    let observer = fixture
        .client
        .push_file(Cursor::new(data), "default", "lost.bin")
        .unwrap();
    let started = Instant::now();
    assert!(observer.wait_for_complete().is_err());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!observer.is_completed());
    drop(script.join().unwrap());
}

#[test]
fn test_push_dir_and_delete() {
    init_tracing();
    let peer = TestPeer::new("editor").unwrap();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        session.exchange_cluster_config(&["default"], 1)?;
        session.send(Index {
            folder: "default".to_string(),
            files: vec![wire_dir("old", 50, 1)],
        })?;
        let mut updates = Vec::new();
        while updates.len() < 2 {
            let update = session.recv_until(|m| match m {
                Message::IndexUpdate(update) => Some(update),
                _ => None,
            })?;
            updates.push(update);
        }
        Ok(updates)
    });

    let mkdir = fixture.client.push_dir("default", "new-dir").unwrap();
    mkdir.wait_for_complete().unwrap();
    assert!(mkdir.is_completed().unwrap());
    let stored = mkdir.close().unwrap().unwrap();
    assert_eq!(stored.file_type, FileType::Directory);

    let delete = fixture.client.push_delete("default", "old").unwrap();
    delete.wait_for_complete().unwrap();
    let tombstone = delete.close().unwrap().unwrap();
    assert!(tombstone.deleted);
    assert_eq!(tombstone.file_type, FileType::Directory);

    let (_session, updates) = script.join().unwrap().unwrap();
    let dir = &updates[0].files[0];
    assert_eq!(dir.name, "new-dir");
    assert_eq!(dir.r#type, FileInfoType::Directory as i32);
    assert!(!dir.deleted);

    let deleted = &updates[1].files[0];
    assert_eq!(deleted.name, "old");
    assert!(deleted.deleted);
    assert_eq!(deleted.r#type, FileInfoType::Directory as i32);
    // the peer's version is kept and ours appended
    let counters = &deleted.version.as_ref().unwrap().counters;
    assert_eq!(counters.len(), 2);
    assert_eq!(counters[1].id, client_id.counter_id());
    assert!(deleted.sequence > dir.sequence);
}

#[test]
fn test_push_delete_of_unknown_path_fails() {
    init_tracing();
    let peer = TestPeer::new("strict").unwrap();
    let fixture = ClientFixture::new(&peer, &["default"]).unwrap();
    let client_id = fixture.client.device_id();

    let script = spawn_peer(peer, client_id, |session| {
        session.exchange_cluster_config(&["default"], 0)?;
        Ok(())
    });
    assert!(fixture.client.push_delete("default", "ghost").is_err());
    drop(script.join().unwrap());
}
