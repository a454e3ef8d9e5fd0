//! A scripted BEP peer for driving the client over real TLS sockets.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bep_core::{BlockList, DeviceAddress, DeviceId};
use bep_net::{Keystore, KeystoreLoader, TlsReader, TlsSocket, TlsWriter, Transport};
use bep_proto::bep::{self, ClusterConfig, Device, FileInfoType, Folder, Hello, Request, Response};
use bep_proto::{read_frame, read_hello, write_frame, write_hello, Message};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Error type of the test helpers.
pub type TestError = Box<dyn std::error::Error + Send + Sync>;

/// Result type of the test helpers.
pub type TestResult<T> = Result<T, TestError>;

/// Index id the test peer announces for its own index.
pub const PEER_INDEX_ID: u64 = 0x5eed;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A device with its own identity listening on loopback.
pub struct TestPeer {
    /// Name sent in Hello
    pub name: String,
    keystore: Arc<Keystore>,
    transport: Transport,
    listener: TcpListener,
    addr: SocketAddr,
}

impl TestPeer {
    /// Generates an identity and binds an ephemeral loopback port.
    pub fn new(name: &str) -> TestResult<Self> {
        let (keystore, _) = KeystoreLoader::new().generate()?;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        info!(device_id = %keystore.device_id(), addr = %addr, "test peer listening");
        Ok(Self {
            name: name.to_string(),
            transport: Transport::new(keystore.clone()),
            keystore,
            listener,
            addr,
        })
    }

    /// Device id of the peer.
    pub fn device_id(&self) -> DeviceId {
        self.keystore.device_id()
    }

    /// `tcp://` URL of the listener.
    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Address record for dialing the peer.
    pub fn device_address(&self) -> DeviceAddress {
        DeviceAddress::new(self.device_id(), self.url())
    }

    /// Accepts one TCP connection and returns it without starting TLS.
    pub fn accept_tcp(&self) -> TestResult<TcpStream> {
        let (tcp, remote) = self.listener.accept()?;
        debug!(remote = %remote, "test peer holding raw tcp connection");
        Ok(tcp)
    }

    /// Accepts one connection and completes TLS, but sends no Hello.
    pub fn accept_tls(&self, expected: Option<DeviceId>) -> TestResult<TlsSocket> {
        let (tcp, remote) = self.listener.accept()?;
        debug!(remote = %remote, "test peer accepted tcp connection");
        let socket = self.transport.accept(tcp, expected)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(socket)
    }

    /// Accepts one connection and exchanges Hello.
    ///
    /// `expected` pins the certificate of the connecting device.
    pub fn accept(&self, expected: Option<DeviceId>) -> TestResult<PeerSession> {
        let socket = self.accept_tls(expected)?;
        let mut reader = socket.reader();
        let mut writer = socket.writer();
        let hello = read_hello(&mut reader)?;
        write_hello(
            &mut writer,
            &Hello {
                device_name: self.name.clone(),
                client_name: "bep-test-peer".to_string(),
                client_version: "0.0.0".to_string(),
            },
        )?;
        info!(remote = %socket.peer_device_id(), name = %hello.device_name, "test peer session open");
        Ok(PeerSession {
            local_id: self.device_id(),
            socket,
            reader,
            writer,
            hello,
        })
    }
}

/// One accepted connection, read and written from the test thread.
pub struct PeerSession {
    local_id: DeviceId,
    socket: TlsSocket,
    reader: TlsReader,
    writer: TlsWriter,
    /// Hello received from the client
    pub hello: Hello,
}

impl PeerSession {
    /// Device id of the connected client.
    pub fn remote_id(&self) -> DeviceId {
        self.socket.peer_device_id()
    }

    /// Writes one message frame.
    pub fn send(&mut self, message: impl Into<Message>) -> TestResult<()> {
        let message = message.into();
        debug!(message_type = ?message.message_type(), "test peer sending");
        write_frame(&mut self.writer, &message)?;
        Ok(())
    }

    /// Writes raw bytes, for frames the client must cope with.
    pub fn send_raw(&mut self, bytes: &[u8]) -> TestResult<()> {
        use std::io::Write;
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Reads the next message.
    pub fn recv(&mut self) -> TestResult<Message> {
        Ok(read_frame(&mut self.reader)?)
    }

    /// Reads messages until `select` accepts one, dropping the rest.
    pub fn recv_until<T, F>(&mut self, mut select: F) -> TestResult<T>
    where
        F: FnMut(Message) -> Option<T>,
    {
        loop {
            let message = self.recv()?;
            let message_type = message.message_type();
            match select(message) {
                Some(value) => return Ok(value),
                None => debug!(?message_type, "test peer skipping message"),
            }
        }
    }

    /// Completes the connection setup: reads the client's cluster config
    /// and answers with one sharing `folders` with the client.
    pub fn exchange_cluster_config(&mut self, folders: &[&str], max_sequence: i64) -> TestResult<ClusterConfig> {
        let received = self.recv_until(|m| match m {
            Message::ClusterConfig(c) => Some(c),
            _ => None,
        })?;
        let config = self.cluster_config(folders, max_sequence);
        self.send(config)?;
        Ok(received)
    }

    /// Cluster config listing this peer and the client on every folder.
    pub fn cluster_config(&self, folders: &[&str], max_sequence: i64) -> ClusterConfig {
        let remote = self.remote_id();
        ClusterConfig {
            folders: folders
                .iter()
                .map(|folder| Folder {
                    id: folder.to_string(),
                    label: format!("{folder} label"),
                    devices: vec![
                        Device {
                            id: self.local_id.to_hash_data(),
                            name: "peer".to_string(),
                            index_id: PEER_INDEX_ID,
                            max_sequence,
                            ..Default::default()
                        },
                        Device {
                            id: remote.to_hash_data(),
                            name: self.hello.device_name.clone(),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                })
                .collect(),
        }
    }

    /// Answers `count` block requests from `data`, returning the requests.
    pub fn serve_requests(&mut self, data: &[u8], count: usize) -> TestResult<Vec<Request>> {
        let mut served = Vec::with_capacity(count);
        while served.len() < count {
            let request = self.recv_until(|m| match m {
                Message::Request(r) => Some(r),
                _ => None,
            })?;
            let start = request.offset as usize;
            let end = start + request.size as usize;
            self.send(Response {
                id: request.id,
                data: data[start..end].to_vec(),
                code: bep::ErrorCode::NoError as i32,
            })?;
            served.push(request);
        }
        Ok(served)
    }

    /// Requests every block of `record` from the client and returns the
    /// reassembled content.
    pub fn fetch_blocks(&mut self, folder: &str, record: &bep::FileInfo) -> TestResult<Vec<u8>> {
        let mut content = vec![0u8; record.size as usize];
        for (i, block) in record.blocks.iter().enumerate() {
            let id = i as i32 + 1;
            self.send(Request {
                id,
                folder: folder.to_string(),
                name: record.name.clone(),
                offset: block.offset,
                size: block.size,
                hash: block.hash.clone(),
                from_temporary: false,
            })?;
            let response = self.recv_until(|m| match m {
                Message::Response(r) if r.id == id => Some(r),
                _ => None,
            })?;
            if response.code != bep::ErrorCode::NoError as i32 {
                return Err(format!("block {i} refused with code {}", response.code).into());
            }
            let digest = Sha256::digest(&response.data);
            if digest.as_slice() != block.hash.as_slice() {
                return Err(format!(
                    "block {i} has hash {}, expected {}",
                    hex::encode(digest),
                    hex::encode(&block.hash)
                )
                .into());
            }
            let start = block.offset as usize;
            content[start..start + response.data.len()].copy_from_slice(&response.data);
        }
        Ok(content)
    }

    /// Shuts the socket down.
    pub fn shutdown(&self) {
        self.socket.shutdown();
    }
}

/// Wire record for `data` stored as `name`.
pub fn wire_file(name: &str, data: &[u8], modified_s: i64, sequence: i64) -> bep::FileInfo {
    let list = BlockList::from_bytes(data);
    bep::FileInfo {
        name: name.to_string(),
        r#type: FileInfoType::File as i32,
        size: list.size as i64,
        modified_s,
        sequence,
        version: Some(bep::Vector {
            counters: vec![bep::Counter {
                id: 1,
                value: sequence as u64,
            }],
        }),
        blocks: list
            .blocks
            .iter()
            .map(|b| bep::BlockInfo {
                offset: b.offset as i64,
                size: b.size as i32,
                hash: b.hash_bytes().unwrap_or_default(),
                weak_hash: 0,
            })
            .collect(),
        ..Default::default()
    }
}

/// Wire record of a directory.
pub fn wire_dir(name: &str, modified_s: i64, sequence: i64) -> bep::FileInfo {
    bep::FileInfo {
        name: name.to_string(),
        r#type: FileInfoType::Directory as i32,
        modified_s,
        sequence,
        version: Some(bep::Vector {
            counters: vec![bep::Counter {
                id: 1,
                value: sequence as u64,
            }],
        }),
        ..Default::default()
    }
}
