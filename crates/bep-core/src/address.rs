//! Peer addresses as announced by discovery or configured statically.
//!
//! Addresses are URLs: `tcp://host:port`, `relay://host:port/?id=...`,
//! `relay-http://...` and `relay-https://...`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, ToSocketAddrs};

use url::Url;

use crate::time::now_millis;
use crate::{CoreError, DeviceId};

/// Default TCP port of a BEP listener.
pub const DEFAULT_TCP_PORT: u16 = 22000;
/// Default port of a relay server.
pub const DEFAULT_RELAY_PORT: u16 = 22067;

/// Transport selected by an address scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    /// Direct TCP + TLS
    Tcp,
    /// Relay protocol session
    Relay,
    /// HTTP relay
    HttpRelay,
    /// HTTPS relay
    HttpsRelay,
    /// Unrecognized scheme
    Other,
    /// Empty address
    Null,
}

impl AddressType {
    fn default_port(self) -> Option<u16> {
        match self {
            AddressType::Tcp => Some(DEFAULT_TCP_PORT),
            AddressType::Relay => Some(DEFAULT_RELAY_PORT),
            AddressType::HttpRelay => Some(80),
            AddressType::HttpsRelay => Some(443),
            AddressType::Other | AddressType::Null => None,
        }
    }
}

/// Where an address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressProducer {
    /// LAN broadcast
    LocalDiscovery,
    /// Global discovery server
    GlobalDiscovery,
    /// Configured or unknown
    #[default]
    Unknown,
}

/// A candidate address for a device. Identity is (device, address).
#[derive(Debug, Clone)]
pub struct DeviceAddress {
    /// Target device
    pub device_id: DeviceId,
    /// Announcing instance, if known
    pub instance_id: Option<u64>,
    /// Raw address URL
    pub address: String,
    /// Address source
    pub producer: AddressProducer,
    /// Ranking score, lower is better; `i32::MAX` means untested
    pub score: i32,
    /// When the address was last seen, ms since epoch
    pub last_modified: i64,
}

impl DeviceAddress {
    /// Creates an untested address.
    pub fn new(device_id: DeviceId, address: impl Into<String>) -> Self {
        Self {
            device_id,
            instance_id: None,
            address: address.into(),
            producer: AddressProducer::Unknown,
            score: i32::MAX,
            last_modified: now_millis(),
        }
    }

    /// Returns a copy carrying `score`.
    pub fn with_score(&self, score: i32) -> Self {
        Self {
            score,
            last_modified: now_millis(),
            ..self.clone()
        }
    }

    /// Returns a copy attributed to `producer`.
    pub fn with_producer(mut self, producer: AddressProducer) -> Self {
        self.producer = producer;
        self
    }

    /// Scheme-derived transport type.
    pub fn address_type(&self) -> AddressType {
        if self.address.is_empty() {
            return AddressType::Null;
        }
        match self.address.split_once("://").map(|(scheme, _)| scheme) {
            Some("tcp") => AddressType::Tcp,
            Some("relay") => AddressType::Relay,
            Some("relay-http") => AddressType::HttpRelay,
            Some("relay-https") => AddressType::HttpsRelay,
            _ => AddressType::Other,
        }
    }

    /// True once a connection attempt scored this address.
    pub fn is_working(&self) -> bool {
        self.score < i32::MAX
    }

    fn url(&self) -> Result<Url, CoreError> {
        Url::parse(&self.address)
            .map_err(|e| CoreError::InvalidAddress(format!("{}: {e}", self.address)))
    }

    /// Resolves host and port (falling back to the scheme's default port).
    pub fn socket_addr(&self) -> Result<SocketAddr, CoreError> {
        let url = self.url()?;
        let host = url
            .host_str()
            .ok_or_else(|| CoreError::InvalidAddress(format!("{}: missing host", self.address)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url
            .port()
            .or_else(|| self.address_type().default_port())
            .ok_or_else(|| CoreError::InvalidAddress(format!("{}: missing port", self.address)))?;

        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| CoreError::InvalidAddress(format!("{}: unresolved", self.address)))
    }

    /// Returns the value of a query parameter, e.g. `id` of a relay URL.
    pub fn uri_param(&self, key: &str) -> Option<String> {
        let url = self.url().ok()?;
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// True when the query parameter is present and non-empty.
    pub fn has_uri_param(&self, key: &str) -> bool {
        self.uri_param(key).is_some_and(|v| !v.is_empty())
    }
}

impl PartialEq for DeviceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.device_id == other.device_id && self.address == other.address
    }
}

impl Eq for DeviceAddress {}

impl Hash for DeviceAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.device_id.hash(state);
        self.address.hash(state);
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.device_id.short_id(), self.address)
    }
}
