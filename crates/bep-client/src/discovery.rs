//! Candidate addresses of peer devices.

use std::sync::Arc;

use bep_core::{AddressProducer, AddressType, Configuration, DeviceAddress, DeviceId};
use parking_lot::RwLock;
use tracing::trace;

/// Source of candidate addresses for a device.
pub trait AddressSupplier: Send + Sync {
    /// Addresses for `device_id`, best first.
    fn addresses(&self, device_id: &DeviceId) -> Vec<DeviceAddress>;

    /// Records the outcome of a connection attempt.
    fn report(&self, _address: &DeviceAddress, _working: bool) {}
}

/// Orders addresses by score (lower is better), then by recency.
pub fn rank(addresses: &mut [DeviceAddress]) {
    addresses.sort_by(|a, b| a.score.cmp(&b.score).then(b.last_modified.cmp(&a.last_modified)));
}

/// Addresses from the configured peers plus any added at runtime.
pub struct StaticAddressSupplier {
    config: Option<Arc<Configuration>>,
    extra: RwLock<Vec<DeviceAddress>>,
}

impl StaticAddressSupplier {
    /// Supplies the static addresses of configured peers.
    pub fn new(config: Arc<Configuration>) -> Self {
        Self {
            config: Some(config),
            extra: RwLock::new(Vec::new()),
        }
    }

    /// Supplies a fixed list.
    pub fn from_addresses(addresses: Vec<DeviceAddress>) -> Self {
        Self {
            config: None,
            extra: RwLock::new(addresses),
        }
    }

    /// Adds an address, replacing an equal one.
    pub fn add(&self, address: DeviceAddress) {
        let mut extra = self.extra.write();
        extra.retain(|a| !(a.device_id == address.device_id && a.address == address.address));
        extra.push(address);
    }
}

impl AddressSupplier for StaticAddressSupplier {
    fn addresses(&self, device_id: &DeviceId) -> Vec<DeviceAddress> {
        let mut list: Vec<DeviceAddress> = self
            .extra
            .read()
            .iter()
            .filter(|a| &a.device_id == device_id)
            .cloned()
            .collect();

        if let Some(peer) = self.config.as_ref().and_then(|c| c.peer(device_id)) {
            for address in peer.addresses {
                if list.iter().any(|a| a.address == address) {
                    continue;
                }
                let candidate = DeviceAddress::new(*device_id, address).with_producer(AddressProducer::Unknown);
                match candidate.address_type() {
                    AddressType::Tcp | AddressType::Relay => list.push(candidate),
                    other => trace!(address = %candidate.address, ?other, "skipping unsupported address"),
                }
            }
        }
        rank(&mut list);
        list
    }

    fn report(&self, address: &DeviceAddress, working: bool) {
        let score = if working { 0 } else { i32::MAX };
        self.add(address.with_score(score));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bep_core::config::ConfigData;
    use bep_core::DeviceInfo;

    fn id(byte: u8) -> DeviceId {
        DeviceId::from_hash(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_configured_addresses() {
        let mut data = ConfigData::default();
        data.peers = vec![DeviceInfo::new(id(1), Some("peer"))
            .with_address("tcp://127.0.0.1:22000")
            .with_address("relay://10.0.0.1:22067/?id=x")
            .with_address("quic://127.0.0.1:22000")];
        let supplier = StaticAddressSupplier::new(Arc::new(Configuration::in_memory(data)));

        let list = supplier.addresses(&id(1));
        assert_eq!(list.len(), 2);
        assert!(supplier.addresses(&id(2)).is_empty());
    }

    #[test]
    fn test_report_ranks_working_first() {
        let supplier = StaticAddressSupplier::from_addresses(vec![
            DeviceAddress::new(id(1), "tcp://127.0.0.1:1"),
            DeviceAddress::new(id(1), "tcp://127.0.0.1:2"),
        ]);
        let second = supplier.addresses(&id(1))[1].clone();
        supplier.report(&second, true);

        let list = supplier.addresses(&id(1));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].address, second.address);
        assert!(list[0].is_working());
    }
}
