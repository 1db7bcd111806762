//! In-memory peer store (does not persist across restarts).

use std::collections::HashMap;

use parking_lot::RwLock;

use tether_primitives::{dedup_addresses, PeerAddress, PeerId};

use super::PeerStore;
use crate::error::PeerStoreError;

#[derive(Debug, Clone, Default)]
struct PeerRecord {
    addresses: Vec<PeerAddress>,
    protocols: Vec<String>,
    metadata: HashMap<String, Vec<u8>>,
}

/// In-memory [`PeerStore`] for tests and embedders without persistence.
#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `addrs` as known addresses of `peer`, merging by address
    /// equality with certification OR-ed together.
    pub fn add_addresses(&self, peer: &PeerId, addrs: Vec<PeerAddress>) {
        let mut peers = self.peers.write();
        let record = peers.entry(*peer).or_default();
        let mut merged = std::mem::take(&mut record.addresses);
        merged.extend(addrs);
        record.addresses = dedup_addresses(merged);
    }

    /// Protocols the peer is known to speak.
    pub fn protocols(&self, peer: &PeerId) -> Vec<String> {
        self.peers.read().get(peer).map(|record| record.protocols.clone()).unwrap_or_default()
    }

    /// One metadata value, if set.
    pub fn metadata(&self, peer: &PeerId, key: &str) -> Option<Vec<u8>> {
        self.peers.read().get(peer).and_then(|record| record.metadata.get(key).cloned())
    }
}

impl PeerStore for MemoryPeerStore {
    fn addresses(&self, peer: &PeerId) -> Result<Vec<PeerAddress>, PeerStoreError> {
        Ok(self.peers.read().get(peer).map(|record| record.addresses.clone()).unwrap_or_default())
    }

    fn merge_protocols(&self, peer: &PeerId, protocols: &[String]) -> Result<(), PeerStoreError> {
        let mut peers = self.peers.write();
        let record = peers.entry(*peer).or_default();
        for protocol in protocols {
            if !record.protocols.contains(protocol) {
                record.protocols.push(protocol.clone());
            }
        }
        Ok(())
    }

    fn patch_metadata(
        &self,
        peer: &PeerId,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), PeerStoreError> {
        let mut peers = self.peers.write();
        peers.entry(*peer).or_default().metadata.insert(key.to_string(), value);
        Ok(())
    }
}
