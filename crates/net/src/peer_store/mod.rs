//! Peer store seam: known addresses, protocols and metadata per peer.

use tether_primitives::{PeerAddress, PeerId};

use crate::error::PeerStoreError;

mod memory;
pub use memory::MemoryPeerStore;

/// Persistent knowledge about remote peers.
///
/// Calls are synchronous and must be cheap. The dial and upgrade
/// pipelines treat writes as best-effort side effects: a failing store
/// never fails the primary operation.
#[auto_impl::auto_impl(&, Arc)]
pub trait PeerStore: Send + Sync + 'static {
    /// Known addresses for `peer`. An unknown peer yields an empty list.
    fn addresses(&self, peer: &PeerId) -> Result<Vec<PeerAddress>, PeerStoreError>;

    /// Merge `protocols` into the set the peer is known to speak.
    fn merge_protocols(&self, peer: &PeerId, protocols: &[String]) -> Result<(), PeerStoreError>;

    /// Set one metadata key to a byte value, replacing any previous value.
    fn patch_metadata(
        &self,
        peer: &PeerId,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), PeerStoreError>;
}
