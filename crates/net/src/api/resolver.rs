//! Address resolution and ordering seams.

use std::cmp::Ordering;

use async_trait::async_trait;

use tether_primitives::{is_loopback, Multiaddr, PeerAddress};

/// Expands resolvable addresses (e.g. `/dnsaddr/...`) into concrete ones.
///
/// Resolvers are registered per DNS scheme name; resolution may fan one
/// address out into many.
#[async_trait]
pub trait AddressResolver: Send + Sync + 'static {
    /// Resolve `addr` into one or more dialable addresses.
    async fn resolve(&self, addr: &Multiaddr) -> std::io::Result<Vec<Multiaddr>>;
}

/// Total order over candidate addresses; defines dial-attempt priority.
pub trait AddressSorter: Send + Sync + 'static {
    /// Compare two candidates; `Less` dials earlier.
    fn compare(&self, a: &PeerAddress, b: &PeerAddress) -> Ordering;
}

/// Certified addresses first, loopback last, otherwise stable.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAddressSorter;

impl AddressSorter for DefaultAddressSorter {
    fn compare(&self, a: &PeerAddress, b: &PeerAddress) -> Ordering {
        b.certified
            .cmp(&a.certified)
            .then_with(|| is_loopback(&a.multiaddr).cmp(&is_loopback(&b.multiaddr)))
    }
}
