//! Multiaddr helpers for the dial and upgrade pipelines.

use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};

/// A known address for a peer together with its provenance.
///
/// `certified` marks addresses obtained from a record signed by the peer
/// itself rather than from third-party gossip. Two addresses are the same
/// address iff their multiaddrs are equal; certification survives
/// deduplication (see [`dedup_addresses`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// The address itself.
    pub multiaddr: Multiaddr,
    /// Whether the address came from a signed peer record.
    pub certified: bool,
}

impl PeerAddress {
    /// An uncertified address.
    pub fn new(multiaddr: Multiaddr) -> Self {
        Self { multiaddr, certified: false }
    }

    /// An address taken from a signed peer record.
    pub fn certified(multiaddr: Multiaddr) -> Self {
        Self { multiaddr, certified: true }
    }
}

impl From<Multiaddr> for PeerAddress {
    fn from(multiaddr: Multiaddr) -> Self {
        Self::new(multiaddr)
    }
}

/// The peer id embedded in the address, if any.
///
/// Relay addresses may carry several `/p2p/` components; the last one
/// names the peer the address ultimately points at.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter()
        .filter_map(|protocol| match protocol {
            Protocol::P2p(peer) => Some(peer),
            _ => None,
        })
        .last()
}

/// Whether the address is a pure path-style address (e.g. a unix socket).
pub fn is_path_address(addr: &Multiaddr) -> bool {
    matches!(addr.iter().next(), Some(Protocol::Unix(_)))
}

/// Append `/p2p/<peer>` unless the address already encodes a peer id or is
/// a path-style address.
pub fn append_peer_id(addr: Multiaddr, peer: PeerId) -> Multiaddr {
    if extract_peer_id(&addr).is_some() || is_path_address(&addr) {
        return addr;
    }
    addr.with(Protocol::P2p(peer))
}

/// Whether the address points at a loopback interface.
pub fn is_loopback(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => ip.is_loopback(),
        Some(Protocol::Ip6(ip)) => ip.is_loopback(),
        _ => false,
    }
}

/// The DNS scheme a resolver would be registered under, if the address
/// contains one.
pub fn dns_scheme(addr: &Multiaddr) -> Option<&'static str> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::Dnsaddr(_) => Some("dnsaddr"),
        Protocol::Dns(_) => Some("dns"),
        Protocol::Dns4(_) => Some("dns4"),
        Protocol::Dns6(_) => Some("dns6"),
        _ => None,
    })
}

/// Deduplicate addresses by equality, keeping first-seen order.
///
/// Certification merges by OR: an address reported both certified and
/// uncertified stays certified.
pub fn dedup_addresses(addrs: Vec<PeerAddress>) -> Vec<PeerAddress> {
    let mut out: Vec<PeerAddress> = Vec::with_capacity(addrs.len());
    for addr in addrs {
        match out.iter_mut().find(|seen| seen.multiaddr == addr.multiaddr) {
            Some(seen) => seen.certified |= addr.certified,
            None => out.push(addr),
        }
    }
    out
}
