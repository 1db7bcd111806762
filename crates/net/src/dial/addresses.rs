//! Candidate address calculation for the dial pipeline.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_primitives::{
    append_peer_id, dedup_addresses, dns_scheme, extract_peer_id, Multiaddr, PeerAddress, PeerId,
};

use super::{DialQueueInner, DialTarget};
use crate::error::{DialError, PeerStoreError};

/// Split a dial target into the requested peer and any explicit addresses.
///
/// When addresses embed peer ids, they must all agree; the common id
/// becomes the requested peer unless one was given explicitly.
pub(super) fn normalize_target(
    target: DialTarget,
) -> Result<(Option<PeerId>, Vec<PeerAddress>), DialError> {
    let (explicit_peer, addrs) = match target {
        DialTarget::Peer(peer) => (Some(peer), Vec::new()),
        DialTarget::Addrs(addrs) => (None, addrs),
        DialTarget::PeerWithAddrs(peer, addrs) => (Some(peer), addrs),
    };

    let mut embedded: Option<PeerId> = None;
    for addr in &addrs {
        if let Some(peer) = extract_peer_id(addr) {
            match embedded {
                Some(previous) if previous != peer => {
                    return Err(DialError::InvalidParameters(format!(
                        "addresses embed different peer ids: {previous} and {peer}"
                    )));
                }
                _ => embedded = Some(peer),
            }
        }
    }

    Ok((explicit_peer.or(embedded), addrs.into_iter().map(PeerAddress::from).collect()))
}

/// Expand, vet and order the candidate addresses for one dial request.
///
/// The returned order defines the dial-attempt priority.
pub(super) async fn calculate(
    inner: &DialQueueInner,
    peer_id: Option<PeerId>,
    given: Vec<PeerAddress>,
    cancel: &CancellationToken,
) -> Result<Vec<Multiaddr>, DialError> {
    if let Some(peer) = &peer_id {
        if *peer == inner.local_peer {
            return Err(DialError::DialedSelf);
        }
        if inner.gater.deny_dial_peer(peer) {
            return Err(DialError::PeerDialIntercepted);
        }
    }

    // Fall back to the peer store when no addresses were given. Not
    // knowing the peer is tolerated here; it surfaces as having no valid
    // addresses below.
    let mut addrs = given;
    if addrs.is_empty() {
        if let Some(peer) = &peer_id {
            addrs = match inner.peer_store.addresses(peer) {
                Ok(known) => known,
                Err(PeerStoreError::NotFound) => Vec::new(),
                Err(error) => {
                    warn!(peer = %peer, %error, "peer store lookup failed");
                    Vec::new()
                }
            };
        }
    }

    // Expand resolvable addresses (1:N), inheriting certification from
    // the address that resolved.
    let mut resolved = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let resolver = dns_scheme(&addr.multiaddr)
            .and_then(|scheme| inner.resolvers.get(scheme));
        match resolver {
            Some(resolver) => {
                let expansion = tokio::select! {
                    expansion = resolver.resolve(&addr.multiaddr) => expansion,
                    _ = cancel.cancelled() => return Err(DialError::Aborted),
                };
                match expansion {
                    Ok(expanded) => resolved.extend(
                        expanded
                            .into_iter()
                            .map(|multiaddr| PeerAddress { multiaddr, certified: addr.certified }),
                    ),
                    Err(error) => {
                        warn!(addr = %addr.multiaddr, %error, "address resolution failed");
                    }
                }
            }
            None => resolved.push(addr),
        }
    }

    // Keep only addresses some transport claims, whose embedded identity
    // does not contradict the requested peer.
    let filtered: Vec<PeerAddress> = resolved
        .into_iter()
        .filter(|addr| {
            if inner.transports.transport_for_multiaddr(&addr.multiaddr).is_none() {
                return false;
            }
            match (&peer_id, extract_peer_id(&addr.multiaddr)) {
                (Some(requested), Some(embedded)) => *requested == embedded,
                _ => true,
            }
        })
        .collect();

    let deduped = dedup_addresses(filtered);
    if deduped.is_empty() {
        return Err(DialError::NoValidAddresses);
    }
    if deduped.len() > inner.config.max_peer_addrs_to_dial {
        return Err(DialError::TooManyAddresses {
            count: deduped.len(),
            limit: inner.config.max_peer_addrs_to_dial,
        });
    }

    // Make every candidate carry the peer identity so the upgrade can
    // verify who it reaches.
    let mut candidates: Vec<PeerAddress> = match peer_id {
        Some(peer) => deduped
            .into_iter()
            .map(|addr| PeerAddress {
                multiaddr: append_peer_id(addr.multiaddr, peer),
                certified: addr.certified,
            })
            .collect(),
        None => deduped,
    };

    candidates.retain(|addr| {
        let denied = inner.gater.deny_dial_multiaddr(&addr.multiaddr);
        if denied {
            debug!(addr = %addr.multiaddr, "candidate address denied by gater");
        }
        !denied
    });
    if candidates.is_empty() {
        return Err(DialError::NoValidAddresses);
    }

    // Stable sort: the sorter decides priority, arrival order breaks ties.
    candidates.sort_by(|a, b| inner.sorter.compare(a, b));

    Ok(candidates.into_iter().map(|addr| addr.multiaddr).collect())
}
