//! Connection gating policy hooks.

use tether_primitives::{Multiaddr, PeerId};

/// Policy hooks consulted at fixed points of the dial and upgrade
/// lifecycles. Returning `true` denies the operation.
///
/// Every hook defaults to allowing, so implementors only override the
/// decision points they care about.
pub trait ConnectionGater: Send + Sync + 'static {
    /// Deny dialing `peer` at all, before any address is considered.
    fn deny_dial_peer(&self, _peer: &PeerId) -> bool {
        false
    }

    /// Deny one specific candidate address. Denied addresses are dropped
    /// from the candidate set rather than failing the whole dial.
    fn deny_dial_multiaddr(&self, _addr: &Multiaddr) -> bool {
        false
    }

    /// Deny an accepted raw connection before any upgrade work.
    fn deny_inbound_connection(&self, _remote_addr: &Multiaddr) -> bool {
        false
    }

    /// Deny an outbound raw connection before any upgrade work. Only
    /// consulted when the remote identity is already known.
    fn deny_outbound_connection(&self, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        false
    }

    /// Deny an inbound connection once the remote identity is
    /// authenticated.
    fn deny_inbound_encrypted_connection(&self, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        false
    }

    /// Deny an outbound connection once the remote identity is
    /// authenticated.
    fn deny_outbound_encrypted_connection(&self, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        false
    }

    /// Deny a fully upgraded inbound connection, as the last step before
    /// it goes live.
    fn deny_inbound_upgraded_connection(&self, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        false
    }

    /// Deny a fully upgraded outbound connection, as the last step before
    /// it goes live.
    fn deny_outbound_upgraded_connection(&self, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        false
    }
}

/// Allow-everything gater.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConnectionGater;

impl ConnectionGater for NoopConnectionGater {}
