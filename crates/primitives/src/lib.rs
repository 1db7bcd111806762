//! Address and identity primitives shared by the tether transport runtime.
//!
//! Re-exports the peer identity and multiaddr types the rest of the
//! workspace builds on, together with the handful of helpers the dial and
//! upgrade pipelines need to reason about addresses.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub use libp2p_identity::PeerId;
pub use multiaddr::{Multiaddr, Protocol};

mod address;
pub use address::{
    append_peer_id, dedup_addresses, dns_scheme, extract_peer_id, is_loopback, is_path_address,
    PeerAddress,
};

/// Direction in which a connection or stream was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Opened by the remote peer.
    Inbound,
    /// Opened by the local peer.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// Lifecycle timestamps of a connection, in Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionTimeline {
    /// When the transport established the raw link.
    pub open: u64,
    /// When the upgrade completed. Set once, before the connection is
    /// handed to any consumer.
    pub upgraded: Option<u64>,
    /// When the connection reached its terminal state.
    pub close: Option<u64>,
}

/// Lifecycle timestamps of a stream, in Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamTimeline {
    /// When the stream finished protocol negotiation.
    pub open: u64,
    /// When the stream was closed.
    pub close: Option<u64>,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
