//! Error types of the transport runtime core.

use tether_primitives::{Multiaddr, PeerId};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the dial pipeline.
///
/// `Clone` so that callers joining the same pending dial can all observe
/// its outcome; transport failures are carried as rendered messages.
#[derive(Debug, Clone, Error)]
pub enum DialError {
    /// The dial target was the local peer itself.
    #[error("refusing to dial self")]
    DialedSelf,

    /// The connection gater denied dialing the peer.
    #[error("dial of peer was intercepted by the connection gater")]
    PeerDialIntercepted,

    /// No dialable address survived resolution, filtering and gating.
    #[error("no valid addresses to dial")]
    NoValidAddresses,

    /// More candidate addresses than the configured cap.
    #[error("{count} candidate addresses exceed the limit of {limit}")]
    TooManyAddresses { count: usize, limit: usize },

    /// The dial target was malformed.
    #[error("invalid dial parameters: {0}")]
    InvalidParameters(String),

    /// A transport failed to establish a connection to an address.
    #[error("dial of {addr} failed: {message}")]
    Transport { addr: Multiaddr, message: String },

    /// The dial was aborted before completion.
    #[error("dial aborted")]
    Aborted,

    /// The dial did not complete within the configured timeout.
    #[error("dial timed out")]
    Timeout,

    /// Every candidate address failed.
    #[error("all {} dial attempts failed", .0.len())]
    Aggregate(Vec<DialError>),
}

/// Errors produced while upgrading a raw connection.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The connection gater denied the raw connection.
    #[error("connection denied")]
    ConnectionDenied,

    /// The connection gater intercepted the connection after encryption
    /// or after the upgrade completed.
    #[error("connection intercepted")]
    ConnectionIntercepted,

    /// The private-network protector rejected the connection.
    #[error("connection protection failed")]
    Protection(#[source] std::io::Error),

    /// Encryption negotiation or handshake failed.
    #[error("encryption failed")]
    EncryptionFailed(#[source] BoxError),

    /// No muxer could be negotiated.
    #[error("muxer unavailable")]
    MuxerUnavailable(#[source] BoxError),

    /// Encryption was skipped on an inbound connection whose address does
    /// not embed a peer id.
    #[error("multiaddr does not embed a peer id")]
    InvalidMultiaddr,

    /// Encryption was skipped on an outbound connection with no remote
    /// peer id to authenticate against.
    #[error("no remote peer id for natively encrypted connection")]
    InvalidPeer,

    /// The upgrade did not complete within the inbound upgrade timeout.
    #[error("upgrade timed out")]
    Timeout,
}

/// Errors from operations on an upgraded [`Connection`](crate::Connection).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection has no stream muxer; streams cannot be opened.
    #[error("connection is not multiplexed")]
    NotMultiplexed,

    /// The connection is closing or closed.
    #[error("connection is not open")]
    NotOpen,

    /// Opening another outbound stream would exceed the protocol's cap.
    #[error("too many outbound streams for {protocol} (limit {limit})")]
    TooManyOutboundStreams { protocol: String, limit: usize },

    /// Accepting another inbound stream would exceed the protocol's cap.
    #[error("too many inbound streams for {protocol} (limit {limit})")]
    TooManyInboundStreams { protocol: String, limit: usize },

    /// The handler for the stream's protocol does not run on transient
    /// connections.
    #[error("handler for {protocol} does not accept transient connections")]
    TransientConnection { protocol: String },

    /// No handler is registered for the negotiated protocol.
    #[error(transparent)]
    NoHandler(#[from] RegistrarError),

    /// Stream protocol negotiation failed.
    #[error("stream negotiation failed")]
    Negotiation(#[from] NegotiationError),

    /// The muxer refused the operation.
    #[error(transparent)]
    Muxer(#[from] MuxerError),

    /// The operation was aborted by the caller's signal.
    #[error("operation aborted")]
    Aborted,

    /// The operation hit its default timeout.
    #[error("operation timed out")]
    Timeout,

    /// Closing the underlying transport failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from multi-codec capability negotiation.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The remote supports none of the offered capabilities.
    #[error("no protocol supported among {offered:?}")]
    Unsupported { offered: Vec<String> },

    /// The negotiation exchange failed.
    #[error("negotiation io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a connection encrypter.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// The authenticated remote did not match the expected peer.
    #[error("remote peer {actual} does not match expected {expected}")]
    PeerMismatch { expected: PeerId, actual: PeerId },

    /// The cryptographic handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The handshake exchange failed at the transport level.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a stream muxer.
#[derive(Debug, Error)]
pub enum MuxerError {
    /// The muxer has already shut down.
    #[error("muxer is closed")]
    Closed,

    /// The muxed connection failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a transport driver dial.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The dial attempt was aborted by its signal.
    #[error("dial aborted")]
    Aborted,

    /// The transport could not establish the raw connection.
    #[error("dial failed: {0}")]
    Failed(String),

    /// The raw connection was established but could not be upgraded.
    #[error("upgrade failed")]
    Upgrade(#[from] UpgradeError),

    /// The dial failed at the socket level.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the protocol handler registry.
#[derive(Debug, Clone, Error)]
pub enum RegistrarError {
    /// No handler is registered for the protocol.
    #[error("no handler registered for protocol {0}")]
    NoHandler(String),
}

/// Errors from the peer store.
#[derive(Debug, Clone, Error)]
pub enum PeerStoreError {
    /// The peer is not known to the store.
    #[error("peer not found")]
    NotFound,

    /// The backing store failed.
    #[error("peer store backend: {0}")]
    Backend(String),
}
