//! Collaborator seams of the transport runtime.
//!
//! Everything the dial and upgrade pipelines need from the outside world
//! is injected through these traits: transport drivers, the private
//! network protector, connection encrypters, stream muxers, the
//! capability negotiation protocol, the protocol handler registry, and
//! address resolution.

mod encrypter;
mod gater;
mod muxer;
mod negotiator;
mod protector;
mod registrar;
mod resolver;
mod transport;

pub use encrypter::{ConnectionEncrypter, SecuredIo};
pub use gater::{ConnectionGater, NoopConnectionGater};
pub use muxer::{IncomingStreams, MuxedStream, StreamMuxer, StreamMuxerFactory};
pub use negotiator::{Negotiated, ProtocolNegotiator};
pub use protector::ConnectionProtector;
pub use registrar::{HandlerOptions, RegisteredHandler, Registrar, StreamHandler};
pub use resolver::{AddressResolver, AddressSorter, DefaultAddressSorter};
pub use transport::{
    BoxIo, ConnectionIo, RawConnection, Transport, TransportDialOptions, TransportManager,
};

/// Hooks the connection manager installs around upgrades.
pub trait ConnectionManagerHook: Send + Sync + 'static {
    /// Called when an inbound upgrade reaches a terminal state, whether it
    /// succeeded or failed.
    fn after_upgrade_inbound(&self) {}
}
