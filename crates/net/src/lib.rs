//! Core of the tether peer-to-peer transport runtime.
//!
//! Two cooperating subsystems turn peer identities into live, vetted
//! connections:
//!
//! - [`DialQueue`] expands a dial target into vetted candidate addresses,
//!   joins duplicate requests onto the same in-flight dial, and races the
//!   candidates under global and per-request concurrency caps. The first
//!   successfully upgraded connection wins; the rest are cancelled.
//! - [`Upgrader`] takes a raw bidirectional byte transport in either
//!   direction and layers private-network protection, an encryption
//!   handshake and stream multiplexing on top of it via capability
//!   negotiation, producing a [`Connection`].
//!
//! Transport drivers, encrypters, muxers, the negotiation protocol, the
//! peer store and policy hooks are all injected through the traits in
//! [`api`] and [`peer_store`]; this crate owns only the coordination.

pub mod api;
mod connection;
pub mod dial;
mod error;
mod events;
pub mod peer_store;
pub mod upgrade;

pub use connection::{Connection, ConnectionStatus, NewStreamOptions, Stream, StreamInfo};
pub use dial::{DialOptions, DialQueue, DialQueueConfig, DialQueueParts, DialTarget};
pub use error::{
    ConnectionError, DialError, EncryptionError, MuxerError, NegotiationError, PeerStoreError,
    RegistrarError, TransportError, UpgradeError,
};
pub use events::{ConnectionEvent, ConnectionEvents};
pub use upgrade::{UpgradeOptions, Upgrader, UpgraderConfig, UpgraderParts, NATIVE_ENCRYPTION};
