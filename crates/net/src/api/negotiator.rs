//! Capability negotiation seam.

use std::fmt;

use async_trait::async_trait;

use super::transport::BoxIo;
use crate::error::NegotiationError;

/// A byte stream together with the capability agreed over it.
pub struct Negotiated {
    /// The stream. Any early data the remote sent while negotiation was
    /// settling is buffered here and must not be lost.
    pub io: BoxIo,
    /// The agreed capability string.
    pub protocol: String,
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiated").field("protocol", &self.protocol).finish_non_exhaustive()
    }
}

/// Multi-codec capability negotiation over a byte stream.
///
/// Used symmetrically for encrypter selection, muxer selection and
/// per-stream application protocol selection. Implementations must not
/// consume application bytes beyond the negotiation handshake.
#[async_trait]
pub trait ProtocolNegotiator: Send + Sync + 'static {
    /// Initiator side: propose `protocols` in order of preference.
    async fn select(
        &self,
        io: BoxIo,
        protocols: Vec<String>,
    ) -> Result<Negotiated, NegotiationError>;

    /// Responder side: answer the remote's proposals from `protocols`.
    async fn handle(
        &self,
        io: BoxIo,
        protocols: Vec<String>,
    ) -> Result<Negotiated, NegotiationError>;
}
