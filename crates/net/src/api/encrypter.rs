//! Connection encryption seam.

use async_trait::async_trait;

use tether_primitives::PeerId;

use super::transport::BoxIo;
use crate::error::EncryptionError;

/// Outcome of an encryption handshake.
pub struct SecuredIo {
    /// The encrypted byte stream.
    pub io: BoxIo,
    /// The authenticated identity of the remote peer.
    pub remote_peer: PeerId,
}

/// A connection encrypter selectable by capability string.
#[async_trait]
pub trait ConnectionEncrypter: Send + Sync + 'static {
    /// Capability string exchanged during negotiation (e.g. `/noise`).
    fn protocol(&self) -> &str;

    /// Responder side of the handshake.
    async fn secure_inbound(
        &self,
        local_peer: PeerId,
        io: BoxIo,
    ) -> Result<SecuredIo, EncryptionError>;

    /// Initiator side of the handshake. When `expected_peer` is set, a
    /// handshake that authenticates any other identity must fail.
    async fn secure_outbound(
        &self,
        local_peer: PeerId,
        io: BoxIo,
        expected_peer: Option<PeerId>,
    ) -> Result<SecuredIo, EncryptionError>;
}
