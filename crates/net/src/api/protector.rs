//! Private-network protection seam.

use async_trait::async_trait;

use super::transport::BoxIo;

/// Wraps raw connections in a private-network layer (e.g. a pre-shared
/// key stream cipher) before any other upgrade work runs.
#[async_trait]
pub trait ConnectionProtector: Send + Sync + 'static {
    /// Run the protection handshake over `io`.
    async fn protect(&self, io: BoxIo) -> std::io::Result<BoxIo>;
}
