//! Transport driver seam.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use tether_primitives::{unix_now_millis, Multiaddr};

use crate::connection::Connection;
use crate::error::TransportError;

/// Marker trait for the byte streams flowing through the upgrade pipeline.
pub trait ConnectionIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ConnectionIo for T {}

/// A bidirectional byte stream, boxed for dynamic dispatch.
pub type BoxIo = Box<dyn ConnectionIo>;

/// A raw connection handed to the upgrader by a transport or listener.
///
/// Dropping the record tears the raw connection down; every failure path
/// of the upgrade relies on that.
pub struct RawConnection {
    /// Address of the remote endpoint.
    pub remote_addr: Multiaddr,
    /// The raw byte stream.
    pub io: BoxIo,
    /// Unix-millis timestamp at which the transport established the link.
    pub opened_at: u64,
}

impl RawConnection {
    /// Wrap a freshly established byte stream.
    pub fn new(remote_addr: Multiaddr, io: impl ConnectionIo) -> Self {
        Self { remote_addr, io: Box::new(io), opened_at: unix_now_millis() }
    }
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("remote_addr", &self.remote_addr)
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

/// Options passed to [`Transport::dial`].
#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    /// Cancelled when the attempt loses its race or the caller gives up.
    /// Drivers must abandon the dial promptly once it fires.
    pub signal: CancellationToken,
}

/// A transport driver able to reach some family of multiaddrs.
///
/// Drivers establish the raw link and run it through the upgrader before
/// returning, so a successful dial yields a live [`Connection`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Dial `addr`, honouring `options.signal`.
    async fn dial(
        &self,
        addr: &Multiaddr,
        options: TransportDialOptions,
    ) -> Result<Connection, TransportError>;
}

/// Lookup of the transport driver claiming support for an address.
#[auto_impl::auto_impl(&, Arc)]
pub trait TransportManager: Send + Sync + 'static {
    /// The driver for `addr`, or `None` when no transport can dial it.
    fn transport_for_multiaddr(&self, addr: &Multiaddr) -> Option<Arc<dyn Transport>>;
}
