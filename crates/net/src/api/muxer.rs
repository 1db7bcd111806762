//! Stream multiplexer seam.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tether_primitives::Direction;

use super::transport::BoxIo;
use crate::error::MuxerError;

/// A single multiplexed stream, before protocol negotiation.
pub struct MuxedStream {
    /// Muxer-assigned stream id, unique per connection.
    pub id: u64,
    /// The stream's byte channel. Dropping it resets the stream.
    pub io: BoxIo,
}

impl fmt::Debug for MuxedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxedStream").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Receiver of streams the remote opens on a muxed connection.
///
/// The channel closes when the muxer stops, for whatever reason; that is
/// how connection teardown is observed.
pub type IncomingStreams = mpsc::Receiver<MuxedStream>;

/// A live stream multiplexer driving one upgraded connection.
#[async_trait]
pub trait StreamMuxer: Send + Sync + 'static {
    /// Capability string this muxer was negotiated under.
    fn protocol(&self) -> &str;

    /// Open a new outbound stream.
    async fn open_stream(&self) -> Result<MuxedStream, MuxerError>;

    /// Number of streams currently open.
    fn stream_count(&self) -> usize;

    /// Gracefully close, letting streams drain per muxer policy, then shut
    /// the underlying transport down through the owned byte stream.
    async fn close(&self) -> Result<(), MuxerError>;

    /// Tear everything down immediately.
    fn abort(&self);
}

/// Factory instantiating a muxer over an upgraded byte stream.
pub trait StreamMuxerFactory: Send + Sync + 'static {
    /// Capability string offered during negotiation.
    fn protocol(&self) -> &str;

    /// Build a muxer over `io` for a connection in `direction`. The muxer
    /// owns `io` from this point on; remotely opened streams are delivered
    /// on the returned channel.
    fn create_muxer(&self, io: BoxIo, direction: Direction)
        -> (Arc<dyn StreamMuxer>, IncomingStreams);
}
