//! Upgraded connections and their streams.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use tether_primitives::{
    unix_now_millis, ConnectionTimeline, Direction, Multiaddr, PeerId, StreamTimeline,
};

use crate::api::{BoxIo, MuxedStream, ProtocolNegotiator, Registrar, StreamMuxer};
use crate::error::ConnectionError;
use crate::events::{ConnectionEvent, ConnectionEvents};
use crate::peer_store::PeerStore;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Live and usable.
    Open,
    /// A graceful close is in progress.
    Closing,
    /// Terminal.
    Closed,
}

/// Options for [`Connection::new_stream`].
#[derive(Debug, Clone, Default)]
pub struct NewStreamOptions {
    /// Abort signal for the stream handshake. When absent, the
    /// connection's default stream timeout applies instead.
    pub signal: Option<CancellationToken>,
}

/// Snapshot of one open stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Muxer-assigned stream id.
    pub id: u64,
    /// Negotiated application protocol.
    pub protocol: String,
    /// Who opened the stream.
    pub direction: Direction,
}

/// Per-protocol stream caps applied when the registrar has no explicit
/// limit for a protocol.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamLimits {
    pub max_inbound: usize,
    pub max_outbound: usize,
}

#[derive(Default)]
struct StreamRegistry {
    open: Vec<StreamInfo>,
}

impl StreamRegistry {
    fn count(&self, protocol: &str, direction: Direction) -> usize {
        self.open
            .iter()
            .filter(|info| info.direction == direction && info.protocol == protocol)
            .count()
    }

    fn insert(&mut self, info: StreamInfo) {
        self.open.push(info);
    }

    fn remove(&mut self, id: u64, direction: Direction) {
        self.open.retain(|info| !(info.id == id && info.direction == direction));
    }
}

/// Deregisters a stream from its connection when the stream goes away.
struct StreamGuard {
    registry: Arc<Mutex<StreamRegistry>>,
    id: u64,
    direction: Direction,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(self.id, self.direction);
    }
}

/// A negotiated bidirectional stream on an upgraded connection.
///
/// Dropping the stream resets it and releases its slot in the
/// per-protocol accounting.
pub struct Stream {
    id: u64,
    protocol: String,
    direction: Direction,
    timeline: StreamTimeline,
    io: BoxIo,
    _guard: StreamGuard,
}

impl Stream {
    /// Muxer-assigned stream id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The application protocol agreed for this stream.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Who opened the stream.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Lifecycle timestamps.
    pub fn timeline(&self) -> StreamTimeline {
        self.timeline
    }

    /// Close the write side and mark the stream closed.
    pub async fn close(&mut self) -> std::io::Result<()> {
        self.io.shutdown().await?;
        self.timeline.close = Some(unix_now_millis());
        Ok(())
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Everything needed to publish a connection, collected by the upgrader.
pub(crate) struct ConnectionInit {
    pub remote_addr: Multiaddr,
    pub remote_peer: PeerId,
    pub direction: Direction,
    pub encryption: String,
    pub transient: bool,
    pub opened_at: u64,
    pub muxer: Option<Arc<dyn StreamMuxer>>,
    pub unmuxed_io: Option<BoxIo>,
    pub negotiator: Arc<dyn ProtocolNegotiator>,
    pub registrar: Arc<dyn Registrar>,
    pub peer_store: Arc<dyn PeerStore>,
    pub events: ConnectionEvents,
    pub limits: StreamLimits,
    pub outbound_stream_timeout: Duration,
}

struct ConnectionState {
    status: ConnectionStatus,
    timeline: ConnectionTimeline,
}

struct ConnectionInner {
    id: u64,
    remote_addr: Multiaddr,
    remote_peer: PeerId,
    direction: Direction,
    encryption: String,
    multiplexer: Option<String>,
    transient: bool,
    state: Mutex<ConnectionState>,
    muxer: Option<Arc<dyn StreamMuxer>>,
    // Held only for connections without a muxer, so close() can shut the
    // transport down.
    unmuxed_io: tokio::sync::Mutex<Option<BoxIo>>,
    streams: Arc<Mutex<StreamRegistry>>,
    negotiator: Arc<dyn ProtocolNegotiator>,
    registrar: Arc<dyn Registrar>,
    peer_store: Arc<dyn PeerStore>,
    events: ConnectionEvents,
    limits: StreamLimits,
    outbound_stream_timeout: Duration,
}

/// A live, upgraded connection to a remote peer.
///
/// Cheap to clone; every clone refers to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_peer", &self.inner.remote_peer)
            .field("remote_addr", &self.inner.remote_addr)
            .field("direction", &self.inner.direction)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(init: ConnectionInit) -> Self {
        let multiplexer = init.muxer.as_ref().map(|muxer| muxer.protocol().to_string());
        let timeline = ConnectionTimeline {
            open: init.opened_at,
            upgraded: Some(unix_now_millis()),
            close: None,
        };
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, AtomicOrdering::Relaxed),
                remote_addr: init.remote_addr,
                remote_peer: init.remote_peer,
                direction: init.direction,
                encryption: init.encryption,
                multiplexer,
                transient: init.transient,
                state: Mutex::new(ConnectionState { status: ConnectionStatus::Open, timeline }),
                muxer: init.muxer,
                unmuxed_io: tokio::sync::Mutex::new(init.unmuxed_io),
                streams: Arc::new(Mutex::new(StreamRegistry::default())),
                negotiator: init.negotiator,
                registrar: init.registrar,
                peer_store: init.peer_store,
                events: init.events,
                limits: init.limits,
                outbound_stream_timeout: init.outbound_stream_timeout,
            }),
        }
    }

    /// Runtime-assigned connection id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Address of the remote endpoint.
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.inner.remote_addr
    }

    /// Authenticated identity of the remote peer.
    pub fn remote_peer(&self) -> PeerId {
        self.inner.remote_peer
    }

    /// Who opened the connection.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Capability string of the encryption layer, or `"native"` when the
    /// transport encrypts natively.
    pub fn encryption(&self) -> &str {
        &self.inner.encryption
    }

    /// Capability string of the stream muxer, if one was negotiated.
    pub fn multiplexer(&self) -> Option<&str> {
        self.inner.multiplexer.as_deref()
    }

    /// Whether the connection has limited privileges (e.g. relayed).
    pub fn is_transient(&self) -> bool {
        self.inner.transient
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Lifecycle timestamps.
    pub fn timeline(&self) -> ConnectionTimeline {
        self.inner.state.lock().timeline
    }

    /// Snapshots of the currently open streams.
    pub fn streams(&self) -> Vec<StreamInfo> {
        self.inner.streams.lock().open.clone()
    }

    /// Open a new stream and negotiate one of `protocols` over it.
    pub async fn new_stream(
        &self,
        protocols: Vec<String>,
        options: NewStreamOptions,
    ) -> Result<Stream, ConnectionError> {
        if self.status() != ConnectionStatus::Open {
            return Err(ConnectionError::NotOpen);
        }
        let muxer = self.inner.muxer.clone().ok_or(ConnectionError::NotMultiplexed)?;

        let muxed = muxer.open_stream().await?;
        let stream_id = muxed.id;
        trace!(conn = self.inner.id, stream = stream_id, "negotiating outbound stream");

        let negotiated = match &options.signal {
            Some(signal) => {
                tokio::select! {
                    negotiated = self.inner.negotiator.select(muxed.io, protocols) => negotiated?,
                    _ = signal.cancelled() => return Err(ConnectionError::Aborted),
                }
            }
            None => {
                match tokio::time::timeout(
                    self.inner.outbound_stream_timeout,
                    self.inner.negotiator.select(muxed.io, protocols),
                )
                .await
                {
                    Ok(negotiated) => negotiated?,
                    Err(_) => return Err(ConnectionError::Timeout),
                }
            }
        };
        let protocol = negotiated.protocol;

        let limit = self.outbound_limit(&protocol);
        {
            let mut streams = self.inner.streams.lock();
            if streams.count(&protocol, Direction::Outbound) >= limit {
                // Dropping the negotiated io resets the muxed stream.
                return Err(ConnectionError::TooManyOutboundStreams { protocol, limit });
            }
            streams.insert(StreamInfo {
                id: stream_id,
                protocol: protocol.clone(),
                direction: Direction::Outbound,
            });
        }

        self.remember_protocol(&protocol);

        debug!(
            conn = self.inner.id,
            stream = stream_id,
            %protocol,
            "outbound stream open"
        );
        Ok(Stream {
            id: stream_id,
            protocol,
            direction: Direction::Outbound,
            timeline: StreamTimeline { open: unix_now_millis(), close: None },
            io: negotiated.io,
            _guard: StreamGuard {
                registry: Arc::clone(&self.inner.streams),
                id: stream_id,
                direction: Direction::Outbound,
            },
        })
    }

    /// Accept one stream the remote opened, negotiate its protocol and
    /// hand it to the registered handler.
    pub(crate) async fn handle_incoming_stream(
        &self,
        muxed: MuxedStream,
    ) -> Result<(), ConnectionError> {
        let stream_id = muxed.id;
        let offered = self.inner.registrar.protocols();
        let negotiated = self.inner.negotiator.handle(muxed.io, offered).await?;
        let protocol = negotiated.protocol;

        let limit = self.inbound_limit(&protocol);
        {
            let mut streams = self.inner.streams.lock();
            // The new stream is not registered yet, so hitting the limit
            // exactly means it would be one too many.
            if streams.count(&protocol, Direction::Inbound) == limit {
                return Err(ConnectionError::TooManyInboundStreams { protocol, limit });
            }
            streams.insert(StreamInfo {
                id: stream_id,
                protocol: protocol.clone(),
                direction: Direction::Inbound,
            });
        }

        self.remember_protocol(&protocol);

        let stream = Stream {
            id: stream_id,
            protocol: protocol.clone(),
            direction: Direction::Inbound,
            timeline: StreamTimeline { open: unix_now_millis(), close: None },
            io: negotiated.io,
            _guard: StreamGuard {
                registry: Arc::clone(&self.inner.streams),
                id: stream_id,
                direction: Direction::Inbound,
            },
        };

        let registered = self.inner.registrar.handler(&protocol)?;
        if self.inner.transient && !registered.options.run_on_transient_connection {
            return Err(ConnectionError::TransientConnection { protocol });
        }

        debug!(
            conn = self.inner.id,
            stream = stream_id,
            %protocol,
            "inbound stream open"
        );
        registered.handler.handle(stream, self.clone()).await;
        Ok(())
    }

    /// Gracefully close the connection.
    ///
    /// The muxer drains its streams per its own policy and shuts the
    /// underlying transport down; the close event fires exactly once.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.inner.state.lock();
            match state.status {
                ConnectionStatus::Open => state.status = ConnectionStatus::Closing,
                ConnectionStatus::Closing | ConnectionStatus::Closed => return Ok(()),
            }
        }
        debug!(conn = self.inner.id, peer = %self.inner.remote_peer, "closing connection");

        let result = match &self.inner.muxer {
            Some(muxer) => muxer.close().await.map_err(ConnectionError::from),
            None => {
                let mut io = self.inner.unmuxed_io.lock().await;
                match io.as_mut() {
                    Some(io) => io.shutdown().await.map_err(ConnectionError::from),
                    None => Ok(()),
                }
            }
        };

        self.finish_close();
        result
    }

    /// Tear the connection down immediately.
    pub fn abort(&self) {
        if self.status() == ConnectionStatus::Closed {
            return;
        }
        debug!(conn = self.inner.id, peer = %self.inner.remote_peer, "aborting connection");
        if let Some(muxer) = &self.inner.muxer {
            muxer.abort();
        }
        if let Ok(mut io) = self.inner.unmuxed_io.try_lock() {
            io.take();
        }
        self.finish_close();
    }

    /// The muxer stopping means the underlying transport is gone.
    pub(crate) fn on_muxer_closed(&self) {
        self.finish_close();
    }

    fn finish_close(&self) {
        let emit = {
            let mut state = self.inner.state.lock();
            if state.status == ConnectionStatus::Closed {
                false
            } else {
                state.status = ConnectionStatus::Closed;
                state.timeline.close = Some(unix_now_millis());
                true
            }
        };
        if emit {
            debug!(conn = self.inner.id, peer = %self.inner.remote_peer, "connection closed");
            self.inner.events.emit(ConnectionEvent::Closed(self.clone()));
        }
    }

    fn inbound_limit(&self, protocol: &str) -> usize {
        self.inner
            .registrar
            .handler(protocol)
            .ok()
            .and_then(|registered| registered.options.max_inbound_streams)
            .unwrap_or(self.inner.limits.max_inbound)
    }

    fn outbound_limit(&self, protocol: &str) -> usize {
        self.inner
            .registrar
            .handler(protocol)
            .ok()
            .and_then(|registered| registered.options.max_outbound_streams)
            .unwrap_or(self.inner.limits.max_outbound)
    }

    fn remember_protocol(&self, protocol: &str) {
        let protocols = [protocol.to_string()];
        if let Err(error) = self.inner.peer_store.merge_protocols(&self.inner.remote_peer, &protocols)
        {
            warn!(
                peer = %self.inner.remote_peer,
                %protocol,
                %error,
                "failed to record peer protocol"
            );
        }
    }
}
