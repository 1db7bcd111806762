//! Connection upgrade pipeline.
//!
//! Drives a raw byte transport through private-network protection, an
//! encryption handshake and stream multiplexer selection, each chosen by
//! capability negotiation, and publishes the result as a
//! [`Connection`]. The phases run strictly in order for any single raw
//! connection; failing any of them tears the raw connection down.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use tether_primitives::{extract_peer_id, Direction, Multiaddr, PeerId};

use crate::api::{
    BoxIo, ConnectionEncrypter, ConnectionGater, ConnectionManagerHook, ConnectionProtector,
    IncomingStreams, ProtocolNegotiator, RawConnection, Registrar, StreamMuxerFactory,
};
use crate::connection::{Connection, ConnectionInit, StreamLimits};
use crate::error::UpgradeError;
use crate::events::{ConnectionEvent, ConnectionEvents};
use crate::peer_store::PeerStore;

/// Capability string recorded when the transport encrypts natively and
/// the handshake is skipped.
pub const NATIVE_ENCRYPTION: &str = "native";

const DEFAULT_INBOUND_UPGRADE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_OUTBOUND_STREAM_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_INBOUND_STREAMS: usize = 32;
const DEFAULT_MAX_OUTBOUND_STREAMS: usize = 64;

/// Upgrader configuration.
#[derive(Debug, Clone)]
pub struct UpgraderConfig {
    /// Budget for a whole inbound upgrade, from accept to live.
    pub inbound_upgrade_timeout: Duration,
    /// Timeout for an outbound stream handshake when the caller supplies
    /// no signal.
    pub outbound_stream_timeout: Duration,
    /// Inbound per-protocol stream cap for protocols without a registered
    /// limit.
    pub default_max_inbound_streams: usize,
    /// Outbound per-protocol stream cap for protocols without a
    /// registered limit.
    pub default_max_outbound_streams: usize,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            inbound_upgrade_timeout: DEFAULT_INBOUND_UPGRADE_TIMEOUT,
            outbound_stream_timeout: DEFAULT_OUTBOUND_STREAM_TIMEOUT,
            default_max_inbound_streams: DEFAULT_MAX_INBOUND_STREAMS,
            default_max_outbound_streams: DEFAULT_MAX_OUTBOUND_STREAMS,
        }
    }
}

/// Per-upgrade options.
#[derive(Clone, Default)]
pub struct UpgradeOptions {
    /// Skip the private-network protector even when one is configured.
    pub skip_protection: bool,
    /// The transport encrypts natively. The remote identity must then be
    /// embedded in the address.
    pub skip_encryption: bool,
    /// Use this muxer instead of negotiating one.
    pub muxer_factory: Option<Arc<dyn StreamMuxerFactory>>,
    /// Mark the connection as limited-privilege.
    pub transient: bool,
}

/// Everything the upgrader needs from its environment.
pub struct UpgraderParts {
    /// Identity of the local node.
    pub local_peer: PeerId,
    /// Encrypters, in order of negotiation preference.
    pub encrypters: Vec<Arc<dyn ConnectionEncrypter>>,
    /// Muxer factories, in order of negotiation preference. May be empty,
    /// in which case connections come up without stream support.
    pub muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    /// Private-network protector, if the network is private.
    pub protector: Option<Arc<dyn ConnectionProtector>>,
    /// The capability negotiation protocol.
    pub negotiator: Arc<dyn ProtocolNegotiator>,
    /// Policy hooks.
    pub gater: Arc<dyn ConnectionGater>,
    /// Application protocol handlers.
    pub registrar: Arc<dyn Registrar>,
    /// Peer knowledge base.
    pub peer_store: Arc<dyn PeerStore>,
    /// Connection lifecycle event sink.
    pub events: ConnectionEvents,
    /// Connection manager hooks, if any.
    pub hooks: Option<Arc<dyn ConnectionManagerHook>>,
    /// Tunables.
    pub config: UpgraderConfig,
}

/// The connection upgrade pipeline.
pub struct Upgrader {
    local_peer: PeerId,
    encrypters: Vec<Arc<dyn ConnectionEncrypter>>,
    muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    protector: Option<Arc<dyn ConnectionProtector>>,
    negotiator: Arc<dyn ProtocolNegotiator>,
    gater: Arc<dyn ConnectionGater>,
    registrar: Arc<dyn Registrar>,
    peer_store: Arc<dyn PeerStore>,
    events: ConnectionEvents,
    hooks: Option<Arc<dyn ConnectionManagerHook>>,
    config: UpgraderConfig,
}

enum MuxerSelection {
    Unmuxed { io: BoxIo },
    Muxed { factory: Arc<dyn StreamMuxerFactory>, io: BoxIo },
}

impl Upgrader {
    pub fn new(parts: UpgraderParts) -> Self {
        Self {
            local_peer: parts.local_peer,
            encrypters: parts.encrypters,
            muxers: parts.muxers,
            protector: parts.protector,
            negotiator: parts.negotiator,
            gater: parts.gater,
            registrar: parts.registrar,
            peer_store: parts.peer_store,
            events: parts.events,
            hooks: parts.hooks,
            config: parts.config,
        }
    }

    /// Upgrade a connection accepted by a listener.
    ///
    /// The whole upgrade shares one timeout; on expiry the raw connection
    /// is torn down.
    pub async fn upgrade_inbound(
        &self,
        raw: RawConnection,
        options: UpgradeOptions,
    ) -> Result<Connection, UpgradeError> {
        let result = match tokio::time::timeout(
            self.config.inbound_upgrade_timeout,
            self.upgrade(raw, Direction::Inbound, options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(UpgradeError::Timeout),
        };
        if let Some(hooks) = &self.hooks {
            hooks.after_upgrade_inbound();
        }
        if let Err(error) = &result {
            debug!(%error, "inbound upgrade failed");
        }
        result
    }

    /// Upgrade a connection established by a transport dial. Bounded by
    /// the dial timeout upstream rather than a timeout of its own.
    pub async fn upgrade_outbound(
        &self,
        raw: RawConnection,
        options: UpgradeOptions,
    ) -> Result<Connection, UpgradeError> {
        let result = self.upgrade(raw, Direction::Outbound, options).await;
        if let Err(error) = &result {
            debug!(%error, "outbound upgrade failed");
        }
        result
    }

    async fn upgrade(
        &self,
        raw: RawConnection,
        direction: Direction,
        options: UpgradeOptions,
    ) -> Result<Connection, UpgradeError> {
        let RawConnection { remote_addr, io, opened_at } = raw;
        let expected_peer = extract_peer_id(&remote_addr);

        // Dropping `io` tears the raw connection down, which is exactly
        // what every failure path below wants.
        let denied = match direction {
            Direction::Inbound => self.gater.deny_inbound_connection(&remote_addr),
            Direction::Outbound => expected_peer
                .as_ref()
                .is_some_and(|peer| self.gater.deny_outbound_connection(peer, &remote_addr)),
        };
        if denied {
            return Err(UpgradeError::ConnectionDenied);
        }

        let io = match (&self.protector, options.skip_protection) {
            (Some(protector), false) => {
                trace!(addr = %remote_addr, "protecting connection");
                protector.protect(io).await.map_err(UpgradeError::Protection)?
            }
            _ => io,
        };

        let (io, remote_peer, encryption) = if options.skip_encryption {
            let peer = expected_peer.ok_or(match direction {
                Direction::Inbound => UpgradeError::InvalidMultiaddr,
                Direction::Outbound => UpgradeError::InvalidPeer,
            })?;
            (io, peer, NATIVE_ENCRYPTION.to_string())
        } else {
            self.encrypt(io, direction, expected_peer).await?
        };
        debug!(peer = %remote_peer, %encryption, %direction, "connection encrypted");

        let denied = match direction {
            Direction::Inbound => {
                self.gater.deny_inbound_encrypted_connection(&remote_peer, &remote_addr)
            }
            Direction::Outbound => {
                self.gater.deny_outbound_encrypted_connection(&remote_peer, &remote_addr)
            }
        };
        if denied {
            return Err(UpgradeError::ConnectionIntercepted);
        }

        let selection = self.select_muxer(io, direction, &options).await?;

        let denied = match direction {
            Direction::Inbound => {
                self.gater.deny_inbound_upgraded_connection(&remote_peer, &remote_addr)
            }
            Direction::Outbound => {
                self.gater.deny_outbound_upgraded_connection(&remote_peer, &remote_addr)
            }
        };
        if denied {
            return Err(UpgradeError::ConnectionIntercepted);
        }

        Ok(self.publish(remote_addr, remote_peer, direction, encryption, selection, &options, opened_at))
    }

    async fn encrypt(
        &self,
        io: BoxIo,
        direction: Direction,
        expected_peer: Option<PeerId>,
    ) -> Result<(BoxIo, PeerId, String), UpgradeError> {
        let protocols: Vec<String> =
            self.encrypters.iter().map(|encrypter| encrypter.protocol().to_string()).collect();
        let negotiated = match direction {
            Direction::Inbound => self.negotiator.handle(io, protocols).await,
            Direction::Outbound => self.negotiator.select(io, protocols).await,
        }
        .map_err(|error| UpgradeError::EncryptionFailed(Box::new(error)))?;
        trace!(protocol = %negotiated.protocol, "encrypter negotiated");

        let encrypter = self
            .encrypters
            .iter()
            .find(|encrypter| encrypter.protocol() == negotiated.protocol)
            .ok_or_else(|| {
                UpgradeError::EncryptionFailed(
                    format!("negotiated unknown encrypter {}", negotiated.protocol).into(),
                )
            })?;

        let secured = match direction {
            Direction::Inbound => encrypter.secure_inbound(self.local_peer, negotiated.io).await,
            Direction::Outbound => {
                encrypter.secure_outbound(self.local_peer, negotiated.io, expected_peer).await
            }
        }
        .map_err(|error| UpgradeError::EncryptionFailed(Box::new(error)))?;

        Ok((secured.io, secured.remote_peer, negotiated.protocol))
    }

    async fn select_muxer(
        &self,
        io: BoxIo,
        direction: Direction,
        options: &UpgradeOptions,
    ) -> Result<MuxerSelection, UpgradeError> {
        if let Some(factory) = &options.muxer_factory {
            trace!(protocol = %factory.protocol(), "using caller-supplied muxer");
            return Ok(MuxerSelection::Muxed { factory: Arc::clone(factory), io });
        }
        if self.muxers.is_empty() {
            return Ok(MuxerSelection::Unmuxed { io });
        }

        let protocols: Vec<String> =
            self.muxers.iter().map(|factory| factory.protocol().to_string()).collect();
        let negotiated = match direction {
            Direction::Inbound => self.negotiator.handle(io, protocols).await,
            Direction::Outbound => self.negotiator.select(io, protocols).await,
        }
        .map_err(|error| UpgradeError::MuxerUnavailable(Box::new(error)))?;
        trace!(protocol = %negotiated.protocol, "muxer negotiated");

        let factory = self
            .muxers
            .iter()
            .find(|factory| factory.protocol() == negotiated.protocol)
            .cloned()
            .ok_or_else(|| {
                UpgradeError::MuxerUnavailable(
                    format!("negotiated unknown muxer {}", negotiated.protocol).into(),
                )
            })?;
        Ok(MuxerSelection::Muxed { factory, io: negotiated.io })
    }

    #[allow(clippy::too_many_arguments)]
    fn publish(
        &self,
        remote_addr: Multiaddr,
        remote_peer: PeerId,
        direction: Direction,
        encryption: String,
        selection: MuxerSelection,
        options: &UpgradeOptions,
        opened_at: u64,
    ) -> Connection {
        let (muxer, incoming, unmuxed_io) = match selection {
            MuxerSelection::Muxed { factory, io } => {
                let (muxer, incoming) = factory.create_muxer(io, direction);
                (Some(muxer), Some(incoming), None)
            }
            MuxerSelection::Unmuxed { io } => (None, None, Some(io)),
        };

        let connection = Connection::new(ConnectionInit {
            remote_addr,
            remote_peer,
            direction,
            encryption,
            transient: options.transient,
            opened_at,
            muxer,
            unmuxed_io,
            negotiator: Arc::clone(&self.negotiator),
            registrar: Arc::clone(&self.registrar),
            peer_store: Arc::clone(&self.peer_store),
            events: self.events.clone(),
            limits: StreamLimits {
                max_inbound: self.config.default_max_inbound_streams,
                max_outbound: self.config.default_max_outbound_streams,
            },
            outbound_stream_timeout: self.config.outbound_stream_timeout,
        });

        debug!(
            conn = connection.id(),
            peer = %remote_peer,
            %direction,
            muxer = connection.multiplexer().unwrap_or("none"),
            "connection established"
        );
        self.events.emit(ConnectionEvent::Opened(connection.clone()));

        // The accept loop is bound after the connection is published, so
        // incoming streams always observe a fully built connection.
        if let Some(incoming) = incoming {
            spawn_accept_loop(connection.clone(), incoming);
        }

        connection
    }
}

fn spawn_accept_loop(connection: Connection, mut incoming: IncomingStreams) {
    tokio::spawn(async move {
        while let Some(muxed) = incoming.recv().await {
            let connection = connection.clone();
            tokio::spawn(async move {
                if let Err(error) = connection.handle_incoming_stream(muxed).await {
                    debug!(conn = connection.id(), %error, "inbound stream rejected");
                }
            });
        }
        connection.on_muxer_closed();
    });
}
