//! Mock collaborators shared by the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use tether_net::api::{
    AddressResolver, BoxIo, ConnectionEncrypter, ConnectionGater, ConnectionManagerHook,
    DefaultAddressSorter, HandlerOptions, IncomingStreams, MuxedStream, Negotiated,
    ProtocolNegotiator, RawConnection, RegisteredHandler, Registrar, SecuredIo, StreamHandler,
    StreamMuxer, StreamMuxerFactory, Transport, TransportDialOptions, TransportManager,
};
use tether_net::peer_store::MemoryPeerStore;
use tether_net::{
    Connection, ConnectionEvents, DialQueue, DialQueueConfig, DialQueueParts, EncryptionError,
    MuxerError, NegotiationError, RegistrarError, Stream, TransportError, UpgradeOptions,
    Upgrader, UpgraderConfig, UpgraderParts,
};
use tether_primitives::{extract_peer_id, Direction, Multiaddr, PeerId, Protocol};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

pub fn peer_id() -> PeerId {
    libp2p_identity::Keypair::generate_ed25519().public().to_peer_id()
}

pub fn addr(s: &str) -> Multiaddr {
    s.parse().unwrap()
}

pub fn with_peer(addr: Multiaddr, peer: PeerId) -> Multiaddr {
    addr.with(Protocol::P2p(peer))
}

/// A raw connection whose remote half is discarded. The mock encrypters
/// and negotiators never touch the wire, so this is all the upgrade
/// pipeline needs.
pub fn raw_conn(remote_addr: Multiaddr) -> RawConnection {
    let (io, _remote) = tokio::io::duplex(1024);
    RawConnection::new(remote_addr, io)
}

/// Poll `condition` for up to a second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 1s");
}

/// Negotiator that settles on the first offered capability without a wire
/// exchange.
#[derive(Default)]
pub struct FirstProtocolNegotiator {
    pub selects: AtomicUsize,
    pub handles: AtomicUsize,
}

impl FirstProtocolNegotiator {
    fn first(io: BoxIo, protocols: Vec<String>) -> Result<Negotiated, NegotiationError> {
        match protocols.first().cloned() {
            Some(protocol) => Ok(Negotiated { io, protocol }),
            None => Err(NegotiationError::Unsupported { offered: protocols }),
        }
    }
}

#[async_trait]
impl ProtocolNegotiator for FirstProtocolNegotiator {
    async fn select(
        &self,
        io: BoxIo,
        protocols: Vec<String>,
    ) -> Result<Negotiated, NegotiationError> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        Self::first(io, protocols)
    }

    async fn handle(
        &self,
        io: BoxIo,
        protocols: Vec<String>,
    ) -> Result<Negotiated, NegotiationError> {
        self.handles.fetch_add(1, Ordering::SeqCst);
        Self::first(io, protocols)
    }
}

/// Encrypter that authenticates a preconfigured remote identity.
pub struct StaticEncrypter {
    protocol: String,
    remote_peer: PeerId,
    pub inbound_calls: AtomicUsize,
}

impl StaticEncrypter {
    pub fn new(protocol: &str, remote_peer: PeerId) -> Arc<Self> {
        Arc::new(Self {
            protocol: protocol.to_string(),
            remote_peer,
            inbound_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ConnectionEncrypter for StaticEncrypter {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn secure_inbound(
        &self,
        _local_peer: PeerId,
        io: BoxIo,
    ) -> Result<SecuredIo, EncryptionError> {
        self.inbound_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SecuredIo { io, remote_peer: self.remote_peer })
    }

    async fn secure_outbound(
        &self,
        _local_peer: PeerId,
        io: BoxIo,
        expected_peer: Option<PeerId>,
    ) -> Result<SecuredIo, EncryptionError> {
        if let Some(expected) = expected_peer {
            if expected != self.remote_peer {
                return Err(EncryptionError::PeerMismatch {
                    expected,
                    actual: self.remote_peer,
                });
            }
        }
        Ok(SecuredIo { io, remote_peer: self.remote_peer })
    }
}

/// Encrypter whose handshake never completes.
pub struct HangingEncrypter {
    protocol: String,
}

impl HangingEncrypter {
    pub fn new(protocol: &str) -> Arc<Self> {
        Arc::new(Self { protocol: protocol.to_string() })
    }
}

#[async_trait]
impl ConnectionEncrypter for HangingEncrypter {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn secure_inbound(
        &self,
        _local_peer: PeerId,
        _io: BoxIo,
    ) -> Result<SecuredIo, EncryptionError> {
        std::future::pending().await
    }

    async fn secure_outbound(
        &self,
        _local_peer: PeerId,
        _io: BoxIo,
        _expected_peer: Option<PeerId>,
    ) -> Result<SecuredIo, EncryptionError> {
        std::future::pending().await
    }
}

/// Muxer backed by in-memory duplex pipes.
pub struct TestMuxer {
    protocol: String,
    next_stream_id: AtomicU64,
    streams_opened: AtomicUsize,
    incoming: Mutex<Option<mpsc::Sender<MuxedStream>>>,
    outbound_remotes: Mutex<Vec<DuplexStream>>,
    _io: Mutex<Option<BoxIo>>,
}

impl TestMuxer {
    /// Open a stream as if the remote had initiated it, returning the
    /// remote half. `None` once the muxer has stopped.
    pub async fn inject_stream(&self) -> Option<DuplexStream> {
        let sender = self.incoming.lock().clone()?;
        let (local, remote) = tokio::io::duplex(1024);
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        sender.send(MuxedStream { id, io: Box::new(local) }).await.ok()?;
        Some(remote)
    }
}

#[async_trait]
impl StreamMuxer for TestMuxer {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn open_stream(&self) -> Result<MuxedStream, MuxerError> {
        if self.incoming.lock().is_none() {
            return Err(MuxerError::Closed);
        }
        let (local, remote) = tokio::io::duplex(1024);
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        self.outbound_remotes.lock().push(remote);
        Ok(MuxedStream { id, io: Box::new(local) })
    }

    fn stream_count(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), MuxerError> {
        self.incoming.lock().take();
        Ok(())
    }

    fn abort(&self) {
        self.incoming.lock().take();
    }
}

/// Factory handing out [`TestMuxer`]s and remembering every instance so
/// tests can drive them.
pub struct TestMuxerFactory {
    protocol: String,
    created: Mutex<Vec<Arc<TestMuxer>>>,
}

impl TestMuxerFactory {
    pub fn new(protocol: &str) -> Arc<Self> {
        Arc::new(Self { protocol: protocol.to_string(), created: Mutex::new(Vec::new()) })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn muxer(&self, index: usize) -> Arc<TestMuxer> {
        Arc::clone(&self.created.lock()[index])
    }
}

impl StreamMuxerFactory for TestMuxerFactory {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn create_muxer(
        &self,
        io: BoxIo,
        _direction: Direction,
    ) -> (Arc<dyn StreamMuxer>, IncomingStreams) {
        let (tx, rx) = mpsc::channel(16);
        let muxer = Arc::new(TestMuxer {
            protocol: self.protocol.clone(),
            next_stream_id: AtomicU64::new(1),
            streams_opened: AtomicUsize::new(0),
            incoming: Mutex::new(Some(tx)),
            outbound_remotes: Mutex::new(Vec::new()),
            _io: Mutex::new(Some(io)),
        });
        self.created.lock().push(Arc::clone(&muxer));
        (muxer as Arc<dyn StreamMuxer>, rx)
    }
}

/// Insertion-ordered handler registry.
#[derive(Default)]
pub struct TestRegistrar {
    handlers: Mutex<Vec<(String, RegisteredHandler)>>,
}

impl TestRegistrar {
    pub fn register(
        &self,
        protocol: &str,
        handler: Arc<dyn StreamHandler>,
        options: HandlerOptions,
    ) {
        self.handlers.lock().push((protocol.to_string(), RegisteredHandler { handler, options }));
    }
}

impl Registrar for TestRegistrar {
    fn handler(&self, protocol: &str) -> Result<RegisteredHandler, RegistrarError> {
        self.handlers
            .lock()
            .iter()
            .find(|(registered, _)| registered == protocol)
            .map(|(_, handler)| handler.clone())
            .ok_or_else(|| RegistrarError::NoHandler(protocol.to_string()))
    }

    fn protocols(&self) -> Vec<String> {
        self.handlers.lock().iter().map(|(protocol, _)| protocol.clone()).collect()
    }
}

/// Handler that keeps every stream it is given open.
#[derive(Default)]
pub struct HoldingHandler {
    streams: Mutex<Vec<Stream>>,
}

impl HoldingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handled(&self) -> usize {
        self.streams.lock().len()
    }
}

#[async_trait]
impl StreamHandler for HoldingHandler {
    async fn handle(&self, stream: Stream, _connection: Connection) {
        self.streams.lock().push(stream);
    }
}

/// Gater with per-hook switches.
#[derive(Default)]
pub struct TestGater {
    pub deny_dial_peer: std::sync::atomic::AtomicBool,
    pub denied_multiaddrs: Mutex<Vec<Multiaddr>>,
    pub deny_inbound: std::sync::atomic::AtomicBool,
    pub deny_outbound: std::sync::atomic::AtomicBool,
    pub deny_inbound_encrypted: std::sync::atomic::AtomicBool,
    pub deny_outbound_encrypted: std::sync::atomic::AtomicBool,
    pub deny_inbound_upgraded: std::sync::atomic::AtomicBool,
    pub deny_outbound_upgraded: std::sync::atomic::AtomicBool,
}

impl ConnectionGater for TestGater {
    fn deny_dial_peer(&self, _peer: &PeerId) -> bool {
        self.deny_dial_peer.load(Ordering::SeqCst)
    }

    fn deny_dial_multiaddr(&self, addr: &Multiaddr) -> bool {
        self.denied_multiaddrs.lock().contains(addr)
    }

    fn deny_inbound_connection(&self, _remote_addr: &Multiaddr) -> bool {
        self.deny_inbound.load(Ordering::SeqCst)
    }

    fn deny_outbound_connection(&self, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        self.deny_outbound.load(Ordering::SeqCst)
    }

    fn deny_inbound_encrypted_connection(&self, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        self.deny_inbound_encrypted.load(Ordering::SeqCst)
    }

    fn deny_outbound_encrypted_connection(&self, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        self.deny_outbound_encrypted.load(Ordering::SeqCst)
    }

    fn deny_inbound_upgraded_connection(&self, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        self.deny_inbound_upgraded.load(Ordering::SeqCst)
    }

    fn deny_outbound_upgraded_connection(&self, _peer: &PeerId, _remote_addr: &Multiaddr) -> bool {
        self.deny_outbound_upgraded.load(Ordering::SeqCst)
    }
}

/// Connection manager hook that counts notifications.
#[derive(Default)]
pub struct CountingHook {
    pub after_inbound: AtomicUsize,
}

impl ConnectionManagerHook for CountingHook {
    fn after_upgrade_inbound(&self) {
        self.after_inbound.fetch_add(1, Ordering::SeqCst);
    }
}

/// Resolver with a fixed expansion table.
#[derive(Default)]
pub struct StaticResolver {
    expansions: Mutex<HashMap<Multiaddr, Vec<Multiaddr>>>,
}

impl StaticResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn expand(&self, from: Multiaddr, to: Vec<Multiaddr>) {
        self.expansions.lock().insert(from, to);
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self, addr: &Multiaddr) -> std::io::Result<Vec<Multiaddr>> {
        Ok(self.expansions.lock().get(addr).cloned().unwrap_or_default())
    }
}

/// Everything an upgrade test needs, wired together.
pub struct UpgradeEnv {
    pub upgrader: Arc<Upgrader>,
    pub events: ConnectionEvents,
    pub registrar: Arc<TestRegistrar>,
    pub peer_store: Arc<MemoryPeerStore>,
    pub muxers: Arc<TestMuxerFactory>,
    pub gater: Arc<TestGater>,
    pub negotiator: Arc<FirstProtocolNegotiator>,
    pub hook: Arc<CountingHook>,
    pub local_peer: PeerId,
    pub remote_peer: PeerId,
}

pub const TEST_ENCRYPTER: &str = "/noise";
pub const TEST_MUXER: &str = "/yamux/1.0.0";
pub const TEST_PROTOCOL: &str = "/echo/1.0.0";

pub fn upgrade_env(config: UpgraderConfig, with_muxer: bool) -> UpgradeEnv {
    upgrade_env_with_encrypters(config, with_muxer, None)
}

pub fn upgrade_env_with_encrypters(
    config: UpgraderConfig,
    with_muxer: bool,
    encrypters: Option<Vec<Arc<dyn ConnectionEncrypter>>>,
) -> UpgradeEnv {
    init_tracing();
    let local_peer = peer_id();
    let remote_peer = peer_id();
    let registrar = Arc::new(TestRegistrar::default());
    let peer_store = Arc::new(MemoryPeerStore::new());
    let muxers = TestMuxerFactory::new(TEST_MUXER);
    let gater = Arc::new(TestGater::default());
    let negotiator = Arc::new(FirstProtocolNegotiator::default());
    let events = ConnectionEvents::default();
    let hook = Arc::new(CountingHook::default());

    let encrypters = encrypters.unwrap_or_else(|| {
        vec![StaticEncrypter::new(TEST_ENCRYPTER, remote_peer) as Arc<dyn ConnectionEncrypter>]
    });
    let upgrader = Arc::new(Upgrader::new(UpgraderParts {
        local_peer,
        encrypters,
        muxers: if with_muxer {
            vec![Arc::clone(&muxers) as Arc<dyn StreamMuxerFactory>]
        } else {
            Vec::new()
        },
        protector: None,
        negotiator: Arc::clone(&negotiator) as Arc<dyn ProtocolNegotiator>,
        gater: Arc::clone(&gater) as Arc<dyn ConnectionGater>,
        registrar: Arc::clone(&registrar) as Arc<dyn Registrar>,
        peer_store: Arc::clone(&peer_store) as Arc<dyn tether_net::peer_store::PeerStore>,
        events: events.clone(),
        hooks: Some(Arc::clone(&hook) as Arc<dyn ConnectionManagerHook>),
        config,
    }));

    UpgradeEnv {
        upgrader,
        events,
        registrar,
        peer_store,
        muxers,
        gater,
        negotiator,
        hook,
        local_peer,
        remote_peer,
    }
}

/// Scripted transport behaviours keyed by address.
#[derive(Clone)]
pub enum DialScript {
    /// Resolve successfully after a delay.
    Succeed { delay: Duration },
    /// Fail after a delay.
    Fail { delay: Duration, message: String },
    /// Never resolve until the dial signal aborts.
    Hang,
}

/// What the scripted transport observed.
#[derive(Default)]
pub struct DialLog {
    pub dialed: Mutex<Vec<Multiaddr>>,
    pub aborted: Mutex<Vec<Multiaddr>>,
    concurrent: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl DialLog {
    pub fn dialed_count(&self) -> usize {
        self.dialed.lock().len()
    }

    pub fn was_dialed(&self, addr: &Multiaddr) -> bool {
        self.dialed.lock().contains(addr)
    }

    pub fn was_aborted(&self, addr: &Multiaddr) -> bool {
        self.aborted.lock().contains(addr)
    }
}

/// Transport whose dials follow per-address scripts. Successful dials run
/// the real upgrade pipeline, skipping encryption when the address embeds
/// the peer id.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<Multiaddr, DialScript>>,
    default_script: Mutex<DialScript>,
    upgrader: Arc<Upgrader>,
    pub log: Arc<DialLog>,
}

impl ScriptedTransport {
    pub fn script(&self, addr: Multiaddr, script: DialScript) {
        self.scripts.lock().insert(addr, script);
    }

    pub fn script_all(&self, script: DialScript) {
        *self.default_script.lock() = script;
    }

    async fn run(
        &self,
        addr: &Multiaddr,
        options: &TransportDialOptions,
    ) -> Result<Connection, TransportError> {
        let script = self
            .scripts
            .lock()
            .get(addr)
            .cloned()
            .unwrap_or_else(|| self.default_script.lock().clone());
        match script {
            DialScript::Succeed { delay } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let raw = raw_conn(addr.clone());
                        let upgrade_options = UpgradeOptions {
                            skip_encryption: extract_peer_id(addr).is_some(),
                            ..Default::default()
                        };
                        Ok(self.upgrader.upgrade_outbound(raw, upgrade_options).await?)
                    }
                    _ = options.signal.cancelled() => {
                        self.log.aborted.lock().push(addr.clone());
                        Err(TransportError::Aborted)
                    }
                }
            }
            DialScript::Fail { delay, message } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Err(TransportError::Failed(message)),
                    _ = options.signal.cancelled() => {
                        self.log.aborted.lock().push(addr.clone());
                        Err(TransportError::Aborted)
                    }
                }
            }
            DialScript::Hang => {
                options.signal.cancelled().await;
                self.log.aborted.lock().push(addr.clone());
                Err(TransportError::Aborted)
            }
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn dial(
        &self,
        addr: &Multiaddr,
        options: TransportDialOptions,
    ) -> Result<Connection, TransportError> {
        self.log.dialed.lock().push(addr.clone());
        let running = self.log.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_concurrent.fetch_max(running, Ordering::SeqCst);
        let result = self.run(addr, &options).await;
        self.log.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Claims every address with a TCP component.
pub struct TcpOnlyTransportManager {
    transport: Arc<ScriptedTransport>,
}

impl TransportManager for TcpOnlyTransportManager {
    fn transport_for_multiaddr(&self, addr: &Multiaddr) -> Option<Arc<dyn Transport>> {
        addr.iter()
            .any(|protocol| matches!(protocol, Protocol::Tcp(_)))
            .then(|| Arc::clone(&self.transport) as Arc<dyn Transport>)
    }
}

/// Everything a dial test needs, wired together.
pub struct DialEnv {
    pub queue: DialQueue,
    pub transport: Arc<ScriptedTransport>,
    pub log: Arc<DialLog>,
    pub peer_store: Arc<MemoryPeerStore>,
    pub gater: Arc<TestGater>,
    pub local_peer: PeerId,
}

pub fn dial_env(config: DialQueueConfig) -> DialEnv {
    dial_env_with_resolvers(config, HashMap::new())
}

pub fn dial_env_with_resolvers(
    config: DialQueueConfig,
    resolvers: HashMap<String, Arc<dyn AddressResolver>>,
) -> DialEnv {
    init_tracing();
    let local_peer = peer_id();
    let peer_store = Arc::new(MemoryPeerStore::new());
    let gater = Arc::new(TestGater::default());
    let log = Arc::new(DialLog::default());

    // The scripted transport upgrades with `skip_encryption` whenever the
    // address embeds the peer id; this encrypter covers bare addresses.
    let upgrader = Arc::new(Upgrader::new(UpgraderParts {
        local_peer,
        encrypters: vec![
            StaticEncrypter::new(TEST_ENCRYPTER, peer_id()) as Arc<dyn ConnectionEncrypter>
        ],
        muxers: Vec::new(),
        protector: None,
        negotiator: Arc::new(FirstProtocolNegotiator::default()),
        gater: Arc::new(TestGater::default()),
        registrar: Arc::new(TestRegistrar::default()),
        peer_store: Arc::clone(&peer_store) as Arc<dyn tether_net::peer_store::PeerStore>,
        events: ConnectionEvents::default(),
        hooks: None,
        config: UpgraderConfig::default(),
    }));

    let transport = Arc::new(ScriptedTransport {
        scripts: Mutex::new(HashMap::new()),
        default_script: Mutex::new(DialScript::Succeed { delay: Duration::from_millis(5) }),
        upgrader,
        log: Arc::clone(&log),
    });

    let queue = DialQueue::new(DialQueueParts {
        local_peer,
        transports: Arc::new(TcpOnlyTransportManager { transport: Arc::clone(&transport) }),
        peer_store: Arc::clone(&peer_store) as Arc<dyn tether_net::peer_store::PeerStore>,
        gater: Arc::clone(&gater) as Arc<dyn ConnectionGater>,
        resolvers,
        sorter: Arc::new(DefaultAddressSorter),
        config,
    });

    DialEnv { queue, transport, log, peer_store, gater, local_peer }
}
