//! Dial pipeline: address vetting, deduplication and candidate racing.
//!
//! A dial request names a peer, explicit addresses, or both. The queue
//! expands and vets candidate addresses, joins overlapping requests onto
//! the same pending dial, and races the candidates under a per-request
//! and a global concurrency cap. The first successfully upgraded
//! connection wins and every other attempt is cancelled.

mod addresses;
mod slots;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use tether_primitives::{unix_now_millis, Multiaddr, PeerId};

use crate::api::{
    AddressResolver, AddressSorter, ConnectionGater, TransportDialOptions, TransportManager,
};
use crate::connection::Connection;
use crate::error::DialError;
use crate::peer_store::PeerStore;

use self::slots::DialSlots;

/// Peer-store metadata key recording when a dial to the peer last failed.
/// The value is the Unix-millis timestamp as decimal UTF-8 bytes.
pub const LAST_DIAL_FAILURE_KEY: &str = "last-dial-failure";

const DEFAULT_MAX_PARALLEL_DIALS: usize = 100;
const DEFAULT_MAX_PARALLEL_DIALS_PER_PEER: usize = 10;
const DEFAULT_MAX_PEER_ADDRS_TO_DIAL: usize = 25;
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DIAL_PRIORITY: u8 = 50;

/// Dial queue configuration.
#[derive(Debug, Clone)]
pub struct DialQueueConfig {
    /// Cap on dial attempts running concurrently across all requests.
    pub max_parallel_dials: usize,
    /// Cap on candidate attempts racing within a single request.
    pub max_parallel_dials_per_peer: usize,
    /// Hard cap on candidate addresses per request.
    pub max_peer_addrs_to_dial: usize,
    /// Budget for one dial request, including the connection upgrade.
    pub dial_timeout: Duration,
}

impl Default for DialQueueConfig {
    fn default() -> Self {
        Self {
            max_parallel_dials: DEFAULT_MAX_PARALLEL_DIALS,
            max_parallel_dials_per_peer: DEFAULT_MAX_PARALLEL_DIALS_PER_PEER,
            max_peer_addrs_to_dial: DEFAULT_MAX_PEER_ADDRS_TO_DIAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// What to dial.
#[derive(Debug, Clone)]
pub enum DialTarget {
    /// A peer whose addresses come from the peer store.
    Peer(PeerId),
    /// Explicit addresses, optionally embedding the peer identity.
    Addrs(Vec<Multiaddr>),
    /// A peer together with explicit addresses to reach it on.
    PeerWithAddrs(PeerId, Vec<Multiaddr>),
}

impl From<PeerId> for DialTarget {
    fn from(peer: PeerId) -> Self {
        Self::Peer(peer)
    }
}

impl From<Multiaddr> for DialTarget {
    fn from(addr: Multiaddr) -> Self {
        Self::Addrs(vec![addr])
    }
}

impl From<Vec<Multiaddr>> for DialTarget {
    fn from(addrs: Vec<Multiaddr>) -> Self {
        Self::Addrs(addrs)
    }
}

/// Per-dial options.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Caller cancellation signal.
    pub signal: Option<CancellationToken>,
    /// Advisory admission priority; higher runs earlier under contention.
    pub priority: u8,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self { signal: None, priority: DEFAULT_DIAL_PRIORITY }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialStatus {
    Queued,
    Active,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortCause {
    Timeout,
    Caller,
}

type SharedCompletion = Shared<BoxFuture<'static, Result<Connection, DialError>>>;

struct PendingDial {
    id: String,
    peer_id: Option<PeerId>,
    addrs: Vec<Multiaddr>,
    status: Arc<Mutex<DialStatus>>,
    completion: SharedCompletion,
}

impl PendingDial {
    fn matches(&self, peer_id: Option<&PeerId>, addrs: &[Multiaddr]) -> bool {
        if let (Some(requested), Some(pending)) = (peer_id, self.peer_id.as_ref()) {
            if requested == pending {
                return true;
            }
        }
        self.addrs == addrs
    }
}

/// Everything the dial queue needs from its environment.
pub struct DialQueueParts {
    /// Identity of the local node, used to refuse self-dials.
    pub local_peer: PeerId,
    /// Transport driver lookup.
    pub transports: Arc<dyn TransportManager>,
    /// Source of known addresses and sink for dial-failure metadata.
    pub peer_store: Arc<dyn PeerStore>,
    /// Policy hooks.
    pub gater: Arc<dyn ConnectionGater>,
    /// Resolvers keyed by DNS scheme name (e.g. `dnsaddr`).
    pub resolvers: HashMap<String, Arc<dyn AddressResolver>>,
    /// Candidate ordering.
    pub sorter: Arc<dyn AddressSorter>,
    /// Tunables.
    pub config: DialQueueConfig,
}

pub(crate) struct DialQueueInner {
    pub(crate) local_peer: PeerId,
    pub(crate) transports: Arc<dyn TransportManager>,
    pub(crate) peer_store: Arc<dyn PeerStore>,
    pub(crate) gater: Arc<dyn ConnectionGater>,
    pub(crate) resolvers: HashMap<String, Arc<dyn AddressResolver>>,
    pub(crate) sorter: Arc<dyn AddressSorter>,
    pub(crate) config: DialQueueConfig,
    pending: Mutex<Vec<PendingDial>>,
    shutdown: CancellationToken,
    slots: Arc<DialSlots>,
}

/// The dial pipeline.
pub struct DialQueue {
    inner: Arc<DialQueueInner>,
}

#[derive(Clone)]
struct DialContext {
    inner: Arc<DialQueueInner>,
    id: String,
    peer_id: Option<PeerId>,
    priority: u8,
    cancel: CancellationToken,
    cause: Arc<OnceLock<AbortCause>>,
    status: Arc<Mutex<DialStatus>>,
}

impl DialQueue {
    pub fn new(parts: DialQueueParts) -> Self {
        let slots = DialSlots::new(parts.config.max_parallel_dials);
        Self {
            inner: Arc::new(DialQueueInner {
                local_peer: parts.local_peer,
                transports: parts.transports,
                peer_store: parts.peer_store,
                gater: parts.gater,
                resolvers: parts.resolvers,
                sorter: parts.sorter,
                config: parts.config,
                pending: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                slots,
            }),
        }
    }

    /// Number of dial attempts waiting for a free slot.
    pub fn pending_dial_count(&self) -> usize {
        self.inner.slots.pending()
    }

    /// Number of dial attempts currently running.
    pub fn in_progress_dial_count(&self) -> usize {
        self.inner.slots.in_use()
    }

    /// Cancel every pending and in-flight dial and refuse new ones.
    /// Idempotent.
    pub fn stop(&self) {
        debug!("stopping dial queue");
        self.inner.shutdown.cancel();
    }

    /// Dial `target`, returning the first vetted, upgraded connection.
    ///
    /// A request overlapping an in-flight dial (same peer, or identical
    /// candidate set) joins it and resolves with the same connection.
    pub async fn dial(
        &self,
        target: impl Into<DialTarget>,
        options: DialOptions,
    ) -> Result<Connection, DialError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(DialError::Aborted);
        }

        let (peer_id, given) = addresses::normalize_target(target.into())?;

        // Combined signal: dial timeout, queue shutdown (as the parent
        // token), and the caller's own signal.
        let cancel = inner.shutdown.child_token();
        let cause = Arc::new(OnceLock::new());
        spawn_signal_watcher(
            cancel.clone(),
            Arc::clone(&cause),
            options.signal.clone(),
            inner.config.dial_timeout,
        );

        let candidates = match addresses::calculate(inner, peer_id, given, &cancel).await {
            Ok(candidates) => candidates,
            Err(error) => {
                cancel.cancel();
                return Err(error);
            }
        };

        // Join an identical in-flight dial, or register a new one. Both
        // happen under one lock so concurrent requests cannot miss each
        // other.
        let (completion, joined) = {
            let mut pending = inner.pending.lock();
            let existing = pending
                .iter()
                .find(|dial| dial.matches(peer_id.as_ref(), &candidates))
                .map(|dial| {
                    trace!(
                        id = %dial.id,
                        status = ?*dial.status.lock(),
                        "joining in-flight dial"
                    );
                    dial.completion.clone()
                });
            match existing {
                Some(completion) => (completion, true),
                None => {
                    let id = format!("{:016x}", rand::random::<u64>());
                    let status = Arc::new(Mutex::new(DialStatus::Queued));
                    let context = DialContext {
                        inner: Arc::clone(inner),
                        id: id.clone(),
                        peer_id,
                        priority: options.priority,
                        cancel: cancel.clone(),
                        cause: Arc::clone(&cause),
                        status: Arc::clone(&status),
                    };
                    let completion: SharedCompletion =
                        perform_dial(context, candidates.clone()).boxed().shared();
                    debug!(%id, peer = ?peer_id, addrs = candidates.len(), "dial queued");
                    pending.push(PendingDial {
                        id,
                        peer_id,
                        addrs: candidates,
                        status,
                        completion: completion.clone(),
                    });
                    (completion, false)
                }
            }
        };

        if joined {
            // The joined dial runs on its own combined signal.
            cancel.cancel();
            return completion.await;
        }

        // Drive the dial to completion even if every caller goes away, so
        // bookkeeping always runs.
        tokio::spawn({
            let completion = completion.clone();
            async move {
                let _ = completion.await;
            }
        });

        completion.await
    }
}

fn spawn_signal_watcher(
    cancel: CancellationToken,
    cause: Arc<OnceLock<AbortCause>>,
    caller: Option<CancellationToken>,
    timeout: Duration,
) {
    tokio::spawn(async move {
        let caller_cancelled = async {
            match caller {
                Some(signal) => signal.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            // Resolved: the dial finished or the queue shut down.
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                let _ = cause.set(AbortCause::Timeout);
                cancel.cancel();
            }
            _ = caller_cancelled => {
                let _ = cause.set(AbortCause::Caller);
                cancel.cancel();
            }
        }
    });
}

async fn perform_dial(context: DialContext, candidates: Vec<Multiaddr>) -> Result<Connection, DialError> {
    let result = race_candidates(&context, candidates).await;

    *context.status.lock() =
        if result.is_ok() { DialStatus::Success } else { DialStatus::Error };

    let result = match result {
        Ok(connection) => Ok(connection),
        Err(error) => {
            // Best effort: remember when this peer last failed to dial.
            if let Some(peer) = &context.peer_id {
                let stamp = unix_now_millis().to_string().into_bytes();
                if let Err(store_error) =
                    context.inner.peer_store.patch_metadata(peer, LAST_DIAL_FAILURE_KEY, stamp)
                {
                    warn!(peer = %peer, error = %store_error, "failed to record dial failure");
                }
            }
            // The terminal error kind reflects why the combined signal
            // fired, if it did.
            match context.cause.get() {
                Some(AbortCause::Timeout) => Err(DialError::Timeout),
                Some(AbortCause::Caller) => Err(DialError::Aborted),
                None if context.cancel.is_cancelled() => Err(DialError::Aborted),
                None => Err(error),
            }
        }
    };

    context.inner.pending.lock().retain(|dial| dial.id != context.id);
    context.cancel.cancel();
    match &result {
        Ok(connection) => {
            debug!(id = %context.id, conn = connection.id(), "dial succeeded")
        }
        Err(error) => debug!(id = %context.id, %error, "dial failed"),
    }
    result
}

async fn race_candidates(
    context: &DialContext,
    candidates: Vec<Multiaddr>,
) -> Result<Connection, DialError> {
    let per_dial = DialSlots::new(context.inner.config.max_parallel_dials_per_peer);
    let controllers: Vec<CancellationToken> =
        candidates.iter().map(|_| context.cancel.child_token()).collect();
    let winner: Arc<Mutex<Option<usize>>> = Arc::new(Mutex::new(None));

    let mut attempts: FuturesUnordered<BoxFuture<'static, (usize, Result<Connection, DialError>)>> =
        candidates
            .into_iter()
            .enumerate()
            .map(|(index, addr)| {
                attempt(
                    context.clone(),
                    addr,
                    index,
                    controllers.clone(),
                    Arc::clone(&per_dial),
                    Arc::clone(&winner),
                )
                .boxed()
            })
            .collect();

    let mut failures: Vec<(usize, DialError)> = Vec::new();
    loop {
        match attempts.next().await {
            Some((_, Ok(connection))) => {
                // Let the losing attempts settle against their cancelled
                // controllers in the background.
                tokio::spawn(async move {
                    let mut attempts = attempts;
                    while attempts.next().await.is_some() {}
                });
                return Ok(connection);
            }
            Some((index, Err(error))) => failures.push((index, error)),
            None => break,
        }
    }

    // Every candidate failed. A single attempt surfaces its own error;
    // several aggregate in candidate order.
    failures.sort_by_key(|(index, _)| *index);
    let mut errors: Vec<DialError> = failures.into_iter().map(|(_, error)| error).collect();
    if errors.len() == 1 {
        Err(errors.remove(0))
    } else {
        Err(DialError::Aggregate(errors))
    }
}

async fn attempt(
    context: DialContext,
    addr: Multiaddr,
    index: usize,
    controllers: Vec<CancellationToken>,
    per_dial: Arc<DialSlots>,
    winner: Arc<Mutex<Option<usize>>>,
) -> (usize, Result<Connection, DialError>) {
    let controller = controllers[index].clone();

    // Admission: a slot in this dial's queue, then a global slot. Holding
    // the per-dial slot while waiting globally keeps one peer with many
    // addresses from starving other requests.
    let Some(_per_dial_slot) = per_dial.acquire(context.priority, &controller).await else {
        return (index, Err(DialError::Aborted));
    };
    let Some(_global_slot) = context.inner.slots.acquire(context.priority, &controller).await
    else {
        return (index, Err(DialError::Aborted));
    };
    if controller.is_cancelled() {
        return (index, Err(DialError::Aborted));
    }

    {
        let mut status = context.status.lock();
        if *status == DialStatus::Queued {
            *status = DialStatus::Active;
        }
    }

    let Some(transport) = context.inner.transports.transport_for_multiaddr(&addr) else {
        // Filtered when candidates were calculated; a transport removed
        // since then still fails cleanly.
        return (
            index,
            Err(DialError::Transport { addr, message: "no transport for address".to_string() }),
        );
    };

    debug!(id = %context.id, %addr, "dialing");
    let dialed = transport
        .dial(&addr, TransportDialOptions { signal: controller.clone() })
        .await;
    let connection = match dialed {
        Ok(connection) => connection,
        Err(error) => {
            let error = if controller.is_cancelled() {
                DialError::Aborted
            } else {
                DialError::Transport { addr: addr.clone(), message: error.to_string() }
            };
            return (index, Err(error));
        }
    };

    // A sibling may have won while the transport was finishing.
    let won = {
        let mut winner = winner.lock();
        if controller.is_cancelled() || winner.is_some() {
            false
        } else {
            *winner = Some(index);
            true
        }
    };
    if !won {
        debug!(id = %context.id, %addr, "discarding redundant connection");
        tokio::spawn(async move {
            let _ = connection.close().await;
        });
        return (index, Err(DialError::Aborted));
    }

    trace!(id = %context.id, %addr, "candidate won the race");
    for (sibling, token) in controllers.iter().enumerate() {
        if sibling != index {
            token.cancel();
        }
    }
    (index, Ok(connection))
}
