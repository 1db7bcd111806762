//! Application protocol handler registry seam.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::{Connection, Stream};
use crate::error::RegistrarError;

/// Per-protocol handler options.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerOptions {
    /// Cap on concurrently open inbound streams of this protocol per
    /// connection. Falls back to the upgrader's default when unset.
    pub max_inbound_streams: Option<usize>,
    /// Cap on concurrently open outbound streams of this protocol per
    /// connection. Falls back to the upgrader's default when unset.
    pub max_outbound_streams: Option<usize>,
    /// Whether the handler may run on transient (limited) connections.
    pub run_on_transient_connection: bool,
}

/// An application handler for one protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Handle one fully negotiated inbound stream.
    async fn handle(&self, stream: Stream, connection: Connection);
}

/// A registered handler together with its options.
#[derive(Clone)]
pub struct RegisteredHandler {
    /// The handler itself.
    pub handler: Arc<dyn StreamHandler>,
    /// Its per-protocol options.
    pub options: HandlerOptions,
}

/// The catalogue of application protocol handlers.
#[auto_impl::auto_impl(&, Arc)]
pub trait Registrar: Send + Sync + 'static {
    /// The handler registered for `protocol`.
    fn handler(&self, protocol: &str) -> Result<RegisteredHandler, RegistrarError>;

    /// All currently registered capability strings, in registration order.
    fn protocols(&self) -> Vec<String>;
}
