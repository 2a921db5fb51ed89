//! Transport trait for live-timing data sources.

use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::types::StreamId;

/// One event received from a transport: which stream it belongs to and the
/// raw payload. The consumer owns the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub stream: StreamId,
    pub payload: Value,
}

/// Trait for live-timing sources.
///
/// Transports abstract over the push feed and local replay and handle their
/// own timing internally: the SignalR transport blocks on the socket, the
/// replay transport paces frames to wall-clock speed.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Establish (or re-establish) the underlying connection. Called once by
    /// the bus before the first [`Transport::next_event`].
    async fn ensure_connection(&mut self) -> Result<()>;

    /// Get the next event.
    ///
    /// Returns:
    /// - `Ok(Some(event))` - new event available
    /// - `Ok(None)` - stream ended (normal termination)
    /// - `Err(e)` - transport failure; the bus reconnects with back-off
    async fn next_event(&mut self) -> Result<Option<TransportEvent>>;

    /// Release the connection. Must be safe to call more than once.
    async fn close(&mut self);
}

/// Factory producing a fresh transport for every (re)connect attempt.
///
/// Returning an error stops the bus supervision loop; a completed replay
/// uses this to prevent reconnect attempts against a drained transport.
pub type TransportFactory = Arc<dyn Fn() -> Result<Box<dyn Transport>> + Send + Sync>;
