//! Peer transport: request/response delivery for the four message kinds.
//!
//! The transport does not authenticate peers; event signatures inside the
//! payloads carry the authentication. Two implementations: a pooled TCP
//! transport for production and an in-memory router for tests.

mod inmem;
mod tcp;

pub use inmem::{InmemNetwork, InmemTransport};
pub use tcp::TcpTransport;

use crate::codec::CodecError;
use async_trait::async_trait;
use filament_messages::{Request, Response};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("connection closed")]
    Closed,

    #[error("unknown peer address {0}")]
    PeerUnknown(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// An inbound request plus the channel its reply travels back on.
/// Dropping the reply sender aborts the exchange; the remote sees a
/// closed connection.
#[derive(Debug)]
pub struct InboundRequest {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

/// Outbound half of the transport. Inbound requests arrive on the channel
/// returned when the transport is constructed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request/response exchange within `timeout`.
    async fn request(
        &self,
        addr: &str,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, TransportError>;
}
