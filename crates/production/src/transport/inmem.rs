//! In-memory transport for tests and simulations.

use super::{InboundRequest, Transport, TransportError};
use async_trait::async_trait;
use filament_messages::{Request, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A process-local "network": a registry of listening addresses.
#[derive(Clone, Default)]
pub struct InmemNetwork {
    routes: Arc<Mutex<HashMap<String, mpsc::Sender<InboundRequest>>>>,
}

impl InmemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node at `addr`; returns its transport and the stream of
    /// inbound requests.
    pub fn join(&self, addr: &str) -> (Arc<InmemTransport>, mpsc::Receiver<InboundRequest>) {
        let (tx, rx) = mpsc::channel(64);
        self.routes.lock().insert(addr.to_string(), tx);
        (
            Arc::new(InmemTransport {
                network: self.clone(),
            }),
            rx,
        )
    }

    /// Detach a node, simulating a crash or departure.
    pub fn leave(&self, addr: &str) {
        self.routes.lock().remove(addr);
    }
}

/// Transport endpoint bound to an [`InmemNetwork`].
pub struct InmemTransport {
    network: InmemNetwork,
}

#[async_trait]
impl Transport for InmemTransport {
    async fn request(
        &self,
        addr: &str,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let target = self
            .network
            .routes
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::PeerUnknown(addr.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        target
            .send(InboundRequest {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(addr.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_messages::{FastForwardRequest, JoinResponse};

    #[tokio::test]
    async fn request_reply_round_trip() {
        let network = InmemNetwork::new();
        let (transport, mut inbound) = network.join("a");
        let (_echo, mut echo_rx) = network.join("b");

        tokio::spawn(async move {
            while let Some(req) = echo_rx.recv().await {
                let _ = req.reply.send(Response::Join(JoinResponse {
                    from_id: 1,
                    accepted: true,
                    accepted_round: 0,
                    peers: vec![],
                }));
            }
        });
        drop(inbound.try_recv());

        let response = transport
            .request(
                "b",
                Request::FastForward(FastForwardRequest { from_id: 0 }),
                Duration::from_millis(500),
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Join(_)));
    }

    #[tokio::test]
    async fn unknown_address_errors() {
        let network = InmemNetwork::new();
        let (transport, _inbound) = network.join("a");
        let err = transport
            .request(
                "nowhere",
                Request::FastForward(FastForwardRequest { from_id: 0 }),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PeerUnknown(_)));
    }

    #[tokio::test]
    async fn dropped_reply_is_a_closed_connection() {
        let network = InmemNetwork::new();
        let (transport, _inbound) = network.join("a");
        let (_t, mut rx) = network.join("b");
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                drop(req.reply);
            }
        });

        let err = transport
            .request(
                "b",
                Request::FastForward(FastForwardRequest { from_id: 0 }),
                Duration::from_millis(500),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
