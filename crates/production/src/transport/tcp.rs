//! TCP transport with a bounded connection pool per target.

use super::{InboundRequest, Transport, TransportError};
use crate::codec::{read_frame, write_frame};
use async_trait::async_trait;
use filament_messages::{Request, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Pooled TCP transport.
///
/// Outbound connections are kept-alive and reused, at most `max_pool` per
/// target; a request checks one out, performs a single framed exchange
/// under the caller's deadline, and returns it on success. Errors discard
/// the connection.
pub struct TcpTransport {
    pool: Mutex<HashMap<String, Vec<TcpStream>>>,
    max_pool: usize,
    local_addr: std::net::SocketAddr,
}

impl TcpTransport {
    /// Bind `addr` and start serving inbound requests onto the returned
    /// channel. The accept loop stops when `shutdown` fires.
    pub async fn bind(
        addr: &str,
        max_pool: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundRequest>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let transport = Arc::new(TcpTransport {
            pool: Mutex::new(HashMap::new()),
            max_pool: max_pool.max(1),
            local_addr,
        });
        tokio::spawn(accept_loop(listener, inbound_tx, shutdown));
        Ok((transport, inbound_rx))
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    fn checkout(&self, addr: &str) -> Option<TcpStream> {
        self.pool.lock().get_mut(addr).and_then(Vec::pop)
    }

    fn checkin(&self, addr: &str, stream: TcpStream) {
        let mut pool = self.pool.lock();
        let slot = pool.entry(addr.to_string()).or_default();
        if slot.len() < self.max_pool {
            slot.push(stream);
        }
    }

    async fn exchange(
        stream: &mut TcpStream,
        request: &Request,
    ) -> Result<Response, TransportError> {
        write_frame(stream, request).await?;
        Ok(read_frame(stream).await?)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(
        &self,
        addr: &str,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;

        // Prefer a pooled connection; it may have gone stale, in which
        // case fall back to a fresh one before the deadline.
        if let Some(mut stream) = self.checkout(addr) {
            match tokio::time::timeout_at(deadline, Self::exchange(&mut stream, &request)).await {
                Ok(Ok(response)) => {
                    self.checkin(addr, stream);
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    trace!(addr, error = %e, "Pooled connection failed; reconnecting");
                }
                Err(_) => return Err(TransportError::Timeout(addr.to_string())),
            }
        }

        let connect = tokio::time::timeout_at(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(addr.to_string()))?;
        let mut stream = connect?;
        match tokio::time::timeout_at(deadline, Self::exchange(&mut stream, &request)).await {
            Ok(Ok(response)) => {
                self.checkin(addr, stream);
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout(addr.to_string())),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound_tx: mpsc::Sender<InboundRequest>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("Transport accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    trace!(%remote, "Inbound connection");
                    tokio::spawn(serve_connection(stream, inbound_tx.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            }
        }
    }
}

/// Serve framed requests on one connection until it closes. Requests on a
/// single connection are handled in order.
async fn serve_connection(mut stream: TcpStream, inbound_tx: mpsc::Sender<InboundRequest>) {
    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                trace!(error = %e, "Connection closed");
                return;
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if inbound_tx
            .send(InboundRequest {
                request,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return;
        }
        // Controller dropped the reply: abandon the exchange.
        let Ok(response) = reply_rx.await else { return };
        if let Err(e) = write_frame(&mut stream, &response).await {
            trace!(error = %e, "Failed to write response");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_messages::{FastForwardRequest, JoinResponse};

    #[tokio::test]
    async fn tcp_request_reply_round_trip() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (server, mut inbound) = TcpTransport::bind("127.0.0.1:0", 2, shutdown_tx.subscribe())
            .await
            .unwrap();
        let addr = server.local_addr().to_string();
        tokio::spawn(async move {
            while let Some(req) = inbound.recv().await {
                assert!(matches!(req.request, Request::FastForward(_)));
                let _ = req.reply.send(Response::Join(JoinResponse {
                    from_id: 0,
                    accepted: false,
                    accepted_round: 0,
                    peers: vec![],
                }));
            }
        });

        let client = server;
        let response = client
            .request(
                &addr,
                Request::FastForward(FastForwardRequest { from_id: 1 }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Join(_)));

        // The connection is pooled and reused.
        let response = client
            .request(
                &addr,
                Request::FastForward(FastForwardRequest { from_id: 1 }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Join(_)));
    }

    #[tokio::test]
    async fn connect_to_dead_peer_times_out_or_errors() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (client, _inbound) = TcpTransport::bind("127.0.0.1:0", 2, shutdown_tx.subscribe())
            .await
            .unwrap();
        let result = client
            .request(
                "127.0.0.1:1",
                Request::FastForward(FastForwardRequest { from_id: 0 }),
                Duration::from_millis(300),
            )
            .await;
        assert!(result.is_err());
    }
}
