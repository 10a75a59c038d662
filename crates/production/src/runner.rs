//! The controller task: owns the state machine, executes its actions.

use crate::metrics::Metrics;
use crate::timers::TimerManager;
use crate::transport::{InboundRequest, Transport};
use filament_core::{Action, NodeEvent, StateMachine};
use filament_gateway::AppGateway;
use filament_messages::{
    EagerSyncRequest, FastForwardRequest, FastForwardResponse, JoinRequest, Request, Response,
    SyncRequest,
};
use filament_node::NodeStateMachine;
use filament_types::{InternalTransaction, Peer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Control handle for a running node: submit work, resume, leave, stop.
#[derive(Clone)]
pub struct NodeHandle {
    event_tx: mpsc::Sender<NodeEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NodeHandle {
    pub async fn submit_transaction(&self, tx: Vec<u8>) {
        let _ = self
            .event_tx
            .send(NodeEvent::TransactionSubmitted { tx })
            .await;
    }

    pub async fn submit_internal_transaction(&self, tx: InternalTransaction) {
        let _ = self
            .event_tx
            .send(NodeEvent::InternalTransactionSubmitted { tx })
            .await;
    }

    /// Leave the suspended state and resume gossiping.
    pub async fn resume(&self) {
        let _ = self.event_tx.send(NodeEvent::ResumeRequested).await;
    }

    /// Submit our own removal; the node shuts down once it commits.
    pub async fn leave(&self) {
        let _ = self.event_tx.send(NodeEvent::LeaveRequested).await;
    }

    /// Stop immediately.
    pub async fn shutdown(&self) {
        let _ = self.event_tx.send(NodeEvent::ShutdownRequested).await;
    }

    /// Completes when the runner has stopped.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

/// Wraps the deterministic state machine with tokio I/O.
///
/// One instance per node; `run` consumes it. Everything that mutates the
/// hashgraph happens on this task, in `dispatch`.
pub struct NodeRunner {
    sm: NodeStateMachine,
    event_tx: mpsc::Sender<NodeEvent>,
    event_rx: mpsc::Receiver<NodeEvent>,
    inbound_rx: mpsc::Receiver<InboundRequest>,
    transport: Arc<dyn Transport>,
    gateway: Arc<dyn AppGateway>,
    timers: TimerManager,
    metrics: Arc<Metrics>,
    pending_replies: HashMap<u64, oneshot::Sender<Response>>,
    next_token: u64,
    sync_timeout: Duration,
    join_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl NodeRunner {
    pub fn new(
        sm: NodeStateMachine,
        transport: Arc<dyn Transport>,
        inbound_rx: mpsc::Receiver<InboundRequest>,
        gateway: Arc<dyn AppGateway>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = broadcast::channel(4);
        let timers = TimerManager::new(event_tx.clone());
        let sync_timeout = sm.config().tcp_timeout;
        let join_timeout = sm.config().join_timeout;
        NodeRunner {
            sm,
            event_tx,
            event_rx,
            inbound_rx,
            transport,
            gateway,
            timers,
            metrics,
            pending_replies: HashMap::new(),
            next_token: 0,
            sync_timeout,
            join_timeout,
            shutdown_tx,
        }
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            event_tx: self.event_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Run the controller loop until shutdown.
    pub async fn run(mut self) {
        // Drain the application's submit channel into the event stream.
        if let Some(mut submit_rx) = self.gateway.take_submit_channel() {
            let event_tx = self.event_tx.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        tx = submit_rx.recv() => match tx {
                            Some(tx) => {
                                let _ = event_tx
                                    .send(NodeEvent::TransactionSubmitted { tx })
                                    .await;
                            }
                            None => return,
                        }
                    }
                }
            });
        }

        self.set_time();
        let actions = self.sm.init();
        self.execute_all(actions).await;

        let mut event_rx = std::mem::replace(&mut self.event_rx, mpsc::channel(1).1);
        let mut inbound_rx = std::mem::replace(&mut self.inbound_rx, mpsc::channel(1).1);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                Some(inbound) = inbound_rx.recv() => {
                    let event = self.register_inbound(inbound);
                    self.dispatch(event).await;
                }
                Some(event) = event_rx.recv() => {
                    self.dispatch(event).await;
                }
                else => break,
            }
        }

        self.timers.cancel_all();
        info!("Node runner stopped");
    }

    fn set_time(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        self.sm.set_time(now);
    }

    fn register_inbound(&mut self, inbound: InboundRequest) -> NodeEvent {
        let token = filament_core::RequestToken(self.next_token);
        self.next_token += 1;
        self.metrics
            .inbound_requests
            .with_label_values(&[inbound.request.kind()])
            .inc();
        self.pending_replies.insert(token.0, inbound.reply);
        match inbound.request {
            Request::Sync(r) => NodeEvent::SyncRequestReceived {
                from: r.from_id,
                known: r.known,
                token,
            },
            Request::EagerSync(r) => NodeEvent::EagerSyncRequestReceived {
                from: r.from_id,
                events: r.events,
                token,
            },
            Request::FastForward(r) => NodeEvent::FastForwardRequestReceived {
                from: r.from_id,
                token,
            },
            Request::Join(r) => NodeEvent::JoinRequestReceived {
                peer: r.peer,
                token,
            },
        }
    }

    async fn dispatch(&mut self, event: NodeEvent) {
        self.set_time();
        trace!(event = event.type_name(), "Dispatching");
        let actions = self.sm.handle(event);
        self.update_gauges();
        self.execute_all(actions).await;
    }

    fn update_gauges(&mut self) {
        let stats = self.sm.core().hashgraph().stats();
        self.metrics.undecided_events.set(stats.undetermined as i64);
        if let Some(round) = stats.last_consensus_round {
            self.metrics.last_consensus_round.set(round as i64);
        }
        for (peer, count) in self.sm.invalid_event_counts() {
            self.metrics
                .invalid_events
                .with_label_values(&[&peer.to_string()])
                .set(*count as i64);
        }
    }

    async fn execute_all(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: Action) {
        trace!(action = action.type_name(), "Executing");
        match action {
            Action::SendSyncRequest { to, known } => {
                let from_id = self.my_id();
                self.exchange(to, "sync", Request::Sync(SyncRequest { from_id, known }));
            }

            Action::SendEagerSyncRequest { to, events } => {
                let from_id = self.my_id();
                self.exchange(
                    to,
                    "eager_sync",
                    Request::EagerSync(EagerSyncRequest { from_id, events }),
                );
            }

            Action::SendFastForwardRequest { to } => {
                let from_id = self.my_id();
                self.exchange(
                    to,
                    "fast_forward",
                    Request::FastForward(FastForwardRequest { from_id }),
                );
            }

            Action::SendJoinRequest { to, peer } => {
                self.exchange(to, "join", Request::Join(JoinRequest { peer }));
            }

            Action::Reply { token, response } => {
                if let Some(reply) = self.pending_replies.remove(&token.0) {
                    let _ = reply.send(response);
                }
            }

            Action::ReplyFastForward {
                token,
                from_id,
                block,
                frame,
            } => {
                let Some(reply) = self.pending_replies.remove(&token.0) else {
                    return;
                };
                let gateway = self.gateway.clone();
                tokio::spawn(async move {
                    let index = block.index();
                    let snapshot =
                        tokio::task::spawn_blocking(move || gateway.get_snapshot(index)).await;
                    let response = match snapshot {
                        Ok(Ok(snapshot)) => Response::FastForward(FastForwardResponse {
                            from_id,
                            block,
                            frame,
                            snapshot,
                        }),
                        Ok(Err(e)) => {
                            warn!(error = %e, "Snapshot unavailable");
                            Response::Unavailable(e.to_string())
                        }
                        Err(e) => {
                            warn!(error = %e, "Snapshot task failed");
                            Response::Unavailable("snapshot task failed".into())
                        }
                    };
                    let _ = reply.send(response);
                });
            }

            Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),

            Action::CancelTimer { id } => self.timers.cancel_timer(id),

            Action::CommitBlock { block } => {
                let gateway = self.gateway.clone();
                let event_tx = self.event_tx.clone();
                self.metrics.blocks_committed.set(block.index() as i64);
                tokio::spawn(async move {
                    let index = block.index();
                    let result =
                        tokio::task::spawn_blocking(move || gateway.commit_block(block)).await;
                    let event = match result {
                        Ok(Ok(resp)) => NodeEvent::CommitResponseReceived {
                            block_index: index,
                            state_hash: resp.state_hash,
                            receipts: resp.receipts,
                        },
                        Ok(Err(e)) => {
                            // The application refusing a block is fatal:
                            // consensus and application state have split.
                            error!(error = %e, block = index, "Application commit failed");
                            NodeEvent::ShutdownRequested
                        }
                        Err(e) => {
                            error!(error = %e, "Commit task panicked");
                            NodeEvent::ShutdownRequested
                        }
                    };
                    let _ = event_tx.send(event).await;
                });
            }

            Action::RestoreSnapshot {
                block_index,
                snapshot,
            } => {
                let gateway = self.gateway.clone();
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let result =
                        tokio::task::spawn_blocking(move || gateway.restore(&snapshot)).await;
                    match result {
                        Ok(Ok(())) => {
                            let _ = event_tx
                                .send(NodeEvent::SnapshotRestored { block_index })
                                .await;
                        }
                        Ok(Err(e)) => {
                            // Stay in CatchingUp; the next heartbeat retries
                            // against another peer.
                            warn!(error = %e, "Snapshot restore failed");
                        }
                        Err(e) => warn!(error = %e, "Restore task failed"),
                    }
                });
            }

            Action::NotifyStateChanged { state } => {
                debug!(%state, "State changed");
                self.metrics.set_node_state(state);
                self.gateway.on_state_changed(state);
            }

            Action::Shutdown => {
                let _ = self.shutdown_tx.send(());
            }
        }
    }

    fn my_id(&mut self) -> u32 {
        self.sm.core_mut().peer_id().unwrap_or(u32::MAX)
    }

    /// Fire one outbound exchange on its own task; the outcome comes back
    /// as a NodeEvent.
    fn exchange(&mut self, to: Peer, kind: &'static str, request: Request) {
        let transport = self.transport.clone();
        let event_tx = self.event_tx.clone();
        let metrics = self.metrics.clone();
        let timeout = if kind == "join" {
            self.join_timeout
        } else {
            self.sync_timeout
        };
        metrics.outbound_requests.with_label_values(&[kind]).inc();

        tokio::spawn(async move {
            let result = transport.request(&to.net_addr, request, timeout).await;
            let event = match result {
                Ok(Response::Sync(r)) => NodeEvent::SyncResponseReceived {
                    peer: r.from_id,
                    events: r.events,
                    known: r.known,
                },
                Ok(Response::EagerSync(r)) => NodeEvent::EagerSyncResponseReceived {
                    peer: r.from_id,
                    success: r.success,
                },
                Ok(Response::FastForward(r)) => NodeEvent::FastForwardResponseReceived {
                    peer: r.from_id,
                    block: r.block,
                    frame: r.frame,
                    snapshot: r.snapshot,
                },
                Ok(Response::Join(r)) => NodeEvent::JoinResponseReceived {
                    accepted: r.accepted,
                    accepted_round: r.accepted_round,
                    peers: r.peers,
                },
                Ok(Response::Unavailable(reason)) => {
                    debug!(peer = %to.moniker, reason, "Peer unavailable");
                    metrics.outbound_failures.with_label_values(&[kind]).inc();
                    NodeEvent::SyncFailed { peer: to.id }
                }
                Err(e) => {
                    debug!(peer = %to.moniker, error = %e, "Exchange failed");
                    metrics.outbound_failures.with_label_values(&[kind]).inc();
                    NodeEvent::SyncFailed { peer: to.id }
                }
            };
            let _ = event_tx.send(event).await;
        });
    }
}
