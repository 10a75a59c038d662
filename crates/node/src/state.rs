//! The node life-cycle state machine.

use crate::{Core, NodeConfig, PeerSelector};
use filament_core::{Action, NodeEvent, NodeState, RequestToken, StateMachine, TimerId};
use filament_hashgraph::HashgraphError;
use filament_store::Store;
use filament_messages::{
    EagerSyncResponse, JoinResponse, Response, SyncResponse,
};
use filament_types::{
    Block, Event, Frame, InternalTransaction, InternalTransactionKind,
    InternalTransactionReceipt, KnownEvents, Peer, PeerSet,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consecutive saturated sync responses before fast-sync kicks in.
const SATURATED_SYNC_THRESHOLD: u32 = 3;

/// A join proposal waiting for its membership block to commit.
#[derive(Debug)]
struct ParkedJoin {
    token: RequestToken,
    peer: Peer,
    deadline: Duration,
}

/// The node state machine: routes events to the core and drives the
/// Babbling / CatchingUp / Joining / Leaving / Suspended / Shutdown life
/// cycle. All I/O happens in the runner via the returned actions.
pub struct NodeStateMachine {
    config: NodeConfig,
    core: Core,
    state: NodeState,
    /// Our own peer record, advertised in join requests.
    local_peer: Peer,
    selector: PeerSelector,
    now: Duration,

    /// One outbound sync exchange at a time.
    sync_in_flight: bool,
    /// Consecutive sync responses that filled the sync limit.
    saturated_syncs: u32,
    /// Blocks awaiting application commit, dispatched one at a time.
    pending_commits: VecDeque<Block>,
    commit_in_flight: bool,
    parked_joins: Vec<ParkedJoin>,
    /// Invalid events received per peer id. Observable for scoring; the
    /// core never bans automatically.
    invalid_by_peer: HashMap<u32, u64>,
}

impl NodeStateMachine {
    pub fn new(config: NodeConfig, core: Core, local_peer: Peer) -> Self {
        let mut core = core;
        let state = if config.maintenance_mode {
            NodeState::Suspended
        } else if core.peer_id().is_none() {
            NodeState::Joining
        } else {
            NodeState::Babbling
        };
        NodeStateMachine {
            config,
            core,
            state,
            local_peer,
            selector: PeerSelector::new(),
            now: Duration::ZERO,
            sync_in_flight: false,
            saturated_syncs: 0,
            pending_commits: VecDeque::new(),
            commit_in_flight: false,
            parked_joins: Vec::new(),
            invalid_by_peer: HashMap::new(),
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    /// Invalid-event counts per peer id, for metrics.
    pub fn invalid_event_counts(&self) -> &HashMap<u32, u64> {
        &self.invalid_by_peer
    }

    fn note_invalid(&mut self, peer: u32, count: usize) {
        if count > 0 {
            *self.invalid_by_peer.entry(peer).or_default() += count as u64;
            warn!(peer, count, "Invalid events in batch");
        }
    }

    /// Actions to perform at startup: announce the initial state and arm
    /// the appropriate timer.
    pub fn init(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::NotifyStateChanged { state: self.state }];
        match self.state {
            NodeState::Babbling => actions.push(self.arm_heartbeat()),
            NodeState::Joining => actions.extend(self.send_join_request()),
            NodeState::Suspended => {
                info!("Starting in maintenance mode");
            }
            _ => {}
        }
        actions
    }

    fn now_ms(&self) -> i64 {
        self.now.as_millis() as i64
    }

    fn arm_heartbeat(&mut self) -> Action {
        let duration = if self.core.is_busy() {
            self.config.heartbeat
        } else {
            self.config.slow_heartbeat
        };
        Action::SetTimer {
            id: TimerId::Heartbeat,
            duration,
        }
    }

    fn transition(&mut self, state: NodeState) -> Vec<Action> {
        if self.state == state {
            return vec![];
        }
        info!(from = %self.state, to = %state, "State transition");
        self.state = state;
        vec![Action::NotifyStateChanged { state }]
    }

    fn my_id(&mut self) -> u32 {
        self.core.peer_id().unwrap_or(u32::MAX)
    }

    fn other_peers(&mut self) -> Result<PeerSet, HashgraphError> {
        self.core.current_peers()
    }

    /// Store failures that are not NotFound are fatal for the node: flush
    /// what we can and shut down.
    fn fatal_store(&mut self, err: &HashgraphError) -> Vec<Action> {
        error!(error = %err, "Fatal store error; shutting down");
        if let Err(e) = self.core.hashgraph_mut().store_mut().flush() {
            error!(error = %e, "Flush on shutdown failed");
        }
        let mut actions = self.transition(NodeState::Shutdown);
        actions.push(Action::CancelTimer {
            id: TimerId::Heartbeat,
        });
        actions.push(Action::CancelTimer { id: TimerId::Join });
        actions.push(Action::Shutdown);
        actions
    }

    fn is_fatal(err: &HashgraphError) -> bool {
        matches!(err, HashgraphError::Store(e) if !e.is_not_found())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Gossip
    // ═══════════════════════════════════════════════════════════════════════

    fn on_heartbeat(&mut self) -> Vec<Action> {
        let mut actions = self.expire_parked_joins();
        match self.state {
            NodeState::Babbling | NodeState::Leaving => {
                if self.sync_in_flight {
                    actions.push(self.arm_heartbeat());
                    return actions;
                }
                let peers = match self.other_peers() {
                    Ok(peers) => peers,
                    Err(e) if Self::is_fatal(&e) => return self.fatal_store(&e),
                    Err(e) => {
                        warn!(error = %e, "No peer set; idling");
                        actions.push(self.arm_heartbeat());
                        return actions;
                    }
                };
                let me = self.core.public_key_hex().to_string();
                match self.selector.next(&peers, &me) {
                    Some(peer) => {
                        self.sync_in_flight = true;
                        let known = self.core.known_events();
                        debug!(peer = %peer.moniker, "Starting pull sync");
                        actions.push(Action::SendSyncRequest { to: peer, known });
                    }
                    None => {
                        // Monologue: a single-validator deployment still
                        // records transactions and decides rounds.
                        actions.extend(self.monologue());
                        actions.push(self.arm_heartbeat());
                    }
                }
                actions
            }
            NodeState::CatchingUp => {
                if self.sync_in_flight {
                    actions.push(self.arm_heartbeat());
                    return actions;
                }
                let peers = match self.other_peers() {
                    Ok(peers) => peers,
                    Err(_) => {
                        actions.push(self.arm_heartbeat());
                        return actions;
                    }
                };
                let me = self.core.public_key_hex().to_string();
                if let Some(peer) = self.selector.next(&peers, &me) {
                    self.sync_in_flight = true;
                    info!(peer = %peer.moniker, "Requesting fast-forward");
                    actions.push(Action::SendFastForwardRequest { to: peer });
                }
                actions.push(self.arm_heartbeat());
                actions
            }
            // Suspended, Joining, Shutdown: no gossip.
            _ => actions,
        }
    }

    fn monologue(&mut self) -> Vec<Action> {
        if !self.core.mempool().is_busy() {
            return vec![];
        }
        let now_ms = self.now_ms();
        if let Err(e) = self.core.create_self_event(None, now_ms) {
            return self.after_insert_error(e);
        }
        self.pipeline_consensus()
    }

    /// Run consensus and queue any new blocks for commit.
    fn pipeline_consensus(&mut self) -> Vec<Action> {
        match self.core.run_consensus() {
            Ok(blocks) => {
                for block in blocks {
                    self.pending_commits.push_back(block);
                }
                self.dispatch_commit()
            }
            Err(e) if Self::is_fatal(&e) => self.fatal_store(&e),
            Err(e) => {
                warn!(error = %e, "Consensus pass failed");
                vec![]
            }
        }
    }

    fn dispatch_commit(&mut self) -> Vec<Action> {
        if self.commit_in_flight {
            return vec![];
        }
        match self.pending_commits.pop_front() {
            Some(block) => {
                self.commit_in_flight = true;
                vec![Action::CommitBlock { block }]
            }
            None => vec![],
        }
    }

    /// Track consecutive saturated sync responses. Past the threshold the
    /// counterparty is declared too far ahead for event replay.
    fn check_sync_saturation(&mut self, received: usize) -> Result<(), HashgraphError> {
        if received >= self.config.sync_limit {
            self.saturated_syncs += 1;
        } else {
            self.saturated_syncs = 0;
        }
        if self.config.enable_fast_sync && self.saturated_syncs >= SATURATED_SYNC_THRESHOLD {
            self.saturated_syncs = 0;
            return Err(HashgraphError::TooBehind {
                limit: self.config.sync_limit,
            });
        }
        Ok(())
    }

    fn after_insert_error(&mut self, err: HashgraphError) -> Vec<Action> {
        match err {
            HashgraphError::Suspended { undecided, limit } => {
                warn!(undecided, limit, "Suspend limit exceeded");
                let mut actions = self.transition(NodeState::Suspended);
                actions.push(Action::CancelTimer {
                    id: TimerId::Heartbeat,
                });
                actions
            }
            HashgraphError::TooBehind { limit } => {
                info!(limit, "Too far behind for event replay; switching to fast-sync");
                let mut actions = self.transition(NodeState::CatchingUp);
                actions.push(self.arm_heartbeat());
                actions
            }
            e if Self::is_fatal(&e) => self.fatal_store(&e),
            e => {
                warn!(error = %e, "Insertion failed");
                vec![]
            }
        }
    }

    fn on_sync_response(
        &mut self,
        peer: u32,
        events: Vec<Event>,
        known: KnownEvents,
    ) -> Vec<Action> {
        if self.state != NodeState::Babbling && self.state != NodeState::Leaving {
            self.sync_in_flight = false;
            return vec![];
        }
        if let Err(e) = self.check_sync_saturation(events.len()) {
            self.sync_in_flight = false;
            return self.after_insert_error(e);
        }

        let outcome = match self.core.insert_batch(events) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.sync_in_flight = false;
                let mut actions = self.after_insert_error(e);
                if matches!(self.state, NodeState::Babbling | NodeState::Leaving) {
                    actions.push(self.arm_heartbeat());
                }
                return actions;
            }
        };
        self.note_invalid(peer, outcome.invalid);

        // Record the exchange in a new self-event whose other-parent is
        // the last event we got from the counterparty.
        let now_ms = self.now_ms();
        if let Err(e) = self.core.create_self_event(outcome.last, now_ms) {
            self.sync_in_flight = false;
            let mut actions = self.after_insert_error(e);
            if matches!(self.state, NodeState::Babbling | NodeState::Leaving) {
                actions.push(self.arm_heartbeat());
            }
            return actions;
        }

        let mut actions = self.pipeline_consensus();

        // Push back what the counterparty lacks.
        let diff = match self.core.events_diff(&known, self.config.sync_limit) {
            Ok(diff) => diff,
            Err(e) if Self::is_fatal(&e) => return self.fatal_store(&e),
            Err(e) => {
                warn!(error = %e, "Diff computation failed");
                vec![]
            }
        };
        match self.peer_by_id(peer) {
            Some(to) => actions.push(Action::SendEagerSyncRequest { to, events: diff }),
            None => {
                self.sync_in_flight = false;
                actions.push(self.arm_heartbeat());
            }
        }
        actions
    }

    fn peer_by_id(&mut self, id: u32) -> Option<Peer> {
        self.core
            .hashgraph_mut()
            .store_mut()
            .repertoire()
            .values()
            .find(|p| p.id == id)
            .cloned()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Serving
    // ═══════════════════════════════════════════════════════════════════════

    fn serve_sync(&mut self, known: KnownEvents, token: RequestToken) -> Vec<Action> {
        if !matches!(self.state, NodeState::Babbling | NodeState::Leaving) {
            return vec![Action::Reply {
                token,
                response: Response::Unavailable(format!("node is {}", self.state)),
            }];
        }
        let events = match self.core.events_diff(&known, self.config.sync_limit) {
            Ok(events) => events,
            Err(e) if Self::is_fatal(&e) => return self.fatal_store(&e),
            Err(e) => {
                warn!(error = %e, "Failed to serve sync");
                return vec![Action::Reply {
                    token,
                    response: Response::Unavailable(e.to_string()),
                }];
            }
        };
        let response = Response::Sync(SyncResponse {
            from_id: self.my_id(),
            events,
            known: self.core.known_events(),
        });
        vec![Action::Reply { token, response }]
    }

    fn serve_eager_sync(&mut self, from: u32, events: Vec<Event>, token: RequestToken) -> Vec<Action> {
        if !matches!(self.state, NodeState::Babbling | NodeState::Leaving) {
            return vec![Action::Reply {
                token,
                response: Response::Unavailable(format!("node is {}", self.state)),
            }];
        }
        let (success, last) = match self.core.insert_batch(events) {
            Ok(outcome) => {
                self.note_invalid(from, outcome.invalid);
                (true, outcome.last)
            }
            Err(e) => {
                let actions = self.after_insert_error(e);
                let mut all = vec![Action::Reply {
                    token,
                    response: Response::EagerSync(EagerSyncResponse {
                        from_id: self.my_id(),
                        success: false,
                        known: self.core.known_events(),
                    }),
                }];
                all.extend(actions);
                return all;
            }
        };

        let now_ms = self.now_ms();
        if let Err(e) = self.core.create_self_event(last, now_ms) {
            let mut actions = self.after_insert_error(e);
            actions.push(Action::Reply {
                token,
                response: Response::EagerSync(EagerSyncResponse {
                    from_id: self.my_id(),
                    success: false,
                    known: self.core.known_events(),
                }),
            });
            return actions;
        }

        let mut actions = vec![Action::Reply {
            token,
            response: Response::EagerSync(EagerSyncResponse {
                from_id: self.my_id(),
                success,
                known: self.core.known_events(),
            }),
        }];
        actions.extend(self.pipeline_consensus());
        actions
    }

    fn serve_fast_forward(&mut self, token: RequestToken) -> Vec<Action> {
        if !self.config.enable_fast_sync {
            return vec![Action::Reply {
                token,
                response: Response::Unavailable("fast-sync disabled".into()),
            }];
        }
        let from_id = self.my_id();
        match self.core.hashgraph_mut().anchor_block() {
            Ok(Some((block, frame))) => vec![Action::ReplyFastForward {
                token,
                from_id,
                block,
                frame,
            }],
            Ok(None) => vec![Action::Reply {
                token,
                response: Response::Unavailable("no anchor block".into()),
            }],
            Err(e) if Self::is_fatal(&e) => self.fatal_store(&e),
            Err(e) => vec![Action::Reply {
                token,
                response: Response::Unavailable(e.to_string()),
            }],
        }
    }

    fn serve_join(&mut self, peer: Peer, token: RequestToken) -> Vec<Action> {
        let current = match self.core.current_peers() {
            Ok(peers) => peers,
            Err(e) => {
                return vec![Action::Reply {
                    token,
                    response: Response::Unavailable(e.to_string()),
                }]
            }
        };
        if current.contains(&peer.pub_key_hex) {
            let accepted_round = self
                .core
                .hashgraph_mut()
                .store_mut()
                .peer_set_activation_rounds()
                .last()
                .copied()
                .unwrap_or(0);
            return vec![Action::Reply {
                token,
                response: Response::Join(JoinResponse {
                    from_id: self.my_id(),
                    accepted: true,
                    accepted_round,
                    peers: current.to_vec(),
                }),
            }];
        }
        if peer.public_key().is_err() {
            return vec![Action::Reply {
                token,
                response: Response::Join(JoinResponse {
                    from_id: self.my_id(),
                    accepted: false,
                    accepted_round: 0,
                    peers: current.to_vec(),
                }),
            }];
        }
        info!(moniker = %peer.moniker, "Join request queued");
        self.core
            .mempool()
            .add_internal_transaction(InternalTransaction::add(peer.clone()));
        self.parked_joins.push(ParkedJoin {
            token,
            peer,
            deadline: self.now + self.config.join_timeout,
        });
        vec![]
    }

    fn expire_parked_joins(&mut self) -> Vec<Action> {
        let now = self.now;
        let mut actions = Vec::new();
        let my_id = self.my_id();
        self.parked_joins.retain(|parked| {
            if parked.deadline > now {
                return true;
            }
            warn!(moniker = %parked.peer.moniker, "Join request timed out");
            actions.push(Action::Reply {
                token: parked.token,
                response: Response::Join(JoinResponse {
                    from_id: my_id,
                    accepted: false,
                    accepted_round: 0,
                    peers: vec![],
                }),
            });
            false
        });
        actions
    }

    /// Answer parked joins decided by this block's receipts. `activated`
    /// is the post-change peer set when the block produced one; joiners
    /// receive it so the set they install includes themselves.
    fn resolve_parked_joins(
        &mut self,
        receipts: &[InternalTransactionReceipt],
        activated: Option<&(u64, PeerSet)>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let my_id = self.my_id();
        let (accepted_round, current) = match activated {
            Some((round, peers)) => (*round, peers.to_vec()),
            None => (
                0,
                self.core
                    .current_peers()
                    .map(|p| p.to_vec())
                    .unwrap_or_default(),
            ),
        };
        for receipt in receipts {
            if receipt.tx.kind != InternalTransactionKind::PeerAdd {
                continue;
            }
            let key = &receipt.tx.peer.pub_key_hex;
            self.parked_joins.retain(|parked| {
                if &parked.peer.pub_key_hex != key {
                    return true;
                }
                info!(moniker = %parked.peer.moniker, accepted = receipt.accepted, "Join decided");
                actions.push(Action::Reply {
                    token: parked.token,
                    response: Response::Join(JoinResponse {
                        from_id: my_id,
                        accepted: receipt.accepted,
                        accepted_round,
                        peers: current.clone(),
                    }),
                });
                false
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Joining and fast-sync
    // ═══════════════════════════════════════════════════════════════════════

    fn send_join_request(&mut self) -> Vec<Action> {
        let peers = match self.core.current_peers() {
            Ok(peers) => peers,
            Err(_) => {
                // Nothing bootstrapped; retry on the join timer.
                return vec![Action::SetTimer {
                    id: TimerId::Join,
                    duration: self.config.join_timeout,
                }];
            }
        };
        let me = self.core.public_key_hex().to_string();
        let mut actions = Vec::new();
        if let Some(peer) = self.selector.next(&peers, &me) {
            info!(peer = %peer.moniker, "Sending join request");
            actions.push(Action::SendJoinRequest {
                to: peer,
                peer: self.local_peer.clone(),
            });
        }
        actions.push(Action::SetTimer {
            id: TimerId::Join,
            duration: self.config.join_timeout,
        });
        actions
    }

    fn on_join_response(
        &mut self,
        accepted: bool,
        accepted_round: u64,
        peers: Vec<Peer>,
    ) -> Vec<Action> {
        if self.state != NodeState::Joining {
            return vec![];
        }
        if !accepted {
            warn!("Join rejected; retrying on the join timer");
            return vec![];
        }
        // Install the membership we were accepted into at its activation
        // round. History before that round arrives via fast-forward.
        let set = PeerSet::from_existing(peers);
        if let Err(e) = self
            .core
            .hashgraph_mut()
            .store_mut()
            .set_peer_set(accepted_round, &set)
        {
            return self.fatal_store(&HashgraphError::Store(e));
        }
        if let Err(e) = self.core.refresh_head() {
            warn!(error = %e, "Failed to refresh head after join");
        }

        let mut actions = vec![Action::CancelTimer { id: TimerId::Join }];
        if self.config.enable_fast_sync {
            actions.extend(self.transition(NodeState::CatchingUp));
        } else {
            actions.extend(self.transition(NodeState::Babbling));
        }
        actions.push(self.arm_heartbeat());
        actions
    }

    fn on_fast_forward_response(
        &mut self,
        block: Block,
        frame: Frame,
        snapshot: Vec<u8>,
    ) -> Vec<Action> {
        self.sync_in_flight = false;
        if self.state != NodeState::CatchingUp {
            return vec![];
        }

        // The certificate and frame digest authenticate the payload.
        let frame_hash = match frame.hash() {
            Ok(hash) => hash,
            Err(e) => {
                warn!(error = %e, "Unhashable fast-forward frame");
                return vec![];
            }
        };
        if frame_hash != block.body.frame_hash {
            warn!("Fast-forward frame does not match block; discarding");
            return vec![];
        }
        match block.verify_certificate(&frame.peers) {
            Ok(true) => {}
            Ok(false) => {
                warn!(block = block.index(), "Fast-forward certificate incomplete");
                return vec![];
            }
            Err(e) => {
                warn!(error = %e, "Fast-forward certificate verification failed");
                return vec![];
            }
        }

        let block_index = block.index();
        if let Err(e) = self.core.hashgraph_mut().reset_from_frame(&block, &frame) {
            if Self::is_fatal(&e) {
                return self.fatal_store(&e);
            }
            warn!(error = %e, "Fast-forward reset failed");
            return vec![];
        }
        if let Err(e) = self.core.refresh_head() {
            warn!(error = %e, "Failed to refresh head after reset");
        }
        info!(block = block_index, round = frame.round, "Fast-forward installed");
        vec![Action::RestoreSnapshot {
            block_index,
            snapshot,
        }]
    }

    fn on_snapshot_restored(&mut self, block_index: u64) -> Vec<Action> {
        if self.state != NodeState::CatchingUp {
            return vec![];
        }
        info!(block = block_index, "Application restored; resuming gossip");
        let mut actions = self.transition(NodeState::Babbling);
        actions.push(self.arm_heartbeat());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commit pipeline
    // ═══════════════════════════════════════════════════════════════════════

    fn on_commit_response(
        &mut self,
        block_index: u64,
        state_hash: Vec<u8>,
        receipts: Vec<InternalTransactionReceipt>,
    ) -> Vec<Action> {
        self.commit_in_flight = false;

        let block = match self
            .core
            .finalize_and_sign_block(block_index, state_hash, receipts.clone())
        {
            Ok((block, _)) => block,
            Err(e) if Self::is_fatal(&e) => return self.fatal_store(&e),
            Err(e) => {
                warn!(error = %e, block = block_index, "Failed to finalize block");
                return self.dispatch_commit();
            }
        };

        let mut actions = Vec::new();
        let activated = match self
            .core
            .hashgraph_mut()
            .apply_internal_transactions(block.round_received(), &receipts)
        {
            Ok(Some((round, peers))) => {
                info!(round, peers = peers.len(), "Membership change scheduled");
                Some((round, peers))
            }
            Ok(None) => None,
            Err(e) if Self::is_fatal(&e) => return self.fatal_store(&e),
            Err(e) => {
                warn!(error = %e, "Failed to apply internal transactions");
                None
            }
        };
        actions.extend(self.resolve_parked_joins(&receipts, activated.as_ref()));

        // A committed self-removal completes the Leaving state.
        if self.state == NodeState::Leaving {
            let me = self.core.public_key_hex().to_string();
            let removed = receipts.iter().any(|r| {
                r.accepted
                    && r.tx.kind == InternalTransactionKind::PeerRemove
                    && r.tx.peer.pub_key_hex == me
            });
            if removed {
                info!("Removal committed; shutting down");
                actions.extend(self.transition(NodeState::Shutdown));
                actions.push(Action::CancelTimer {
                    id: TimerId::Heartbeat,
                });
                actions.push(Action::Shutdown);
                return actions;
            }
        }

        actions.extend(self.dispatch_commit());
        actions
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: NodeEvent) -> Vec<Action> {
        if self.state == NodeState::Shutdown {
            return vec![];
        }
        match event {
            NodeEvent::HeartbeatTimer => self.on_heartbeat(),

            NodeEvent::JoinTimer => {
                if self.state == NodeState::Joining {
                    self.send_join_request()
                } else {
                    vec![]
                }
            }

            NodeEvent::SyncRequestReceived { known, token, .. } => self.serve_sync(known, token),

            NodeEvent::EagerSyncRequestReceived { from, events, token } => {
                self.serve_eager_sync(from, events, token)
            }

            NodeEvent::FastForwardRequestReceived { token, .. } => self.serve_fast_forward(token),

            NodeEvent::JoinRequestReceived { peer, token } => self.serve_join(peer, token),

            NodeEvent::SyncResponseReceived {
                peer,
                events,
                known,
            } => self.on_sync_response(peer, events, known),

            NodeEvent::EagerSyncResponseReceived { peer, success } => {
                if !success {
                    debug!(peer, "Eager sync rejected by counterparty");
                }
                self.sync_in_flight = false;
                vec![self.arm_heartbeat()]
            }

            NodeEvent::FastForwardResponseReceived {
                block,
                frame,
                snapshot,
                ..
            } => self.on_fast_forward_response(block, frame, snapshot),

            NodeEvent::JoinResponseReceived {
                accepted,
                accepted_round,
                peers,
            } => self.on_join_response(accepted, accepted_round, peers),

            NodeEvent::SyncFailed { peer } => {
                debug!(peer, "Sync attempt abandoned");
                self.sync_in_flight = false;
                if matches!(
                    self.state,
                    NodeState::Babbling | NodeState::Leaving | NodeState::CatchingUp
                ) {
                    vec![self.arm_heartbeat()]
                } else {
                    vec![]
                }
            }

            NodeEvent::TransactionSubmitted { tx } => {
                match self.state {
                    NodeState::Babbling | NodeState::Leaving => {
                        self.core.mempool().add_transaction(tx);
                    }
                    state => {
                        warn!(%state, "Dropping transaction; node not accepting");
                    }
                }
                vec![]
            }

            NodeEvent::InternalTransactionSubmitted { tx } => {
                self.core.mempool().add_internal_transaction(tx);
                vec![]
            }

            NodeEvent::CommitResponseReceived {
                block_index,
                state_hash,
                receipts,
            } => self.on_commit_response(block_index, state_hash, receipts),

            NodeEvent::SnapshotRestored { block_index } => self.on_snapshot_restored(block_index),

            NodeEvent::ResumeRequested => {
                if self.state != NodeState::Suspended {
                    return vec![];
                }
                self.core.hashgraph_mut().resume();
                let mut actions = self.transition(NodeState::Babbling);
                actions.push(self.arm_heartbeat());
                actions
            }

            NodeEvent::LeaveRequested => {
                if self.state != NodeState::Babbling {
                    return vec![];
                }
                info!("Leaving: submitting our own removal");
                let me = self.local_peer.clone();
                self.core
                    .mempool()
                    .add_internal_transaction(InternalTransaction::remove(me));
                self.transition(NodeState::Leaving)
            }

            NodeEvent::ShutdownRequested => {
                let mut actions = self.transition(NodeState::Shutdown);
                if let Err(e) = self.core.hashgraph_mut().store_mut().flush() {
                    error!(error = %e, "Flush on shutdown failed");
                }
                actions.push(Action::CancelTimer {
                    id: TimerId::Heartbeat,
                });
                actions.push(Action::CancelTimer { id: TimerId::Join });
                actions.push(Action::Shutdown);
                actions
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_hashgraph::{Hashgraph, HashgraphConfig};
    use filament_store::InmemStore;
    use filament_types::test_utils::{test_keypair, test_peer, test_peer_set};

    fn make_sm(maintenance: bool) -> NodeStateMachine {
        let (peers, keys) = test_peer_set(3);
        let store = InmemStore::with_genesis_peers(1000, &peers).unwrap();
        let hg = Hashgraph::new(Box::new(store), HashgraphConfig::default());
        let core = Core::new(keys[0].clone(), hg).unwrap();
        let config = NodeConfig {
            maintenance_mode: maintenance,
            ..Default::default()
        }
        .normalized();
        NodeStateMachine::new(config, core, test_peer(0))
    }

    #[test]
    fn starts_babbling_with_heartbeat() {
        let mut sm = make_sm(false);
        assert_eq!(sm.state(), NodeState::Babbling);
        let actions = sm.init();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { id: TimerId::Heartbeat, .. })));
    }

    #[test]
    fn maintenance_mode_starts_suspended_and_silent() {
        let mut sm = make_sm(true);
        assert_eq!(sm.state(), NodeState::Suspended);
        let actions = sm.init();
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::SendSyncRequest { .. })));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { .. })));

        // Heartbeats (should any arrive) provoke no outbound sync.
        for _ in 0..10 {
            let actions = sm.handle(NodeEvent::HeartbeatTimer);
            assert!(!actions
                .iter()
                .any(|a| matches!(a, Action::SendSyncRequest { .. })));
        }
    }

    #[test]
    fn resume_leaves_suspended() {
        let mut sm = make_sm(true);
        let actions = sm.handle(NodeEvent::ResumeRequested);
        assert_eq!(sm.state(), NodeState::Babbling);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { id: TimerId::Heartbeat, .. })));
    }

    #[test]
    fn heartbeat_starts_one_sync_at_a_time() {
        let mut sm = make_sm(false);
        sm.set_time(Duration::from_secs(1));
        let actions = sm.handle(NodeEvent::HeartbeatTimer);
        let syncs = actions
            .iter()
            .filter(|a| matches!(a, Action::SendSyncRequest { .. }))
            .count();
        assert_eq!(syncs, 1);

        // While in flight, further heartbeats only re-arm the timer.
        let actions = sm.handle(NodeEvent::HeartbeatTimer);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::SendSyncRequest { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { id: TimerId::Heartbeat, .. })));
    }

    #[test]
    fn non_member_starts_joining() {
        let (peers, _) = test_peer_set(3);
        let outsider = test_keypair(9);
        let store = InmemStore::with_genesis_peers(1000, &peers).unwrap();
        let hg = Hashgraph::new(Box::new(store), HashgraphConfig::default());
        let core = Core::new(outsider, hg).unwrap();
        let mut sm = NodeStateMachine::new(NodeConfig::default(), core, test_peer(9));
        assert_eq!(sm.state(), NodeState::Joining);

        let actions = sm.init();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SendJoinRequest { .. })));
    }

    #[test]
    fn saturated_syncs_raise_too_behind_and_fast_sync() {
        let (peers, keys) = test_peer_set(3);
        let store = InmemStore::with_genesis_peers(1000, &peers).unwrap();
        let hg = Hashgraph::new(Box::new(store), HashgraphConfig::default());
        let core = Core::new(keys[0].clone(), hg).unwrap();
        // sync_limit of zero makes every response saturated.
        let config = NodeConfig {
            enable_fast_sync: true,
            sync_limit: 0,
            ..Default::default()
        };
        let mut sm = NodeStateMachine::new(config, core, test_peer(0));

        for _ in 0..2 {
            sm.handle(NodeEvent::SyncResponseReceived {
                peer: 1,
                events: vec![],
                known: KnownEvents::new(),
            });
            assert_eq!(sm.state(), NodeState::Babbling);
        }
        let actions = sm.handle(NodeEvent::SyncResponseReceived {
            peer: 1,
            events: vec![],
            known: KnownEvents::new(),
        });
        assert_eq!(sm.state(), NodeState::CatchingUp);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::NotifyStateChanged {
                state: NodeState::CatchingUp
            }
        )));
    }

    #[test]
    fn shutdown_is_terminal() {
        let mut sm = make_sm(false);
        let actions = sm.handle(NodeEvent::ShutdownRequested);
        assert_eq!(sm.state(), NodeState::Shutdown);
        assert!(actions.iter().any(|a| matches!(a, Action::Shutdown)));
        assert!(sm.handle(NodeEvent::HeartbeatTimer).is_empty());
    }

    #[test]
    fn serving_while_suspended_is_unavailable() {
        let mut sm = make_sm(true);
        let actions = sm.handle(NodeEvent::SyncRequestReceived {
            from: 1,
            known: KnownEvents::new(),
            token: RequestToken(7),
        });
        match &actions[..] {
            [Action::Reply { token, response }] => {
                assert_eq!(*token, RequestToken(7));
                assert!(matches!(response, Response::Unavailable(_)));
            }
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[test]
    fn leave_submits_removal_and_transitions() {
        let mut sm = make_sm(false);
        let actions = sm.handle(NodeEvent::LeaveRequested);
        assert_eq!(sm.state(), NodeState::Leaving);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::NotifyStateChanged { state: NodeState::Leaving })));
        assert!(sm.core_mut().mempool().is_busy());
    }
}
