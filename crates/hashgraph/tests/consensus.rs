//! Multi-node consensus scenarios driven through in-memory gossip.
//!
//! Each test node owns a full engine over an in-memory store; a
//! deterministic round-robin of pairwise syncs reproduces the gossip
//! protocol without any networking.

use filament_hashgraph::{Hashgraph, HashgraphConfig, HashgraphError};
use filament_store::{InmemStore, Store};
use filament_types::test_utils::{test_keypair, test_peer, test_peer_set};
use filament_types::{
    Event, Hash, InternalTransaction, KeyPair, PeerSet,
};

struct TestNode {
    key: KeyPair,
    hg: Hashgraph,
    head: Hash,
    seq: i64,
}

impl TestNode {
    fn new(key: KeyPair, peers: &PeerSet, config: HashgraphConfig) -> Self {
        let store = InmemStore::with_genesis_peers(1000, peers).unwrap();
        let head = Event::root_self_parent(&key.public_key());
        TestNode {
            key,
            hg: Hashgraph::new(Box::new(store), config),
            head,
            seq: -1,
        }
    }

    /// Create, sign and insert a self-event.
    fn create_event(
        &mut self,
        other_parent: Option<Hash>,
        txs: Vec<Vec<u8>>,
        itxs: Vec<InternalTransaction>,
        now: i64,
    ) -> Hash {
        let mut event = Event::new(
            txs,
            itxs,
            vec![],
            self.head,
            other_parent,
            self.key.public_key(),
            self.seq + 1,
            now,
        );
        event.sign(&self.key).unwrap();
        let hash = self.hg.insert_event(event).unwrap();
        self.head = hash;
        self.seq += 1;
        hash
    }
}

struct Cluster {
    nodes: Vec<TestNode>,
    clock: i64,
}

impl Cluster {
    fn new(n: u8) -> Self {
        Self::with_config(n, HashgraphConfig::default())
    }

    fn with_config(n: u8, config: HashgraphConfig) -> Self {
        let (peers, keys) = test_peer_set(n);
        let mut cluster = Cluster {
            nodes: keys
                .into_iter()
                .map(|key| TestNode::new(key, &peers, config.clone()))
                .collect(),
            clock: 1_700_000_000_000,
        };
        // Everyone publishes an initial event.
        for i in 0..cluster.nodes.len() {
            let now = cluster.tick();
            cluster.nodes[i].create_event(None, vec![], vec![], now);
        }
        cluster
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    /// One pull-sync: `to` pulls from `from`, inserts the diff, then
    /// creates an event whose other-parent is `from`'s head.
    fn sync(&mut self, from: usize, to: usize, txs: Vec<Vec<u8>>) {
        let known = self.nodes[to].hg.known_events();
        let diff = self.nodes[from].hg.events_diff(&known, 1000).unwrap();
        for event in diff {
            match self.nodes[to].hg.insert_event(event) {
                Ok(_) => {}
                Err(e) if e.is_skippable() => {}
                Err(e) => panic!("insert during sync: {e}"),
            }
        }
        let other_parent = self.nodes[from].head;
        let now = self.tick();
        self.nodes[to].create_event(Some(other_parent), txs, vec![], now);
        self.nodes[to].hg.run_consensus().unwrap();
    }

    /// Round-robin gossip for `steps` exchanges.
    fn gossip(&mut self, steps: usize) {
        let n = self.nodes.len();
        for step in 0..steps {
            let from = step % n;
            let to = (step + 1) % n;
            self.sync(from, to, vec![]);
        }
    }
}

#[test]
fn three_nodes_reach_identical_decided_rounds() {
    let mut cluster = Cluster::new(3);
    cluster.gossip(40);

    let decided: Vec<Option<u64>> = cluster
        .nodes
        .iter()
        .map(|n| n.hg.store().last_consensus_round())
        .collect();
    let min_decided = decided
        .iter()
        .map(|d| d.expect("every node decided at least one round"))
        .min()
        .unwrap();
    assert!(min_decided >= 2, "expected decided round >= 2, got {decided:?}");

    // Frames for every commonly decided round are byte-identical.
    for round in 0..=min_decided {
        let mut encodings = Vec::new();
        for node in &mut cluster.nodes {
            let frame = node.hg.store_mut().get_frame(round).unwrap();
            encodings.push(bincode::serialize(&frame).unwrap());
        }
        assert!(
            encodings.windows(2).all(|w| w[0] == w[1]),
            "frame {round} differs between nodes"
        );
    }
}

#[test]
fn submitted_transactions_land_in_one_block_in_order() {
    let mut cluster = Cluster::new(3);

    // Node 0 attaches three transactions to its next event.
    cluster.sync(1, 0, vec![b"abc".to_vec(), b"def".to_vec(), b"ghi".to_vec()]);
    cluster.gossip(40);

    let mut block0 = Vec::new();
    for node in &mut cluster.nodes {
        let block = node.hg.store_mut().get_block(0).unwrap();
        assert_eq!(
            block.body.transactions,
            vec![b"abc".to_vec(), b"def".to_vec(), b"ghi".to_vec()]
        );
        block0.push(bincode::serialize(&block).unwrap());
    }
    assert!(block0.windows(2).all(|w| w[0] == w[1]));

    // The three transactions appear in exactly one block.
    for node in &mut cluster.nodes {
        let last = node.hg.store().last_block_index().unwrap();
        for index in 1..=last {
            let block = node.hg.store_mut().get_block(index).unwrap();
            assert!(
                !block.body.transactions.contains(&b"abc".to_vec()),
                "transaction duplicated in block {index}"
            );
        }
    }
}

#[test]
fn duplicate_insert_is_rejected_and_harmless() {
    let mut cluster = Cluster::new(3);
    cluster.gossip(6);

    let head = cluster.nodes[1].head;
    let event = cluster.nodes[1].hg.store_mut().get_event(&head).unwrap();
    let before = cluster.nodes[1].hg.stats().events;

    match cluster.nodes[1].hg.insert_event(event) {
        Err(HashgraphError::DuplicateEvent(h)) => assert_eq!(h, head),
        other => panic!("expected DuplicateEvent, got {other:?}"),
    }
    assert_eq!(cluster.nodes[1].hg.stats().events, before);
}

#[test]
fn rounds_are_monotone_along_parent_edges() {
    let mut cluster = Cluster::new(3);
    cluster.gossip(30);

    let node = &mut cluster.nodes[0];
    let repertoire = node.hg.store_mut().repertoire();
    for creator in repertoire.keys() {
        let hashes = node.hg.store_mut().participant_events(creator, -1).unwrap();
        for hash in hashes {
            let meta = node.hg.meta(&hash).expect("meta for stored event").clone();
            if let Some(sp) = meta.self_parent {
                let sp_meta = node.hg.meta(&sp).unwrap();
                assert!(meta.round >= sp_meta.round);
            }
            if let Some(op) = meta.other_parent {
                let op_meta = node.hg.meta(&op).unwrap();
                assert!(meta.round >= op_meta.round);
            }
        }
    }
}

#[test]
fn equivocation_is_stored_flagged_and_survivable() {
    let mut cluster = Cluster::new(4);
    cluster.gossip(8);

    // Creator 3 forges a fork: two different events at the same index,
    // built on top of whatever honest node 0 already knows of its chain.
    let byzantine = test_keypair(3);
    let creator = byzantine.public_key();
    let creator_hex = creator.to_hex();
    let head = cluster.nodes[0]
        .hg
        .store_mut()
        .last_event_from(&creator_hex)
        .unwrap()
        .expect("node 0 has seen creator 3");
    let seq = cluster.nodes[0]
        .hg
        .store_mut()
        .get_event(&head)
        .unwrap()
        .body
        .index;

    let mut fork_a = Event::new(
        vec![b"fork-a".to_vec()],
        vec![],
        vec![],
        head,
        None,
        creator,
        seq + 1,
        9_000_000,
    );
    fork_a.sign(&byzantine).unwrap();
    let mut fork_b = Event::new(
        vec![b"fork-b".to_vec()],
        vec![],
        vec![],
        head,
        None,
        creator,
        seq + 1,
        9_000_001,
    );
    fork_b.sign(&byzantine).unwrap();

    // An honest node receives both; the second insertion reports the
    // equivocation but both events are stored.
    let node = &mut cluster.nodes[0];
    node.hg.insert_event(fork_a.clone()).unwrap();
    match node.hg.insert_event(fork_b.clone()) {
        Err(HashgraphError::EquivocationDetected { index, .. }) => {
            assert_eq!(index, seq + 1);
        }
        other => panic!("expected EquivocationDetected, got {other:?}"),
    }
    assert!(node.hg.store_mut().has_event(&fork_a.hash().unwrap()));
    assert!(node.hg.store_mut().has_event(&fork_b.hash().unwrap()));
    assert_eq!(node.hg.stats().forks, 1);

    // The remaining three creators form a supermajority of four; gossip
    // among them continues to decide rounds.
    let before = cluster.nodes[0]
        .hg
        .store()
        .last_consensus_round()
        .unwrap_or(0);
    for step in 0..30 {
        let from = step % 3;
        let to = (step + 1) % 3;
        cluster.sync(from, to, vec![]);
    }
    let after = cluster.nodes[0]
        .hg
        .store()
        .last_consensus_round()
        .unwrap_or(0);
    assert!(after > before, "consensus stalled after equivocation");
}

#[test]
fn membership_change_activates_after_lag() {
    let config = HashgraphConfig {
        activation_lag: 6,
        suspend_limit: 10_000,
    };
    let mut cluster = Cluster::with_config(3, config);

    // Node 0 proposes a new validator.
    let joiner = test_peer(9);
    let itx = InternalTransaction::add(joiner.clone());
    let now = cluster.tick();
    let from_head = cluster.nodes[1].head;
    {
        let known = cluster.nodes[0].hg.known_events();
        let diff = cluster.nodes[1].hg.events_diff(&known, 1000).unwrap();
        for event in diff {
            let _ = cluster.nodes[0].hg.insert_event(event);
        }
    }
    cluster.nodes[0].create_event(Some(from_head), vec![], vec![itx.clone()], now);
    cluster.gossip(40);

    let node = &mut cluster.nodes[0];
    let last_block = node.hg.store().last_block_index().expect("a block");
    let mut carrying = None;
    for index in 0..=last_block {
        let block = node.hg.store_mut().get_block(index).unwrap();
        if !block.body.internal_transactions.is_empty() {
            carrying = Some(block);
            break;
        }
    }
    let block = carrying.expect("internal transaction committed in a block");
    assert_eq!(block.body.internal_transactions[0], itx);

    // The application accepts it; the peer set activates after the lag.
    let receipts = vec![itx.as_accepted()];
    let activated = node
        .hg
        .apply_internal_transactions(block.round_received(), &receipts)
        .unwrap()
        .expect("peer set change");
    assert_eq!(activated.0, block.round_received() + 6);
    assert_eq!(activated.1.len(), 4);

    let at_activation = node.hg.peers_at_round(activated.0).unwrap();
    assert!(at_activation.contains(&joiner.pub_key_hex));
    let before_activation = node.hg.peers_at_round(activated.0 - 1).unwrap();
    assert!(!before_activation.contains(&joiner.pub_key_hex));

    // A block signature from the new member then counts toward the
    // supermajority of the activated set: 3 of 4, joiner included.
    let joiner_key = test_keypair(9);
    let mut frame = node
        .hg
        .store_mut()
        .get_frame(block.round_received())
        .unwrap();
    frame.round = activated.0;
    frame.peers = at_activation.clone();
    let mut future_block = filament_types::Block::from_frame(block.index() + 1, &frame).unwrap();
    for key in [&joiner_key, &test_keypair(0), &test_keypair(1)] {
        future_block.set_signature(future_block.sign(key).unwrap());
    }
    assert!(future_block.verify_certificate(&at_activation).unwrap());

    future_block.signatures.remove(&joiner.pub_key_hex);
    assert!(!future_block.verify_certificate(&at_activation).unwrap());
}

#[test]
fn suspend_limit_halts_insertion() {
    // A lone creator in a three-member set never reaches consensus, so its
    // undecided backlog grows until the engine suspends.
    let (peers3, keys) = test_peer_set(3);
    let store = InmemStore::with_genesis_peers(100, &peers3).unwrap();
    let mut hg = Hashgraph::new(
        Box::new(store),
        HashgraphConfig {
            activation_lag: 6,
            suspend_limit: 5,
        },
    );

    let key = &keys[0];
    let creator = key.public_key();
    let mut head = Event::root_self_parent(&creator);
    let mut suspended = false;
    for i in 0..50 {
        let mut event = Event::new(vec![], vec![], vec![], head, None, creator, i, 1000 + i);
        event.sign(key).unwrap();
        match hg.insert_event(event) {
            Ok(h) => head = h,
            Err(HashgraphError::Suspended { undecided, limit }) => {
                assert!(undecided > limit);
                suspended = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(suspended, "engine never suspended");
    assert!(hg.is_suspended());

    hg.resume();
    assert!(!hg.is_suspended());
}
