//! Node assembly: datadir → store → hashgraph → core → state machine.

use filament_hashgraph::{Hashgraph, HashgraphConfig, HashgraphError};
use filament_node::{Core, NodeConfig, NodeStateMachine};
use filament_store::{init_store, InmemStore, Store, StoreError};
use filament_types::{JsonPeerSet, KeyPair, Peer, PeerSet, PeersError};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Peers(#[from] PeersError),

    #[error(transparent)]
    Hashgraph(#[from] HashgraphError),
}

/// Assemble a node state machine from a datadir.
///
/// Persistent mode runs the database init semantics (backup-and-recreate
/// unless bootstrapping); a store without any peer set is seeded from
/// `peers.json`. Bootstrap mode then replays the stored DAG.
pub fn build_state_machine(
    config: NodeConfig,
    datadir: &Path,
    key: KeyPair,
    advertise_addr: &str,
) -> Result<NodeStateMachine, BuildError> {
    let config = config.normalized();

    let mut store: Box<dyn Store> = if config.store {
        Box::new(init_store(datadir, config.cache_size, config.bootstrap)?)
    } else {
        Box::new(InmemStore::new(config.cache_size))
    };

    if store.peer_set_activation_rounds().is_empty() {
        let peers_file = JsonPeerSet::new(datadir, false);
        if peers_file.exists() {
            let peers = peers_file.read()?;
            info!(peers = peers.len(), "Seeding genesis peer set");
            store.set_peer_set(0, &PeerSet::new(peers))?;
        }
    }

    let mut hashgraph = Hashgraph::new(
        store,
        HashgraphConfig {
            activation_lag: config.activation_lag,
            suspend_limit: config.suspend_limit,
        },
    );
    if config.bootstrap {
        hashgraph.bootstrap()?;
    }

    let local_peer = Peer::new(
        advertise_addr,
        key.public_key().to_hex(),
        config.moniker.clone(),
    );
    let core = Core::new(key, hashgraph)?;
    Ok(NodeStateMachine::new(config, core, local_peer))
}
