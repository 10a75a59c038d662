//! Frames: self-contained snapshots of a decided round.

use crate::crypto::PublicKey;
use crate::event::{Event, ROOT_INDEX};
use crate::hash::Hash;
use crate::peers::PeerSet;
use crate::TypesError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Synthetic predecessor for a creator: the point from which its self-parent
/// chain resumes after a bootstrap or fast-sync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Root {
    /// Hash the creator's next event must cite as self-parent.
    pub head: Hash,
    /// Index of the last pre-frame event (−1 if the creator has none).
    pub index: i64,
    /// Round of the last pre-frame event.
    pub round: u64,
    pub round_received: Option<u64>,
    pub timestamp: i64,
}

impl Root {
    /// A fresh root for a creator with no history.
    pub fn for_creator(creator: &PublicKey) -> Self {
        Root {
            head: Event::root_self_parent(creator),
            index: ROOT_INDEX,
            round: 0,
            round_received: None,
            timestamp: 0,
        }
    }
}

/// An event together with its consensus position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub core: Event,
    pub round: u64,
    pub round_received: u64,
    pub consensus_timestamp: i64,
}

/// All events whose round-received equals `round`, in consensus order, plus
/// one root per peer without a regular event in the frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub round: u64,
    pub peers: PeerSet,
    /// Keyed by creator public key (hex); BTreeMap keeps the encoding
    /// canonical.
    pub roots: BTreeMap<String, Root>,
    pub events: Vec<FrameEvent>,
    pub timestamp: i64,
}

impl Frame {
    /// Canonical digest, recorded in the corresponding block as state anchor.
    pub fn hash(&self) -> Result<Hash, TypesError> {
        Ok(Hash::digest(&bincode::serialize(self)?))
    }

    /// Flatten transactions of all frame events in consensus order.
    pub fn transactions(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .flat_map(|fe| fe.core.body.transactions.iter().cloned())
            .collect()
    }

    /// Flatten internal transactions in consensus order.
    pub fn internal_transactions(&self) -> Vec<crate::event::InternalTransaction> {
        self.events
            .iter()
            .flat_map(|fe| fe.core.body.internal_transactions.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_keypair, test_peer_set};

    #[test]
    fn frame_hash_is_content_addressed() {
        let (peers, keys) = test_peer_set(3);
        let key = &keys[0];
        let creator = key.public_key();

        let mut event = Event::new(
            vec![b"tx".to_vec()],
            vec![],
            vec![],
            Event::root_self_parent(&creator),
            None,
            creator,
            0,
            42,
        );
        event.sign(key).unwrap();

        let mut roots = BTreeMap::new();
        for p in peers.iter().skip(1) {
            let pk = test_keypair(9).public_key();
            let mut root = Root::for_creator(&pk);
            root.head = Event::root_self_parent(&pk);
            roots.insert(p.pub_key_hex.clone(), root);
        }

        let frame = Frame {
            round: 1,
            peers: peers.clone(),
            roots,
            events: vec![FrameEvent {
                core: event,
                round: 1,
                round_received: 1,
                consensus_timestamp: 42,
            }],
            timestamp: 42,
        };

        let a = frame.hash().unwrap();
        let b = frame.clone().hash().unwrap();
        assert_eq!(a, b);

        let mut other = frame;
        other.timestamp = 43;
        assert_ne!(a, other.hash().unwrap());
    }
}
