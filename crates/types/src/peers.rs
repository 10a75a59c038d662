//! Validators and the ordered peer set.
//!
//! A `PeerSet` is an immutable snapshot of the membership; every change
//! produces a new set. Ids are assigned monotonically as peers join, so two
//! nodes that apply the same membership operations in the same order agree
//! on every id.

use crate::crypto::{CryptoError, PublicKey};
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default bootstrap peer-set file.
pub const PEERS_FILE: &str = "peers.json";
/// Genesis peer-set file, kept alongside the current one.
pub const GENESIS_PEERS_FILE: &str = "peers.genesis.json";

#[derive(Debug, Error)]
pub enum PeersError {
    #[error("peer {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peers file error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A validator: public key identity, gossip address, friendly name, and the
/// id assigned by the peer set it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub net_addr: String,
    pub pub_key_hex: String,
    pub moniker: String,
    pub id: u32,
}

impl Peer {
    /// A peer with no id yet; the id is assigned when it enters a `PeerSet`.
    pub fn new(
        net_addr: impl Into<String>,
        pub_key_hex: impl Into<String>,
        moniker: impl Into<String>,
    ) -> Self {
        Peer {
            net_addr: net_addr.into(),
            pub_key_hex: pub_key_hex.into(),
            moniker: moniker.into(),
            id: 0,
        }
    }

    /// Decode the public key identity.
    pub fn public_key(&self) -> Result<PublicKey, PeersError> {
        Ok(PublicKey::from_hex(&self.pub_key_hex)?)
    }
}

/// Ordered, immutable set of validators active from some round onwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Peer>", into = "Vec<Peer>")]
pub struct PeerSet {
    peers: Vec<Peer>,
    by_pubkey: HashMap<String, usize>,
    by_id: HashMap<u32, usize>,
}

impl PeerSet {
    /// Build a set from peers without ids, assigning 0..n in order.
    pub fn new(peers: Vec<Peer>) -> Self {
        let peers = peers
            .into_iter()
            .enumerate()
            .map(|(i, mut p)| {
                p.id = i as u32;
                p
            })
            .collect();
        Self::from_existing(peers)
    }

    /// Rebuild a set from peers that already carry ids.
    pub fn from_existing(mut peers: Vec<Peer>) -> Self {
        peers.sort_by_key(|p| p.id);
        let mut set = PeerSet {
            peers,
            by_pubkey: HashMap::new(),
            by_id: HashMap::new(),
        };
        set.reindex();
        set
    }

    fn reindex(&mut self) {
        self.by_pubkey.clear();
        self.by_id.clear();
        for (i, p) in self.peers.iter().enumerate() {
            self.by_pubkey.insert(p.pub_key_hex.clone(), i);
            self.by_id.insert(p.id, i);
        }
    }

    /// Next id a joining peer would receive.
    pub fn next_id(&self) -> u32 {
        self.peers.iter().map(|p| p.id + 1).max().unwrap_or(0)
    }

    /// A new set with `peer` appended under the next id.
    pub fn with_new_peer(&self, mut peer: Peer) -> PeerSet {
        peer.id = self.next_id();
        let mut peers = self.peers.clone();
        peers.push(peer);
        PeerSet::from_existing(peers)
    }

    /// A new set without the peer identified by `pub_key_hex`. Remaining ids
    /// are unchanged.
    pub fn with_removed_peer(&self, pub_key_hex: &str) -> PeerSet {
        let peers = self
            .peers
            .iter()
            .filter(|p| p.pub_key_hex != pub_key_hex)
            .cloned()
            .collect();
        PeerSet::from_existing(peers)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Peers in id order, owned.
    pub fn to_vec(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    pub fn get_by_pubkey(&self, pub_key_hex: &str) -> Option<&Peer> {
        self.by_pubkey.get(pub_key_hex).map(|&i| &self.peers[i])
    }

    pub fn get_by_id(&self, id: u32) -> Option<&Peer> {
        self.by_id.get(&id).map(|&i| &self.peers[i])
    }

    pub fn contains(&self, pub_key_hex: &str) -> bool {
        self.by_pubkey.contains_key(pub_key_hex)
    }

    /// ⌊2N/3⌋ + 1 — the quorum for fame votes and block certificates.
    pub fn super_majority(&self) -> usize {
        2 * self.peers.len() / 3 + 1
    }

    /// Whether the distinct member keys in `signers` meet the supermajority.
    pub fn has_super_majority<'a>(&self, signers: impl Iterator<Item = &'a str>) -> bool {
        let mut seen = std::collections::HashSet::new();
        for key in signers {
            if self.contains(key) {
                seen.insert(key);
            }
        }
        seen.len() >= self.super_majority()
    }

    /// Canonical digest of the membership, stored in block bodies.
    pub fn hash(&self) -> Result<Hash, bincode::Error> {
        Ok(Hash::digest(&bincode::serialize(&self.peers)?))
    }
}

impl From<Vec<Peer>> for PeerSet {
    fn from(peers: Vec<Peer>) -> Self {
        PeerSet::from_existing(peers)
    }
}

impl From<PeerSet> for Vec<Peer> {
    fn from(set: PeerSet) -> Self {
        set.peers
    }
}

/// On-disk record in `peers.json` / `peers.genesis.json`. Field names are
/// fixed; identical content serializes to identical bytes on every node.
#[derive(Serialize, Deserialize)]
struct PeerRecord {
    #[serde(rename = "NetAddr")]
    net_addr: String,
    #[serde(rename = "PubKeyHex")]
    pub_key_hex: String,
    #[serde(rename = "Moniker")]
    moniker: String,
}

/// Reader/writer for the JSON bootstrap peer-set files.
pub struct JsonPeerSet {
    path: PathBuf,
}

impl JsonPeerSet {
    /// `genesis` selects `peers.genesis.json` over `peers.json`.
    pub fn new(dir: impl AsRef<Path>, genesis: bool) -> Self {
        let file = if genesis { GENESIS_PEERS_FILE } else { PEERS_FILE };
        JsonPeerSet {
            path: dir.as_ref().join(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read peers in file order. Ids are assigned by position.
    pub fn read(&self) -> Result<Vec<Peer>, PeersError> {
        let data = fs::read(&self.path)?;
        let records: Vec<PeerRecord> = serde_json::from_slice(&data)?;
        Ok(records
            .into_iter()
            .enumerate()
            .map(|(i, r)| Peer {
                net_addr: r.net_addr,
                pub_key_hex: r.pub_key_hex,
                moniker: r.moniker,
                id: i as u32,
            })
            .collect())
    }

    /// Write peers in id order; the output is byte-stable for equal content.
    pub fn write(&self, peers: &[Peer]) -> Result<(), PeersError> {
        let records: Vec<PeerRecord> = peers
            .iter()
            .map(|p| PeerRecord {
                net_addr: p.net_addr.clone(),
                pub_key_hex: p.pub_key_hex.clone(),
                moniker: p.moniker.clone(),
            })
            .collect();
        let mut data = serde_json::to_vec_pretty(&records)?;
        data.push(b'\n');
        fs::write(&self.path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn peer(n: u8) -> Peer {
        let kp = KeyPair::generate();
        Peer::new(format!("127.0.0.1:{}", 1337 + n as u16), kp.public_key().to_hex(), format!("peer{n}"))
    }

    #[test]
    fn ids_are_assigned_in_order() {
        let set = PeerSet::new(vec![peer(0), peer(1), peer(2)]);
        let ids: Vec<u32> = set.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(set.next_id(), 3);
    }

    #[test]
    fn super_majority_thresholds() {
        for (n, want) in [(1, 1), (2, 2), (3, 3), (4, 3), (7, 5), (10, 7)] {
            let set = PeerSet::new((0..n).map(|i| peer(i as u8)).collect());
            assert_eq!(set.super_majority(), want, "n={n}");
        }
    }

    #[test]
    fn add_then_remove_keeps_ids_stable() {
        let set = PeerSet::new(vec![peer(0), peer(1), peer(2)]);
        let added = set.with_new_peer(peer(3));
        assert_eq!(added.len(), 4);
        assert_eq!(added.iter().last().unwrap().id, 3);

        let removed_key = added.get_by_id(1).unwrap().pub_key_hex.clone();
        let removed = added.with_removed_peer(&removed_key);
        assert_eq!(removed.len(), 3);
        assert!(removed.get_by_id(1).is_none());
        // A later join does not reuse the removed id's slot below the max.
        assert_eq!(removed.next_id(), 4);
    }

    #[test]
    fn serialization_is_byte_identical_for_equal_content() {
        let peers = vec![peer(0), peer(1)];
        let a = PeerSet::new(peers.clone());
        let b = PeerSet::new(peers);
        assert_eq!(
            bincode::serialize(&a).unwrap(),
            bincode::serialize(&b).unwrap()
        );
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonPeerSet::new(dir.path(), false);
        let peers = vec![peer(0), peer(1), peer(2)];
        file.write(&peers).unwrap();

        let read = file.read().unwrap();
        assert_eq!(read, peers);

        // Byte-identical on rewrite.
        let first = fs::read(file.path()).unwrap();
        file.write(&read).unwrap();
        assert_eq!(first, fs::read(file.path()).unwrap());
    }

    #[test]
    fn supermajority_check_ignores_strangers_and_duplicates() {
        let set = PeerSet::new(vec![peer(0), peer(1), peer(2), peer(3)]);
        let keys: Vec<String> = set.iter().map(|p| p.pub_key_hex.clone()).collect();
        let outsider = peer(9).pub_key_hex;

        let two = [keys[0].as_str(), keys[0].as_str(), keys[1].as_str(), outsider.as_str()];
        assert!(!set.has_super_majority(two.into_iter()));

        let three = [keys[0].as_str(), keys[1].as_str(), keys[2].as_str()];
        assert!(set.has_super_majority(three.into_iter()));
    }
}
