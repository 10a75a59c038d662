//! Blocks: the linear, signed output of consensus.
//!
//! A block packages the transactions of one decided frame. Validators sign
//! the body hash and gossip their signatures inside events; once a
//! supermajority of the block's peer-set has signed, the certificate is
//! complete and the block is committed.

use crate::crypto::{KeyPair, Signature};
use crate::event::{BlockSignature, InternalTransaction, InternalTransactionReceipt};
use crate::frame::Frame;
use crate::hash::Hash;
use crate::peers::PeerSet;
use crate::TypesError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The signed portion of a block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockBody {
    pub index: u64,
    pub round_received: u64,
    pub timestamp: i64,
    pub frame_hash: Hash,
    pub peers_hash: Hash,
    pub transactions: Vec<Vec<u8>>,
    pub internal_transactions: Vec<InternalTransaction>,
    pub internal_transaction_receipts: Vec<InternalTransactionReceipt>,
    /// Post-execution state digest returned by the application.
    pub state_hash: Vec<u8>,
}

/// A block plus its accumulating signature certificate.
///
/// Signatures are keyed by signer public key (hex) in a `BTreeMap` so the
/// encoding of a given certificate is canonical.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub body: BlockBody,
    pub signatures: BTreeMap<String, Signature>,
}

impl Block {
    /// Build the block for a decided frame.
    pub fn from_frame(index: u64, frame: &Frame) -> Result<Self, TypesError> {
        Ok(Block {
            body: BlockBody {
                index,
                round_received: frame.round,
                timestamp: frame.timestamp,
                frame_hash: frame.hash()?,
                peers_hash: frame.peers.hash()?,
                transactions: frame.transactions(),
                internal_transactions: frame.internal_transactions(),
                internal_transaction_receipts: vec![],
                state_hash: vec![],
            },
            signatures: BTreeMap::new(),
        })
    }

    pub fn index(&self) -> u64 {
        self.body.index
    }

    pub fn round_received(&self) -> u64 {
        self.body.round_received
    }

    /// Digest of the body; what validators sign.
    pub fn hash(&self) -> Result<Hash, TypesError> {
        Ok(Hash::digest(&bincode::serialize(&self.body)?))
    }

    /// Sign the body hash.
    pub fn sign(&self, key: &KeyPair) -> Result<BlockSignature, TypesError> {
        let hash = self.hash()?;
        Ok(BlockSignature {
            validator: key.public_key().to_hex(),
            index: self.body.index,
            signature: key.sign(hash.as_bytes()),
        })
    }

    /// Verify one signature against the body hash.
    pub fn verify_signature(&self, bs: &BlockSignature) -> Result<bool, TypesError> {
        let hash = self.hash()?;
        let Ok(pk) = crate::crypto::PublicKey::from_hex(&bs.validator) else {
            return Ok(false);
        };
        Ok(pk.verify(hash.as_bytes(), &bs.signature))
    }

    /// Record a signature in the certificate.
    pub fn set_signature(&mut self, bs: BlockSignature) {
        self.signatures.insert(bs.validator, bs.signature);
    }

    pub fn get_signature(&self, validator_hex: &str) -> Option<BlockSignature> {
        self.signatures.get(validator_hex).map(|sig| BlockSignature {
            validator: validator_hex.to_string(),
            index: self.body.index,
            signature: *sig,
        })
    }

    /// Whether signatures from a supermajority of `peers` are present
    /// (membership only; see [`Block::verify_certificate`] for validity).
    pub fn certificate_complete(&self, peers: &PeerSet) -> bool {
        peers.has_super_majority(self.signatures.keys().map(String::as_str))
    }

    /// Verify every recorded signature and check that the valid ones cover a
    /// supermajority of `peers`.
    pub fn verify_certificate(&self, peers: &PeerSet) -> Result<bool, TypesError> {
        let hash = self.hash()?;
        let mut valid = 0usize;
        for (validator, sig) in &self.signatures {
            if !peers.contains(validator) {
                continue;
            }
            let Ok(pk) = crate::crypto::PublicKey::from_hex(validator) else {
                continue;
            };
            if pk.verify(hash.as_bytes(), sig) {
                valid += 1;
            }
        }
        Ok(valid >= peers.super_majority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::InternalTransactionKind;
    use crate::peers::Peer;
    use crate::test_utils::{test_keypair, test_peer_set};

    fn test_block(peers: &PeerSet) -> Block {
        Block {
            body: BlockBody {
                index: 0,
                round_received: 1,
                timestamp: 123_456_789,
                frame_hash: Hash::digest(b"framehash"),
                peers_hash: peers.hash().unwrap(),
                transactions: vec![b"abc".to_vec(), b"def".to_vec(), b"ghi".to_vec()],
                internal_transactions: vec![
                    InternalTransaction::add(Peer::new("paris", "peer1", "peer1")),
                    InternalTransaction::remove(Peer::new("london", "peer2", "peer2")),
                ],
                internal_transaction_receipts: vec![],
                state_hash: vec![],
            },
            signatures: BTreeMap::new(),
        }
    }

    #[test]
    fn sign_and_verify_signature() {
        let (peers, keys) = test_peer_set(3);
        let block = test_block(&peers);

        let bs = block.sign(&keys[0]).unwrap();
        assert!(block.verify_signature(&bs).unwrap());
    }

    #[test]
    fn append_and_fetch_signature() {
        let (peers, keys) = test_peer_set(3);
        let mut block = test_block(&peers);

        let bs = block.sign(&keys[1]).unwrap();
        block.set_signature(bs.clone());

        let fetched = block.get_signature(&bs.validator).unwrap();
        assert_eq!(fetched, bs);
        assert!(block.verify_signature(&fetched).unwrap());
    }

    #[test]
    fn certificate_needs_supermajority() {
        let (peers, keys) = test_peer_set(4);
        let mut block = test_block(&peers);

        // 4 peers -> supermajority is 3.
        for key in keys.iter().take(2) {
            block.set_signature(block.sign(key).unwrap());
        }
        assert!(!block.certificate_complete(&peers));
        assert!(!block.verify_certificate(&peers).unwrap());

        block.set_signature(block.sign(&keys[2]).unwrap());
        assert!(block.certificate_complete(&peers));
        assert!(block.verify_certificate(&peers).unwrap());

        // Removing any signature drops it below threshold again.
        let some_key = block.signatures.keys().next().unwrap().clone();
        block.signatures.remove(&some_key);
        assert!(!block.verify_certificate(&peers).unwrap());
    }

    #[test]
    fn outsider_signature_does_not_count() {
        let (peers, keys) = test_peer_set(3);
        let mut block = test_block(&peers);

        for key in &keys[..2] {
            block.set_signature(block.sign(key).unwrap());
        }
        let outsider = test_keypair(42);
        block.set_signature(block.sign(&outsider).unwrap());

        // 2 member signatures + 1 outsider < supermajority of 3.
        assert!(!block.verify_certificate(&peers).unwrap());
    }

    #[test]
    fn tampered_body_invalidates_certificate() {
        let (peers, keys) = test_peer_set(3);
        let mut block = test_block(&peers);
        for key in &keys {
            block.set_signature(block.sign(key).unwrap());
        }
        assert!(block.verify_certificate(&peers).unwrap());

        block.body.transactions.push(b"extra".to_vec());
        assert!(!block.verify_certificate(&peers).unwrap());
    }

    #[test]
    fn receipts_follow_internal_transactions() {
        let (peers, _) = test_peer_set(3);
        let block = test_block(&peers);
        let receipts: Vec<_> = block
            .body
            .internal_transactions
            .iter()
            .map(|itx| itx.as_accepted())
            .collect();
        assert_eq!(receipts.len(), 2);
        assert!(receipts.iter().all(|r| r.accepted));
        assert_eq!(receipts[0].tx.kind, InternalTransactionKind::PeerAdd);
    }
}
