//! The event: the unit of gossip and the vertex of the DAG.
//!
//! An event's identity is the SHA-256 digest of its canonically-encoded
//! body; the creator's signature covers that digest. Bodies contain only
//! vectors and fixed-width fields, so the bincode encoding is deterministic
//! and encode→decode→encode is byte-stable.

use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::hash::Hash;
use crate::peers::Peer;
use crate::TypesError;
use serde::{Deserialize, Serialize};

/// Index carried by the synthetic root predecessor of each creator.
pub const ROOT_INDEX: i64 = -1;

/// Consensus-level membership change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InternalTransactionKind {
    PeerAdd,
    PeerRemove,
}

/// A membership change travelling through consensus like any transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InternalTransaction {
    pub kind: InternalTransactionKind,
    pub peer: Peer,
}

impl InternalTransaction {
    pub fn add(peer: Peer) -> Self {
        InternalTransaction {
            kind: InternalTransactionKind::PeerAdd,
            peer,
        }
    }

    pub fn remove(peer: Peer) -> Self {
        InternalTransaction {
            kind: InternalTransactionKind::PeerRemove,
            peer,
        }
    }

    pub fn as_accepted(&self) -> InternalTransactionReceipt {
        InternalTransactionReceipt {
            tx: self.clone(),
            accepted: true,
        }
    }

    pub fn as_rejected(&self) -> InternalTransactionReceipt {
        InternalTransactionReceipt {
            tx: self.clone(),
            accepted: false,
        }
    }
}

/// The application's verdict on an internal transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InternalTransactionReceipt {
    pub tx: InternalTransaction,
    pub accepted: bool,
}

/// A validator's signature over a block, gossiped inside event bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    /// Hex public key of the signer.
    pub validator: String,
    /// Index of the signed block.
    pub index: u64,
    pub signature: Signature,
}

/// The signed portion of an event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    /// Opaque application transactions, in submission order.
    pub transactions: Vec<Vec<u8>>,
    pub internal_transactions: Vec<InternalTransaction>,
    /// Hash of the creator's previous event (or the synthetic root parent).
    pub self_parent: Hash,
    /// Hash of the counterparty's head at sync time, if any.
    pub other_parent: Option<Hash>,
    pub creator: PublicKey,
    /// Creator-local sequence number; the root predecessor carries −1.
    pub index: i64,
    /// Creation wall-clock, unix milliseconds.
    pub timestamp: i64,
    pub block_signatures: Vec<BlockSignature>,
}

impl EventBody {
    /// Deterministic encoding used for hashing and the wire.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, TypesError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn hash(&self) -> Result<Hash, TypesError> {
        Ok(Hash::digest(&self.canonical_bytes()?))
    }
}

/// A signed event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub body: EventBody,
    pub signature: Signature,
}

impl Event {
    /// An unsigned event; call [`Event::sign`] before gossiping it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transactions: Vec<Vec<u8>>,
        internal_transactions: Vec<InternalTransaction>,
        block_signatures: Vec<BlockSignature>,
        self_parent: Hash,
        other_parent: Option<Hash>,
        creator: PublicKey,
        index: i64,
        timestamp: i64,
    ) -> Self {
        Event {
            body: EventBody {
                transactions,
                internal_transactions,
                self_parent,
                other_parent,
                creator,
                index,
                timestamp,
                block_signatures,
            },
            signature: Signature::zero(),
        }
    }

    /// The synthetic self-parent cited by a creator's first event, shared by
    /// bootstrap roots and live chains.
    pub fn root_self_parent(creator: &PublicKey) -> Hash {
        let mut data = Vec::with_capacity(5 + 33);
        data.extend_from_slice(b"root:");
        data.extend_from_slice(creator.as_bytes());
        Hash::digest(&data)
    }

    pub fn hash(&self) -> Result<Hash, TypesError> {
        self.body.hash()
    }

    pub fn creator_hex(&self) -> String {
        self.body.creator.to_hex()
    }

    /// Sign the body hash with the creator key.
    pub fn sign(&mut self, key: &KeyPair) -> Result<(), TypesError> {
        let hash = self.hash()?;
        self.signature = key.sign(hash.as_bytes());
        Ok(())
    }

    /// Recompute the hash and check the creator signature against it.
    pub fn verify(&self) -> Result<(), TypesError> {
        let hash = self.hash()?;
        if !self.body.creator.verify(hash.as_bytes(), &self.signature) {
            return Err(TypesError::InvalidSignature);
        }
        Ok(())
    }

    /// The coin-round vote: least-significant bit of the signature's middle
    /// byte.
    pub fn coin_flip(&self) -> bool {
        self.signature.0[32] & 0x01 == 0x01
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_keypair;

    fn sample_event(key: &KeyPair) -> Event {
        let creator = key.public_key();
        Event::new(
            vec![b"abc".to_vec(), b"def".to_vec()],
            vec![],
            vec![],
            Event::root_self_parent(&creator),
            None,
            creator,
            0,
            1_700_000_000_000,
        )
    }

    #[test]
    fn sign_then_verify() {
        let key = test_keypair(1);
        let mut event = sample_event(&key);
        event.sign(&key).unwrap();
        event.verify().unwrap();
    }

    #[test]
    fn tampered_body_fails_verification() {
        let key = test_keypair(1);
        let mut event = sample_event(&key);
        event.sign(&key).unwrap();
        event.body.transactions.push(b"ghi".to_vec());
        assert!(matches!(event.verify(), Err(TypesError::InvalidSignature)));
    }

    #[test]
    fn foreign_signature_fails_verification() {
        let key = test_keypair(1);
        let other = test_keypair(2);
        let mut event = sample_event(&key);
        event.sign(&other).unwrap();
        assert!(event.verify().is_err());
    }

    #[test]
    fn canonical_encoding_is_byte_stable() {
        let key = test_keypair(3);
        let mut event = sample_event(&key);
        event.sign(&key).unwrap();

        let encoded = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&encoded).unwrap();
        let re_encoded = bincode::serialize(&decoded).unwrap();
        assert_eq!(encoded, re_encoded);
        assert_eq!(event.hash().unwrap(), decoded.hash().unwrap());
    }

    #[test]
    fn root_parent_is_per_creator() {
        let a = test_keypair(1).public_key();
        let b = test_keypair(2).public_key();
        assert_ne!(Event::root_self_parent(&a), Event::root_self_parent(&b));
        assert_eq!(Event::root_self_parent(&a), Event::root_self_parent(&a));
    }
}
