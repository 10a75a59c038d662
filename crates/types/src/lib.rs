//! Foundational types for the Filament consensus engine.
//!
//! This crate provides the types used throughout the implementation:
//!
//! - **Primitives**: [`Hash`], secp256k1 keys and signatures
//! - **Membership**: [`Peer`], [`PeerSet`] and the JSON bootstrap files
//! - **DAG**: [`Event`], internal transactions, block signatures
//! - **Consensus output**: [`Root`], [`Frame`], [`Block`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained and depends on no other workspace crates,
//! making it the foundation layer. Everything here is passive data with
//! deterministic (bincode) canonical encodings; graph structure is expressed
//! only through hashes.

mod block;
mod crypto;
mod event;
mod frame;
mod hash;
mod peers;
mod round;

pub use block::{Block, BlockBody};
pub use crypto::{CryptoError, KeyPair, PublicKey, Signature};
pub use event::{
    BlockSignature, Event, EventBody, InternalTransaction, InternalTransactionKind,
    InternalTransactionReceipt, ROOT_INDEX,
};
pub use frame::{Frame, FrameEvent, Root};
pub use hash::{Hash, HexError};
pub use peers::{JsonPeerSet, Peer, PeerSet, PeersError, GENESIS_PEERS_FILE, PEERS_FILE};
pub use round::{Fame, RoundInfo};

use thiserror::Error;

/// The known-events vector: creator id → highest contiguous self-index
/// (−1 when only the root is known).
pub type KnownEvents = std::collections::BTreeMap<u32, i64>;

/// Errors from type-level operations (encoding, signing, verification).
#[derive(Debug, Error)]
pub enum TypesError {
    #[error("canonical encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("signature does not match body hash and creator")]
    InvalidSignature,
}

/// Test fixtures shared across the workspace.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic keypair derived from a seed byte. The high byte keeps
    /// the scalar nonzero and inside the curve order for every seed.
    pub fn test_keypair(seed: u8) -> KeyPair {
        let mut scalar = [0u8; 32];
        scalar[0] = 0x0f;
        scalar[31] = seed;
        KeyPair::from_hex(&hex::encode(scalar)).expect("seed scalar is a valid key")
    }

    /// A peer whose identity is the seed keypair's public key.
    pub fn test_peer(seed: u8) -> Peer {
        Peer::new(
            format!("127.0.0.1:{}", 1337 + seed as u16),
            test_keypair(seed).public_key().to_hex(),
            format!("peer{seed}"),
        )
    }

    /// A peer set of `n` seeded validators plus their keys, in id order.
    pub fn test_peer_set(n: u8) -> (PeerSet, Vec<KeyPair>) {
        let keys: Vec<KeyPair> = (0..n).map(test_keypair).collect();
        let peers = PeerSet::new((0..n).map(test_peer).collect());
        (peers, keys)
    }
}
