//! 32-byte SHA-256 digests identifying events, frames and blocks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing a hash from hex.
#[derive(Debug, Error)]
pub enum HexError {
    #[error("expected 64 hex characters, got {0}")]
    InvalidLength(usize),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

/// A 32-byte SHA-256 digest.
///
/// All identities in the DAG are hashes: events are addressed by the digest
/// of their canonically-encoded body, frames and blocks by the digest of
/// their contents. Graph edges are represented only by parent hashes; walks
/// resolve them through the store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero hash.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Wrap raw digest bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Compute the SHA-256 digest of `data`.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from lowercase or uppercase hex.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        if s.len() != 64 {
            return Err(HexError::InvalidLength(s.len()));
        }
        let bytes = hex::decode(s)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }

    /// XOR two hashes, used for order-whitening.
    pub fn xor(&self, other: &Hash) -> Hash {
        let mut out = [0u8; 32];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Hash(out)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", &self.to_hex()[..8])
    }
}

impl FromStr for Hash {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(s)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let a = Hash::digest(b"filament");
        let b = Hash::digest(b"filament");
        assert_eq!(a, b);
        assert_ne!(a, Hash::digest(b"filament!"));
    }

    #[test]
    fn hex_round_trip() {
        let h = Hash::digest(b"round trip");
        let parsed = Hash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(matches!(
            Hash::from_hex("abcd"),
            Err(HexError::InvalidLength(4))
        ));
        assert!(Hash::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn xor_is_involutive() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        assert_eq!(a.xor(&b).xor(&b), a);
    }
}
