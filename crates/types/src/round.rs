//! Per-round bookkeeping: witnesses, fame, and queued events.

use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fame of a witness, decided by the virtual vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fame {
    Undecided,
    Famous,
    NotFamous,
}

/// Everything the engine tracks about one round.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundInfo {
    /// Events assigned to this round; the flag marks witnesses.
    pub created: BTreeMap<Hash, bool>,
    /// Fame decisions for this round's witnesses.
    pub fame: BTreeMap<Hash, Fame>,
    /// Events whose round-received is this round, in consensus order once
    /// the round is decided.
    pub queued: Vec<Hash>,
    /// Set when the fame of every witness is decided.
    pub decided: bool,
}

impl RoundInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event assigned to this round.
    pub fn add_created(&mut self, hash: Hash, witness: bool) {
        self.created.insert(hash, witness);
        if witness {
            self.fame.entry(hash).or_insert(Fame::Undecided);
        }
    }

    /// Witness hashes in canonical (hash) order.
    pub fn witnesses(&self) -> Vec<Hash> {
        self.created
            .iter()
            .filter(|(_, &w)| w)
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn is_witness(&self, hash: &Hash) -> bool {
        self.created.get(hash).copied().unwrap_or(false)
    }

    pub fn fame(&self, witness: &Hash) -> Fame {
        self.fame.get(witness).copied().unwrap_or(Fame::Undecided)
    }

    pub fn set_fame(&mut self, witness: Hash, fame: Fame) {
        self.fame.insert(witness, fame);
    }

    /// Famous witnesses in canonical order.
    pub fn famous_witnesses(&self) -> Vec<Hash> {
        self.fame
            .iter()
            .filter(|(_, &f)| f == Fame::Famous)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Whether every witness has a fame verdict.
    pub fn all_fame_decided(&self) -> bool {
        !self.fame.is_empty() && self.fame.values().all(|&f| f != Fame::Undecided)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fame_lifecycle() {
        let mut round = RoundInfo::new();
        let w1 = Hash::digest(b"w1");
        let w2 = Hash::digest(b"w2");
        let plain = Hash::digest(b"plain");

        round.add_created(w1, true);
        round.add_created(w2, true);
        round.add_created(plain, false);

        assert_eq!(round.witnesses().len(), 2);
        assert!(round.is_witness(&w1));
        assert!(!round.is_witness(&plain));
        assert!(!round.all_fame_decided());

        round.set_fame(w1, Fame::Famous);
        assert!(!round.all_fame_decided());
        round.set_fame(w2, Fame::NotFamous);
        assert!(round.all_fame_decided());
        assert_eq!(round.famous_witnesses(), vec![w1]);
    }
}
