//! Gossip partner selection.

use filament_types::{Peer, PeerSet};

/// Round-robin over the current peer set, skipping ourselves and the peer
/// we synced with last. Deterministic, so the state machine stays
/// reproducible under test.
#[derive(Debug, Default)]
pub struct PeerSelector {
    cursor: usize,
    last: Option<String>,
}

impl PeerSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next gossip partner out of `peers`, never `self_key`.
    pub fn next(&mut self, peers: &PeerSet, self_key: &str) -> Option<Peer> {
        let candidates: Vec<&Peer> = peers
            .iter()
            .filter(|p| p.pub_key_hex != self_key)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Avoid re-picking the previous partner when there is a choice.
        for offset in 0..candidates.len() {
            let pick = candidates[(self.cursor + offset) % candidates.len()];
            let repeat = self.last.as_deref() == Some(pick.pub_key_hex.as_str());
            if !repeat || candidates.len() == 1 {
                self.cursor = (self.cursor + offset + 1) % candidates.len();
                self.last = Some(pick.pub_key_hex.clone());
                return Some(pick.clone());
            }
        }
        None
    }
}
