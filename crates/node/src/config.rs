//! Node configuration.

use std::time::Duration;

/// Everything the state machine and runner need to know about timing,
/// limits and modes. Immutable once the node is constructed.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Gossip timer period while there is something to gossip about.
    pub heartbeat: Duration,
    /// Gossip timer period while idle.
    pub slow_heartbeat: Duration,
    /// Per-connection deadline for sync exchanges.
    pub tcp_timeout: Duration,
    /// Deadline for join requests (they wait for a block to commit).
    pub join_timeout: Duration,
    /// Maximum events in a sync response or eager-sync push.
    pub sync_limit: usize,
    /// Capacity of the store's LRU caches.
    pub cache_size: usize,
    /// Connections pooled per target.
    pub max_pool: usize,
    /// Use persistent storage.
    pub store: bool,
    /// Open an existing database instead of renaming it away.
    pub bootstrap: bool,
    /// Start suspended. Implies `bootstrap`, which implies `store`.
    pub maintenance_mode: bool,
    /// Undecided-event threshold that suspends the node.
    pub suspend_limit: usize,
    /// Accept and initiate snapshot catch-up.
    pub enable_fast_sync: bool,
    /// Rounds between a membership change committing and activating.
    pub activation_lag: u64,
    /// Friendly name of this node.
    pub moniker: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            heartbeat: Duration::from_millis(10),
            slow_heartbeat: Duration::from_millis(1000),
            tcp_timeout: Duration::from_millis(1000),
            join_timeout: Duration::from_secs(10),
            sync_limit: 1000,
            cache_size: 10_000,
            max_pool: 2,
            store: false,
            bootstrap: false,
            maintenance_mode: false,
            suspend_limit: 100,
            enable_fast_sync: false,
            activation_lag: 6,
            moniker: String::new(),
        }
    }
}

impl NodeConfig {
    /// Resolve implied options: maintenance mode forces bootstrap, which
    /// forces persistent storage.
    pub fn normalized(mut self) -> Self {
        if self.maintenance_mode {
            self.bootstrap = true;
        }
        if self.bootstrap {
            self.store = true;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_mode_implies_bootstrap_and_store() {
        let config = NodeConfig {
            maintenance_mode: true,
            ..Default::default()
        }
        .normalized();
        assert!(config.bootstrap);
        assert!(config.store);
    }
}
