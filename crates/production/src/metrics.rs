//! Prometheus metrics for the runner.

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Registered counters and gauges, shared between the runner and the
/// metrics endpoint.
pub struct Metrics {
    registry: Registry,
    /// Outbound requests by message kind.
    pub outbound_requests: IntCounterVec,
    /// Outbound exchanges that failed (timeout, closed, codec).
    pub outbound_failures: IntCounterVec,
    /// Inbound requests by message kind.
    pub inbound_requests: IntCounterVec,
    /// Blocks handed to the application.
    pub blocks_committed: IntGauge,
    /// Events that have not reached consensus.
    pub undecided_events: IntGauge,
    /// Last decided round.
    pub last_consensus_round: IntGauge,
    /// Node state as an enum gauge (0 = Babbling … 5 = Shutdown).
    pub node_state: IntGauge,
    /// Invalid events received, labelled by sender peer id. Observable
    /// for scoring; nothing is banned automatically.
    pub invalid_events: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let outbound_requests = IntCounterVec::new(
            Opts::new("filament_outbound_requests_total", "Outbound requests by kind"),
            &["kind"],
        )?;
        let outbound_failures = IntCounterVec::new(
            Opts::new("filament_outbound_failures_total", "Failed outbound exchanges"),
            &["kind"],
        )?;
        let inbound_requests = IntCounterVec::new(
            Opts::new("filament_inbound_requests_total", "Inbound requests by kind"),
            &["kind"],
        )?;
        let blocks_committed = IntGauge::new(
            "filament_blocks_committed",
            "Index of the last block handed to the application",
        )?;
        let undecided_events = IntGauge::new(
            "filament_undecided_events",
            "Events that have not reached consensus",
        )?;
        let last_consensus_round = IntGauge::new(
            "filament_last_consensus_round",
            "Last decided round",
        )?;
        let node_state = IntGauge::new("filament_node_state", "Node life-cycle state")?;
        let invalid_events = IntGaugeVec::new(
            Opts::new("filament_invalid_events", "Invalid events by sender peer id"),
            &["peer"],
        )?;

        registry.register(Box::new(outbound_requests.clone()))?;
        registry.register(Box::new(outbound_failures.clone()))?;
        registry.register(Box::new(inbound_requests.clone()))?;
        registry.register(Box::new(blocks_committed.clone()))?;
        registry.register(Box::new(undecided_events.clone()))?;
        registry.register(Box::new(last_consensus_round.clone()))?;
        registry.register(Box::new(node_state.clone()))?;
        registry.register(Box::new(invalid_events.clone()))?;

        Ok(Metrics {
            registry,
            outbound_requests,
            outbound_failures,
            inbound_requests,
            blocks_committed,
            undecided_events,
            last_consensus_round,
            node_state,
            invalid_events,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_node_state(&self, state: filament_core::NodeState) {
        use filament_core::NodeState::*;
        let value = match state {
            Babbling => 0,
            CatchingUp => 1,
            Joining => 2,
            Leaving => 3,
            Suspended => 4,
            Shutdown => 5,
        };
        self.node_state.set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_gather() {
        let metrics = Metrics::new().unwrap();
        metrics.outbound_requests.with_label_values(&["sync"]).inc();
        metrics.set_node_state(filament_core::NodeState::Suspended);

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "filament_outbound_requests_total"));
        assert!(families.iter().any(|f| f.get_name() == "filament_node_state"));
    }
}
