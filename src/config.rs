use std::time::Duration;

use crate::gval;

/// Runtime tunables of one ring member.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// host:port this node listens on; the node id is the sha1 of it
    pub listen_address: String,
    /// member to join through at startup
    pub bootstrap: Option<String>,
    pub stabilize_interval: Duration,
    pub stabilize_jitter: Duration,
    pub rpc_timeout: Duration,
    pub get_result_timeout: Duration,
    pub join_timeout: Duration,
    pub finger_refresh_cycles: u32,
    pub hop_bound_factor: u32,
    pub hop_bound_slack: u32,
}

impl NodeConfig {
    pub fn new(listen_address: impl Into<String>) -> NodeConfig {
        NodeConfig {
            listen_address: listen_address.into(),
            bootstrap: None,
            stabilize_interval: Duration::from_millis(gval::STABILIZE_INTERVAL_MS),
            stabilize_jitter: Duration::from_millis(gval::STABILIZE_JITTER_MS),
            rpc_timeout: Duration::from_millis(gval::RPC_TIMEOUT_MS),
            get_result_timeout: Duration::from_millis(gval::GET_RESULT_TIMEOUT_MS),
            join_timeout: Duration::from_millis(gval::JOIN_TIMEOUT_MS),
            finger_refresh_cycles: gval::FINGER_REFRESH_CYCLES,
            hop_bound_factor: gval::HOP_BOUND_FACTOR,
            hop_bound_slack: gval::HOP_BOUND_SLACK,
        }
    }

    /// Largest hop count a traversal may reach before it is treated as
    /// looping on a corrupted ring.
    pub fn hop_bound(&self, ring_size_estimate: usize) -> u32 {
        let estimate = ring_size_estimate.max(1).min(u32::MAX as usize) as u32;
        self.hop_bound_factor
            .saturating_mul(estimate)
            .saturating_add(self.hop_bound_slack)
    }
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig::new("127.0.0.1:50051")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.stabilize_interval, Duration::from_secs(3));
        assert_eq!(config.finger_refresh_cycles, 5);
        assert!(config.bootstrap.is_none());
    }

    #[test]
    fn hop_bound_scales_with_estimate() {
        let config = NodeConfig::default();
        assert_eq!(config.hop_bound(0), 12);
        assert_eq!(config.hop_bound(1), 12);
        assert_eq!(config.hop_bound(10), 48);
    }
}
