//! Orchestrator configuration knobs (spec section 6, "Configuration").
//!
//! Shaped like the teacher's `ResourcesConfig`: one `#[serde(default = "fn")]`
//! function per field plus a `Default` impl that calls the same functions, so
//! the struct deserializes correctly both fully and partially populated.
//! Loading this from a file is an embedder's job, not this crate's — no
//! `from_file`/`from_str` here.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_sync_period() -> Duration {
    Duration::from_secs(20)
}

fn default_max_node_retries() -> u32 {
    3
}

fn default_max_starting_per_node() -> u32 {
    3
}

fn default_placement_wait_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_placement_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_node_sync_max_retries() -> u32 {
    4
}

fn default_build_cache_ttl() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_instance_expiration() -> Duration {
    Duration::from_secs(15)
}

fn default_node_health_check_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_local_cluster_id() -> String {
    "local".to_string()
}

/// Tunables for the orchestration core (spec section 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How often the reconciliation loop ticks.
    #[serde(default = "default_sync_period")]
    pub sync_period: Duration,

    /// Attempts spent searching for an eligible node before a create fails.
    #[serde(default = "default_max_node_retries")]
    pub max_node_retries: u32,

    /// Per-node cap on concurrently-starting sandboxes.
    #[serde(default = "default_max_starting_per_node")]
    pub max_starting_per_node: u32,

    /// Upper bound on how long placement will keep retrying a create.
    #[serde(default = "default_placement_wait_timeout")]
    pub placement_wait_timeout: Duration,

    /// Sleep between placement retries when no node is currently eligible.
    #[serde(default = "default_placement_poll_interval")]
    pub placement_poll_interval: Duration,

    /// Budget given to a single onInsert/onDelete hook invocation.
    #[serde(default = "default_hook_timeout")]
    pub hook_timeout: Duration,

    /// Consecutive Node::Sync failures before a node is marked Unhealthy.
    #[serde(default = "default_node_sync_max_retries")]
    pub node_sync_max_retries: u32,

    /// Default TTL applied to a freshly-learned build-cache entry.
    #[serde(default = "default_build_cache_ttl")]
    pub build_cache_default_ttl: Duration,

    /// Grace window folded into TTL bookkeeping for instance expiration.
    #[serde(default = "default_instance_expiration")]
    pub instance_expiration: Duration,

    /// Deadline applied to a single node health-check RPC.
    #[serde(default = "default_node_health_check_timeout")]
    pub node_health_check_timeout: Duration,

    /// Cluster id nodes from the local `NodeDiscovery` source are inserted
    /// under, distinguishing them from nodes discovered via a remote
    /// cluster's advertised orchestrator instances.
    #[serde(default = "default_local_cluster_id")]
    pub local_cluster_id: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sync_period: default_sync_period(),
            max_node_retries: default_max_node_retries(),
            max_starting_per_node: default_max_starting_per_node(),
            placement_wait_timeout: default_placement_wait_timeout(),
            placement_poll_interval: default_placement_poll_interval(),
            hook_timeout: default_hook_timeout(),
            node_sync_max_retries: default_node_sync_max_retries(),
            build_cache_default_ttl: default_build_cache_ttl(),
            instance_expiration: default_instance_expiration(),
            node_health_check_timeout: default_node_health_check_timeout(),
            local_cluster_id: default_local_cluster_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.sync_period, Duration::from_secs(20));
        assert_eq!(cfg.max_node_retries, 3);
        assert_eq!(cfg.max_starting_per_node, 3);
        assert_eq!(cfg.placement_wait_timeout, Duration::from_secs(60));
        assert_eq!(cfg.placement_poll_interval, Duration::from_millis(10));
        assert_eq!(cfg.node_sync_max_retries, 4);
        assert_eq!(cfg.build_cache_default_ttl, Duration::from_secs(120));
        assert_eq!(cfg.instance_expiration, Duration::from_secs(15));
        assert_eq!(cfg.node_health_check_timeout, Duration::from_secs(2));
        assert_eq!(cfg.local_cluster_id, "local");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults_on_deserialize() {
        let cfg: OrchestratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_node_retries, OrchestratorConfig::default().max_node_retries);
    }
}
