//! Cluster registry (spec sections 3 and 4.7): the set of clusters the
//! orchestrator discovers nodes from, plus the handful of attributes that
//! vary per cluster (sandbox domain for DNS, advertised orchestrator
//! instances for peer discovery).

use std::collections::HashMap;

use dashmap::DashMap;

use crate::collaborators::AdvertisedNode;
use crate::error::{CoreError, CoreResult};

/// A discoverable cluster of worker nodes.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub cluster_id: String,
    /// DNS suffix sandboxes in this cluster are routed under, if the
    /// cluster exposes one (spec section 3).
    pub sandbox_domain: Option<String>,
    /// Orchestrator instances advertising for this cluster — the remote
    /// discovery source the reconciliation loop unions with the local
    /// cluster's own node list on every tick (spec section 4.7).
    pub orchestrator_instances: Vec<AdvertisedNode>,
}

impl Cluster {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self { cluster_id: cluster_id.into(), sandbox_domain: None, orchestrator_instances: Vec::new() }
    }
}

/// In-memory registry of known clusters, keyed by cluster id.
#[derive(Default)]
pub struct ClusterRegistry {
    clusters: DashMap<String, Cluster>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self { clusters: DashMap::new() }
    }

    pub fn insert(&self, cluster: Cluster) {
        self.clusters.insert(cluster.cluster_id.clone(), cluster);
    }

    pub fn get(&self, cluster_id: &str) -> CoreResult<Cluster> {
        self.clusters
            .get(cluster_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::ClusterNotFound(cluster_id.to_string()))
    }

    pub fn all(&self) -> HashMap<String, Cluster> {
        self.clusters.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect()
    }

    pub fn remove(&self, cluster_id: &str) -> Option<Cluster> {
        self.clusters.remove(cluster_id).map(|(_, c)| c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let registry = ClusterRegistry::new();
        registry.insert(Cluster::new("c1"));
        assert_eq!(registry.get("c1").unwrap().cluster_id, "c1");
    }

    #[test]
    fn unknown_cluster_is_not_found() {
        let registry = ClusterRegistry::new();
        assert!(matches!(registry.get("missing"), Err(CoreError::ClusterNotFound(_))));
    }
}
