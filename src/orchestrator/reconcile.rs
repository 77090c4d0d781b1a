//! Reconciliation loop (spec section 4.7): ticks on `sync_period`,
//! discovers clusters, syncs every known node's health, and reaps
//! sandboxes whose TTL has expired.
//!
//! Idempotent with respect to a concurrent `CreateSandbox`: a tick only
//! ever acts on nodes/sandboxes already present in the pool/store at the
//! moment it reads them, so a sandbox created mid-tick is simply picked
//! up on the next one rather than raced against.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::collaborators::AdvertisedNode;
use crate::node::{Node, SyncOutcome};
use crate::orchestrator::Orchestrator;
use crate::sandbox::RemoteSandbox;

pub fn spawn(orchestrator: Arc<Orchestrator>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(orchestrator.config.sync_period);
        loop {
            interval.tick().await;
            tick(&orchestrator).await;
        }
    })
}

#[instrument(skip(orchestrator))]
async fn tick(orchestrator: &Orchestrator) {
    discover(orchestrator).await;

    // Every node already in the pool gets synced, regardless of which
    // discovery source put it there (spec section 4.7 step 2) — the local
    // cluster id doesn't necessarily have a `Cluster` descriptor in the
    // registry, so this can't be driven off `clusters.all()`.
    let snapshot = orchestrator.nodes.items();
    for node in snapshot.nodes {
        match node
            .sync(
                orchestrator.config.node_health_check_timeout,
                orchestrator.config.node_sync_max_retries,
                orchestrator.config.build_cache_default_ttl,
            )
            .await
        {
            Ok(SyncOutcome::Restarted) => {
                warn!(
                    node_id = %node.node_id,
                    "node reports a new service instance id, deregistering for rediscovery"
                );
                orchestrator.nodes.remove(&node.cluster_id, &node.node_id).await;
            }
            Ok(SyncOutcome::Refreshed(sandboxes)) => {
                let remote: Vec<RemoteSandbox> = sandboxes.into_iter().map(Into::into).collect();
                orchestrator.sandboxes.sync_node(&node.cluster_id, &node.node_id, remote).await;
            }
            Err(err) => warn!(node_id = %node.node_id, error = %err, "node sync failed"),
        }
    }

    let expired = orchestrator.sandboxes.sync(Instant::now()).await;
    for sandbox_id in &expired {
        let auto_pause =
            orchestrator.sandboxes.get(sandbox_id).await.map(|s| s.auto_pause).unwrap_or(false);
        // An expiring auto-pause sandbox is paused rather than torn down
        // (spec section 4.8, onDelete; scenario 4) — anything else goes
        // through the normal delete path.
        let result = if auto_pause {
            orchestrator.pause(sandbox_id).await
        } else {
            orchestrator.delete_instance(sandbox_id).await
        };
        match result {
            Ok(()) => info!(sandbox_id = %sandbox_id, auto_pause, "reaped expired sandbox"),
            Err(err) => warn!(sandbox_id = %sandbox_id, error = %err, "failed to reap expired sandbox"),
        }
    }
}

/// Discovery step (spec section 4.7, step 1): union the local cluster's own
/// node list with every registered cluster's advertised orchestrator
/// instances, connect+insert anything not already in the pool, and reap
/// anything the pool holds that's no longer advertised by its source
/// (spec section 4.7 step 2, scenario 5).
#[instrument(skip(orchestrator))]
async fn discover(orchestrator: &Orchestrator) {
    let mut advertised_by_cluster: HashMap<String, Vec<AdvertisedNode>> = HashMap::new();

    match orchestrator.discovery.discover().await {
        Ok(local_nodes) => {
            advertised_by_cluster.insert(orchestrator.config.local_cluster_id.clone(), local_nodes);
        }
        Err(err) => warn!(error = %err, "local node discovery failed"),
    }

    for cluster in orchestrator.clusters.all().into_values() {
        advertised_by_cluster.insert(cluster.cluster_id, cluster.orchestrator_instances);
    }

    for (cluster_id, advertised) in &advertised_by_cluster {
        for node in advertised {
            connect_and_insert(orchestrator, cluster_id, node.clone()).await;
        }
        reap_unadvertised_nodes(orchestrator, cluster_id, advertised).await;
    }
}

/// Connects and inserts a newly-discovered node, or, if the pool already
/// holds a node under this id whose advertised service instance id has
/// changed, deregisters the stale record first — the worker restarted and
/// the old `WorkerRpc` handle no longer points at anything meaningful
/// (spec section 4.7 step 2, scenario 5).
async fn connect_and_insert(orchestrator: &Orchestrator, cluster_id: &str, advertised: AdvertisedNode) {
    if let Ok(existing) = orchestrator.nodes.get(cluster_id, &advertised.node_id) {
        let known = existing.service_instance_id().await;
        if known.is_empty() || known == advertised.service_instance_id {
            return;
        }
        warn!(
            cluster_id,
            node_id = %advertised.node_id,
            "advertised service instance id changed, reconnecting"
        );
        orchestrator.nodes.remove(cluster_id, &advertised.node_id).await;
    }

    match Node::new(
        cluster_id.to_string(),
        advertised.node_id.clone(),
        advertised.address.clone(),
        advertised.service_instance_id.clone(),
        Default::default(),
    ) {
        Ok(node) => {
            info!(cluster_id, node_id = %advertised.node_id, "discovered node");
            orchestrator.nodes.insert(Arc::new(node));
        }
        Err(err) => warn!(cluster_id, node_id = %advertised.node_id, error = %err, "failed to connect to discovered node"),
    }
}

/// Removes any node the pool holds for `cluster_id` that `advertised` no
/// longer lists — the discovery source stopped advertising it, so it's
/// gone for good rather than merely unreachable (spec section 4.7 step 2).
async fn reap_unadvertised_nodes(orchestrator: &Orchestrator, cluster_id: &str, advertised: &[AdvertisedNode]) {
    let still_advertised: std::collections::HashSet<&str> =
        advertised.iter().map(|n| n.node_id.as_str()).collect();
    for node in orchestrator.nodes.items_in_cluster(cluster_id).nodes {
        if !still_advertised.contains(node.node_id.as_str()) {
            info!(cluster_id, node_id = %node.node_id, "node no longer advertised, removing from pool");
            orchestrator.nodes.remove(cluster_id, &node.node_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AdvertisedNode, JsonlCollaborators, NodeDiscovery};
    use crate::config::OrchestratorConfig;
    use crate::error::CoreResult;
    use std::time::Duration;
    use tempfile::tempdir;

    struct FakeDiscovery(Vec<AdvertisedNode>);

    #[async_trait::async_trait]
    impl NodeDiscovery for FakeDiscovery {
        async fn discover(&self) -> CoreResult<Vec<AdvertisedNode>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn tick_is_a_noop_with_no_clusters_or_sandboxes() {
        let dir = tempdir().unwrap();
        let collaborators = Arc::new(JsonlCollaborators::new(dir.path().join("log.jsonl")));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            collaborators.clone(),
            collaborators.clone(),
            collaborators.clone(),
            collaborators,
        );
        tick(&orchestrator).await;
        assert_eq!(orchestrator.nodes.count(), 0);
    }

    #[tokio::test]
    async fn tick_discovers_and_inserts_a_locally_advertised_node() {
        let dir = tempdir().unwrap();
        let collaborators = Arc::new(JsonlCollaborators::new(dir.path().join("log.jsonl")));
        let discovery = Arc::new(FakeDiscovery(vec![AdvertisedNode {
            node_id: "n1".into(),
            address: "http://127.0.0.1:0".into(),
            service_instance_id: "svc-1".into(),
        }]));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            collaborators.clone(),
            collaborators.clone(),
            collaborators,
            discovery,
        );

        tick(&orchestrator).await;
        assert_eq!(orchestrator.nodes.count(), 1);
        assert!(orchestrator.nodes.get(&orchestrator.config.local_cluster_id, "n1").is_ok());

        // A second tick must not insert a duplicate.
        tick(&orchestrator).await;
        assert_eq!(orchestrator.nodes.count(), 1);
    }

    #[tokio::test]
    async fn discover_reaps_a_node_the_source_stops_advertising() {
        let dir = tempdir().unwrap();
        let collaborators = Arc::new(JsonlCollaborators::new(dir.path().join("log.jsonl")));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            collaborators.clone(),
            collaborators.clone(),
            collaborators,
            Arc::new(FakeDiscovery(Vec::new())),
        );
        orchestrator.nodes.insert(Arc::new(
            Node::new("local", "n1", "http://127.0.0.1:0", "svc-1", HashMap::new()).unwrap(),
        ));

        discover(&orchestrator).await;
        assert_eq!(orchestrator.nodes.count(), 0);
    }

    #[tokio::test]
    async fn discover_reconnects_a_node_whose_service_instance_id_changed() {
        let dir = tempdir().unwrap();
        let collaborators = Arc::new(JsonlCollaborators::new(dir.path().join("log.jsonl")));
        let discovery = Arc::new(FakeDiscovery(vec![AdvertisedNode {
            node_id: "n1".into(),
            address: "http://127.0.0.1:0".into(),
            service_instance_id: "svc-2".into(),
        }]));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            collaborators.clone(),
            collaborators.clone(),
            collaborators,
            discovery,
        );
        orchestrator.nodes.insert(Arc::new(
            Node::new("local", "n1", "http://127.0.0.1:0", "svc-1", HashMap::new()).unwrap(),
        ));

        discover(&orchestrator).await;
        assert_eq!(orchestrator.nodes.count(), 1);
        let node = orchestrator.nodes.get(&orchestrator.config.local_cluster_id, "n1").unwrap();
        assert_eq!(node.service_instance_id().await, "svc-2");
    }

    #[tokio::test]
    async fn spawn_runs_at_least_one_tick_without_panicking() {
        let dir = tempdir().unwrap();
        let collaborators = Arc::new(JsonlCollaborators::new(dir.path().join("log.jsonl")));
        let mut config = OrchestratorConfig::default();
        config.sync_period = Duration::from_millis(5);
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            collaborators.clone(),
            collaborators.clone(),
            collaborators.clone(),
            collaborators,
        ));
        let handle = spawn(orchestrator);
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();
    }
}
