//! Placement engine (spec section 4.5): picks a node for a new sandbox.
//!
//! Snapshot/filter/score/retry: take a point-in-time copy of the pool
//! (never hold the pool's lock across the scoring pass or the eventual
//! RPC), filter to nodes that can fit the request, score the survivors,
//! and retry against the next-best candidate if the chosen node rejects
//! the placement. A per-node serialization guard keeps two concurrent
//! placements from racing to fill the same node past its cap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::error::{CoreError, CoreResult};
use crate::node::pool::NodePool;
use crate::node::{Node, NodeMetrics, NodeStatus};

/// Resource ask a candidate node must be able to satisfy, keyed to the
/// sandbox id so the chosen node can book it into its in-progress set
/// before the `Create` RPC is dispatched (spec section 3, 4.2).
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub sandbox_id: String,
    pub vcpu_count: i64,
    pub ram_mib: i64,
}

/// Forces placement onto a specific node, bypassing scoring (spec section
/// 4.5, "node-affinity override") — used for resume-from-pause, where the
/// sandbox must land back on the node holding its snapshot.
#[derive(Debug, Clone)]
pub struct PlacementAffinity {
    pub cluster_id: String,
    pub node_id: String,
}

/// Serializes placement attempts per node so concurrent `CreateSandbox`
/// calls can't both observe spare capacity and both commit past it.
#[derive(Default)]
pub struct PlacementEngine {
    node_locks: DashMap<String, Arc<Semaphore>>,
}

impl PlacementEngine {
    pub fn new() -> Self {
        Self { node_locks: DashMap::new() }
    }

    fn lock_for(&self, node_id: &str) -> Arc<Semaphore> {
        self.node_locks.entry(node_id.to_string()).or_insert_with(|| Arc::new(Semaphore::new(1))).clone()
    }

    /// Attempts to place `request`, retrying up to `max_retries` times
    /// with `poll_interval` between attempts, bounded overall by
    /// `wait_timeout` (spec section 4.5).
    #[instrument(skip(self, pool, excluded), fields(max_retries, wait_timeout_ms = wait_timeout.as_millis() as u64))]
    pub async fn place(
        &self,
        pool: &NodePool,
        cluster_id: &str,
        request: PlacementRequest,
        affinity: Option<PlacementAffinity>,
        excluded: &[String],
        max_starting_per_node: u32,
        max_retries: u32,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> CoreResult<Arc<Node>> {
        if let Some(affinity) = affinity {
            let node = pool.get(&affinity.cluster_id, &affinity.node_id)?;
            let _permit = self.lock_for(&node.node_id).acquire_owned().await;
            node.reserve_placement(&request.sandbox_id, request.vcpu_count, request.ram_mib);
            return Ok(node);
        }

        let deadline = Instant::now() + wait_timeout;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let snapshot = pool.items_in_cluster(cluster_id);
            let mut candidates = Vec::new();
            for node in snapshot.nodes {
                if node.status().await != NodeStatus::Ready {
                    continue;
                }
                if excluded.iter().any(|id| id == &node.node_id) {
                    continue;
                }
                let metrics = node.metrics().await;
                if metrics.in_progress_count >= max_starting_per_node {
                    continue;
                }
                candidates.push((score_key(&metrics, &node.node_id), node));
            }
            candidates.sort_by(|a, b| a.0.cmp(&b.0));

            if let Some((_, node)) = candidates.into_iter().next() {
                let permit = self.lock_for(&node.node_id).try_acquire_owned();
                match permit {
                    Ok(_permit) => {
                        node.reserve_placement(&request.sandbox_id, request.vcpu_count, request.ram_mib);
                        return Ok(node);
                    }
                    Err(_) => debug!(node_id = %node.node_id, "node locked by a concurrent placement"),
                }
            }

            if attempts >= max_retries || Instant::now() >= deadline {
                warn!(attempts, "placement exhausted for cluster {}", cluster_id);
                return Err(CoreError::PlacementExhausted { attempts });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Lowest wins. Prefers the node whose committed CPU usage plus its
/// in-progress reserved CPU is lowest, ties broken by fewest in-progress
/// sandboxes, then by node id for a deterministic pick (spec section 4.5,
/// scoring).
fn score_key(metrics: &NodeMetrics, node_id: &str) -> (i64, u32, String) {
    let committed_cpu = metrics.cpu_allocated_millicores as i64;
    let in_progress_cpu = metrics.in_progress_vcpu_millicores as i64;
    (committed_cpu + in_progress_cpu, metrics.in_progress_count, node_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placement_fails_fast_with_no_eligible_nodes() {
        let pool = NodePool::new();
        let engine = PlacementEngine::new();
        let result = engine
            .place(
                &pool,
                "c1",
                PlacementRequest { sandbox_id: "sbx-1".into(), vcpu_count: 1, ram_mib: 512 },
                None,
                &[],
                3,
                3,
                Duration::from_millis(1),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(CoreError::PlacementExhausted { .. })));
    }

    #[test]
    fn score_key_prefers_lower_committed_plus_in_progress_cpu() {
        let busy = NodeMetrics {
            cpu_allocated_millicores: 2000,
            in_progress_vcpu_millicores: 1000,
            ..Default::default()
        };
        let idle = NodeMetrics { cpu_allocated_millicores: 500, ..Default::default() };
        assert!(score_key(&idle, "node-b") < score_key(&busy, "node-a"));
    }

    #[test]
    fn score_key_breaks_ties_by_in_progress_count_then_node_id() {
        let fewer_in_progress =
            NodeMetrics { in_progress_count: 1, ..Default::default() };
        let more_in_progress = NodeMetrics { in_progress_count: 2, ..Default::default() };
        assert!(score_key(&fewer_in_progress, "z") < score_key(&more_in_progress, "a"));

        let a = NodeMetrics::default();
        let b = NodeMetrics::default();
        assert!(score_key(&a, "node-a") < score_key(&b, "node-b"));
    }
}
