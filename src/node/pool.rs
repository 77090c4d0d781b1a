//! Node pool (spec section 4.3): a concurrent map keyed by
//! `(cluster_id, node_id)`, with snapshot helpers so placement and
//! reconciliation never hold the map's lock across an RPC.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{CoreError, CoreResult};
use crate::node::Node;

/// `(cluster_id, node_id)` — the pool's key, matching how nodes are
/// addressed throughout the rest of the core (spec section 4.3).
pub type NodeKey = (String, String);

/// A cheap, point-in-time copy of the pool's contents, used by placement
/// and reconciliation so neither ever holds the pool's lock while making
/// an RPC (spec section 9, "copy the key set... then release the lock").
pub struct NodeSnapshot {
    pub nodes: Vec<Arc<Node>>,
}

#[derive(Default)]
pub struct NodePool {
    nodes: DashMap<NodeKey, Arc<Node>>,
}

impl NodePool {
    pub fn new() -> Self {
        Self { nodes: DashMap::new() }
    }

    pub fn insert(&self, node: Arc<Node>) {
        let key = (node.cluster_id.clone(), node.node_id.clone());
        self.nodes.insert(key, node);
    }

    pub async fn remove(&self, cluster_id: &str, node_id: &str) -> Option<Arc<Node>> {
        let removed = self.nodes.remove(&(cluster_id.to_string(), node_id.to_string()));
        if let Some((_, node)) = &removed {
            node.close().await;
        }
        removed.map(|(_, node)| node)
    }

    pub fn get(&self, cluster_id: &str, node_id: &str) -> CoreResult<Arc<Node>> {
        self.nodes
            .get(&(cluster_id.to_string(), node_id.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::NodeNotFound(node_id.to_string()))
    }

    /// Looks a node up by a short id prefix within a cluster — used by
    /// operator-facing lookups where the caller only has a truncated id
    /// (spec section 4.3).
    pub fn get_by_cluster_and_short_id(
        &self,
        cluster_id: &str,
        short_id: &str,
    ) -> CoreResult<Arc<Node>> {
        self.nodes
            .iter()
            .find(|entry| entry.key().0 == cluster_id && entry.key().1.starts_with(short_id))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::NodeNotFound(short_id.to_string()))
    }

    pub fn items(&self) -> NodeSnapshot {
        NodeSnapshot { nodes: self.nodes.iter().map(|entry| entry.value().clone()).collect() }
    }

    pub fn items_in_cluster(&self, cluster_id: &str) -> NodeSnapshot {
        NodeSnapshot {
            nodes: self
                .nodes
                .iter()
                .filter(|entry| entry.key().0 == cluster_id)
                .map(|entry| entry.value().clone())
                .collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_node(cluster: &str, id: &str) -> Arc<Node> {
        Arc::new(
            Node::new(cluster, id, "http://127.0.0.1:0", "", HashMap::new())
                .expect("lazy connect never fails"),
        )
    }

    #[test]
    fn insert_then_get_round_trips() {
        let pool = NodePool::new();
        pool.insert(test_node("c1", "n1"));
        let node = pool.get("c1", "n1").unwrap();
        assert_eq!(node.node_id, "n1");
    }

    #[test]
    fn get_unknown_node_is_not_found() {
        let pool = NodePool::new();
        assert!(matches!(pool.get("c1", "missing"), Err(CoreError::NodeNotFound(_))));
    }

    #[test]
    fn short_id_lookup_matches_prefix() {
        let pool = NodePool::new();
        pool.insert(test_node("c1", "abcdef123456"));
        let node = pool.get_by_cluster_and_short_id("c1", "abcdef").unwrap();
        assert_eq!(node.node_id, "abcdef123456");
    }

    #[test]
    fn items_in_cluster_filters_by_cluster_id() {
        let pool = NodePool::new();
        pool.insert(test_node("c1", "n1"));
        pool.insert(test_node("c2", "n2"));
        let snapshot = pool.items_in_cluster("c1");
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].node_id, "n1");
    }

    #[test]
    fn count_reflects_insertions() {
        let pool = NodePool::new();
        assert_eq!(pool.count(), 0);
        pool.insert(test_node("c1", "n1"));
        assert_eq!(pool.count(), 1);
    }
}
