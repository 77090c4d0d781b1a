//! Lifecycle hooks (spec section 4.8): best-effort side effects wired to
//! the sandbox store's `onInsert`/`onDelete` points. Each hook is
//! independent and failure in one must never block another — the store
//! already bounds each hook call with `hook_timeout` and only logs on
//! timeout (see `sandbox::store`).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::node::pool::NodePool;
use crate::sandbox::store::{DeleteHook, InsertHook};
use crate::sandbox::Sandbox;

/// Moves a node's sandbox counters from "starting" to "running" once the
/// store confirms the create, and removes the sandbox from the node's
/// running count when it's torn down.
pub struct NodeCounterHook {
    pool: Arc<NodePool>,
}

impl NodeCounterHook {
    pub fn new(pool: Arc<NodePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InsertHook for NodeCounterHook {
    async fn on_insert(&self, sandbox: &Sandbox) {
        match self.pool.get(&sandbox.cluster_id, &sandbox.node_id) {
            Ok(node) => {
                node.confirm_sandbox_running(&sandbox.sandbox_id, sandbox.vcpu_count, sandbox.ram_mib).await
            }
            Err(err) => warn!(sandbox_id = %sandbox.sandbox_id, error = %err, "onInsert: node not found"),
        }
    }
}

#[async_trait]
impl DeleteHook for NodeCounterHook {
    async fn on_delete(&self, sandbox: &Sandbox, _reason: &str) {
        if let Ok(node) = self.pool.get(&sandbox.cluster_id, &sandbox.node_id) {
            node.release_sandbox(sandbox.vcpu_count, sandbox.ram_mib).await;
        }
    }
}
