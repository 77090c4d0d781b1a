//! Node record (spec section 4.2) and node pool (spec section 4.3).

pub mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::CoreResult;
use crate::rpc::proto::{SandboxListEntry, ServiceStatus};
use crate::rpc::{CreateOutcome, WorkerRpc};

pub use pool::NodePool;

/// Lifecycle status of a worker node, as tracked by the pool (spec section
/// 4.2/4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Freshly inserted, not yet confirmed reachable.
    Connecting,
    /// Passing health checks and eligible for placement.
    Ready,
    /// Marked by an operator or by `ServiceStatusOverride`; no new
    /// placements, existing sandboxes unaffected.
    Draining,
    /// `node_sync_max_retries` consecutive `Sync` failures.
    Unhealthy,
}

/// Placement-relevant metrics a node reports on each `Sync`, plus the
/// in-progress snapshot taken at the moment `metrics()` is called.
#[derive(Debug, Clone, Default)]
pub struct NodeMetrics {
    pub running_sandboxes: u32,
    pub cpu_allocated_millicores: u64,
    pub ram_allocated_mib: u64,
    /// Sandboxes with a `Create` RPC in flight (reserved during placement,
    /// cleared once the store confirms the insert or the RPC fails — spec
    /// section 3, "in-progress set").
    pub in_progress_count: u32,
    pub in_progress_vcpu_millicores: u64,
}

/// A single build-cache entry the node has reported it holds, with the TTL
/// at which it expires (spec section 3, "Build-cache entry").
#[derive(Debug, Clone)]
pub struct CachedBuild {
    pub build_id: String,
    pub expires_at: Instant,
}

/// Outcome of a successful `Sync` (spec section 4.2/4.7 step 2): either
/// the node answered and handed back its worker-reported sandbox list, or
/// its service instance id no longer matches what this record last saw —
/// the node restarted under the orchestrator's feet and must be
/// deregistered so the next discovery tick reconnects it fresh.
#[derive(Debug)]
pub enum SyncOutcome {
    Refreshed(Vec<SandboxListEntry>),
    Restarted,
}

/// A worker node known to the orchestrator.
///
/// Holds its own `WorkerRpc` handle so callers never juggle connections
/// directly; `Sync`, `AddSandbox`, `InsertBuild` all serialize through an
/// internal lock the way the teacher's pool guarded its warm-pool map
/// (release the lock before the next `.await` that needs a second one).
pub struct Node {
    pub cluster_id: String,
    pub node_id: String,
    pub address: String,
    pub metadata: HashMap<String, String>,
    status: Mutex<NodeStatus>,
    metrics: Mutex<NodeMetrics>,
    build_cache: Mutex<Vec<CachedBuild>>,
    /// The service instance id this record last confirmed via `ServiceInfo`
    /// or discovery. Empty until the first successful `Sync`.
    service_instance_id: Mutex<String>,
    /// Sandboxes with a `Create` RPC outstanding, keyed by sandbox id,
    /// storing the vcpu/ram reserved for them — read by placement scoring
    /// on every candidate node (spec section 3, 4.2, 4.5).
    in_progress: DashMap<String, (i64, i64)>,
    consecutive_sync_failures: AtomicU32,
    rpc: Mutex<WorkerRpc>,
}

impl Node {
    pub fn new(
        cluster_id: impl Into<String>,
        node_id: impl Into<String>,
        address: impl Into<String>,
        service_instance_id: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> CoreResult<Self> {
        let node_id = node_id.into();
        let address = address.into();
        let rpc = WorkerRpc::connect(node_id.clone(), address.clone())?;
        Ok(Self {
            cluster_id: cluster_id.into(),
            node_id,
            address,
            metadata,
            status: Mutex::new(NodeStatus::Connecting),
            metrics: Mutex::new(NodeMetrics::default()),
            build_cache: Mutex::new(Vec::new()),
            service_instance_id: Mutex::new(service_instance_id.into()),
            in_progress: DashMap::new(),
            consecutive_sync_failures: AtomicU32::new(0),
            rpc: Mutex::new(rpc),
        })
    }

    pub async fn status(&self) -> NodeStatus {
        *self.status.lock().await
    }

    pub async fn service_instance_id(&self) -> String {
        self.service_instance_id.lock().await.clone()
    }

    pub async fn metrics(&self) -> NodeMetrics {
        let mut metrics = self.metrics.lock().await.clone();
        metrics.in_progress_count = self.in_progress.len() as u32;
        metrics.in_progress_vcpu_millicores =
            self.in_progress.iter().map(|e| (e.value().0.max(0) as u64) * 1000).sum();
        metrics
    }

    /// Reserves `sandbox_id`'s vcpu/ram against this node's in-progress set
    /// before a `Create` RPC is dispatched (spec section 4.2, "in-progress
    /// set is `insert(id, {vcpu, ram})` before the Create RPC").
    pub fn reserve_placement(&self, sandbox_id: &str, vcpu_count: i64, ram_mib: i64) {
        self.in_progress.insert(sandbox_id.to_string(), (vcpu_count, ram_mib));
    }

    /// Removes `sandbox_id`'s in-progress marker without committing it to
    /// the running counters — called on a failed `Create` RPC, or to unwind
    /// a placement that never made it into the store.
    pub fn release_placement(&self, sandbox_id: &str) {
        self.in_progress.remove(sandbox_id);
    }

    /// Calls `ServiceInfo`, `List`, and `ListCachedBuilds` and reconciles
    /// this node's local view (spec section 4.2, `Sync`; section 4.7 step
    /// 2). A changed service instance id means the worker process
    /// restarted since the last sync — the caller is expected to
    /// deregister this record and let discovery reconnect a fresh one
    /// rather than keep syncing against stale RPC connections.
    pub async fn sync(
        &self,
        health_timeout: Duration,
        max_retries: u32,
        build_cache_ttl: Duration,
    ) -> CoreResult<SyncOutcome> {
        let info = {
            let mut rpc = self.rpc.lock().await;
            rpc.service_info(health_timeout).await
        };
        let info = match info {
            Ok(info) => info,
            Err(err) => {
                let failures = self.consecutive_sync_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= max_retries {
                    *self.status.lock().await = NodeStatus::Unhealthy;
                }
                return Err(err);
            }
        };
        self.consecutive_sync_failures.store(0, Ordering::SeqCst);

        {
            let mut known = self.service_instance_id.lock().await;
            if known.is_empty() {
                *known = info.service_id.clone();
            } else if !info.service_id.is_empty() && *known != info.service_id {
                return Ok(SyncOutcome::Restarted);
            }
        }

        {
            let mut status = self.status.lock().await;
            *status = if info.service_status == ServiceStatus::Healthy as i32 {
                NodeStatus::Ready
            } else if info.service_status == ServiceStatus::Draining as i32 {
                NodeStatus::Draining
            } else {
                NodeStatus::Unhealthy
            };
        }

        let sandboxes = {
            let mut rpc = self.rpc.lock().await;
            rpc.list(health_timeout).await?
        }
        .sandboxes;

        let builds = {
            let mut rpc = self.rpc.lock().await;
            rpc.list_cached_builds(health_timeout).await?
        };
        {
            let mut cache = self.build_cache.lock().await;
            let expires_at = Instant::now() + build_cache_ttl;
            *cache = builds
                .builds
                .into_iter()
                .map(|b| CachedBuild { build_id: b.build_id, expires_at })
                .collect();
        }

        Ok(SyncOutcome::Refreshed(sandboxes))
    }

    /// Moves one sandbox from "in-progress" to "running" in this node's
    /// counters, committing its reserved vcpu/ram into the live-allocated
    /// totals (spec section 4.8, `onInsert`; section 4.2, "remove(id) on
    /// success, after accounting is committed").
    pub async fn confirm_sandbox_running(&self, sandbox_id: &str, vcpu_count: i64, ram_mib: i64) {
        self.in_progress.remove(sandbox_id);
        let mut metrics = self.metrics.lock().await;
        metrics.running_sandboxes += 1;
        metrics.cpu_allocated_millicores += (vcpu_count.max(0) as u64) * 1000;
        metrics.ram_allocated_mib += ram_mib.max(0) as u64;
    }

    /// Removes one sandbox from this node's running count and live
    /// CPU/RAM totals (spec section 4.8, `onDelete`).
    pub async fn release_sandbox(&self, vcpu_count: i64, ram_mib: i64) {
        let mut metrics = self.metrics.lock().await;
        metrics.running_sandboxes = metrics.running_sandboxes.saturating_sub(1);
        metrics.cpu_allocated_millicores =
            metrics.cpu_allocated_millicores.saturating_sub((vcpu_count.max(0) as u64) * 1000);
        metrics.ram_allocated_mib = metrics.ram_allocated_mib.saturating_sub(ram_mib.max(0) as u64);
    }

    pub async fn mark_draining(&self) {
        *self.status.lock().await = NodeStatus::Draining;
    }

    /// Dispatches a `Create` RPC for a sandbox whose in-progress marker was
    /// already reserved by placement. On failure, releases that marker so
    /// scoring stops counting it immediately rather than waiting for the
    /// next `Sync` (spec section 4.2, "remove(id)... on failure").
    pub async fn add_sandbox(
        &self,
        sandbox: crate::rpc::proto::SandboxConfig,
        start_time_unix_ms: i64,
        end_time_unix_ms: i64,
        deadline: Duration,
    ) -> CoreResult<CreateOutcome> {
        let sandbox_id = sandbox.sandbox_id.clone();
        let outcome = {
            let mut rpc = self.rpc.lock().await;
            rpc.create(sandbox, start_time_unix_ms, end_time_unix_ms, deadline).await
        };
        if outcome.is_err() {
            self.release_placement(&sandbox_id);
        }
        outcome
    }

    /// Records that this node now holds `build_id` in its local cache,
    /// with the default TTL (spec section 3, "Build-cache entry" —
    /// refreshed whenever the node confirms it still has the build).
    pub async fn insert_build(&self, build_id: impl Into<String>, ttl: Duration) {
        let mut cache = self.build_cache.lock().await;
        let build_id = build_id.into();
        cache.retain(|b| b.build_id != build_id);
        cache.push(CachedBuild { build_id, expires_at: Instant::now() + ttl });
    }

    pub async fn has_cached_build(&self, build_id: &str) -> bool {
        let cache = self.build_cache.lock().await;
        cache.iter().any(|b| b.build_id == build_id && b.expires_at > Instant::now())
    }

    /// Direct access to the underlying RPC client for calls this record
    /// doesn't wrap itself (pause, checkpoint, copy-to-store, list).
    pub async fn rpc(&self) -> tokio::sync::MutexGuard<'_, WorkerRpc> {
        self.rpc.lock().await
    }

    /// Idempotent: safe to call more than once, matching `WorkerRpc::close`.
    pub async fn close(&self) {
        let rpc = self.rpc.lock().await;
        rpc.close();
    }
}
