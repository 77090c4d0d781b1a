//! Orchestration operations (spec section 4.6): the operations an
//! embedding API layer calls directly — create, delete, pause, snapshot,
//! keep-alive, and metadata/lifecycle updates.

pub mod reconcile;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::instrument;

use crate::cluster::ClusterRegistry;
use crate::collaborators::{AnalyticsEvent, AnalyticsSink, DnsCatalog, NodeDiscovery, SnapshotStore};
use crate::config::OrchestratorConfig;
use crate::error::{CoreError, CoreResult};
use crate::hooks::NodeCounterHook;
use crate::node::pool::NodePool;
use crate::placement::{PlacementAffinity, PlacementEngine, PlacementRequest};
use crate::rpc::proto::SandboxConfig as WireSandboxConfig;
use crate::sandbox::{Reservation, ReservationTable, Sandbox, SandboxState, SandboxStore};

/// Caller-supplied parameters for `CreateSandbox` (spec section 4.6).
#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub sandbox_id: String,
    pub execution_id: String,
    pub template_id: String,
    pub build_id: String,
    pub team_id: String,
    pub cluster_id: String,
    pub alias: String,
    pub vcpu_count: i64,
    pub ram_mib: i64,
    pub total_disk_mib: i64,
    pub metadata: HashMap<String, String>,
    pub env_vars: HashMap<String, String>,
    pub auto_pause: bool,
    pub allow_internet_access: bool,
    pub team_concurrency_limit: i64,
    /// Initial requested TTL, clamped against `max_instance_length`.
    pub instance_length: Duration,
    /// Duration ceiling from the sandbox's tier (spec section 3). Every
    /// later `KeepAliveFor` call is clamped against `start + max_instance_length`,
    /// not against the current end time.
    pub max_instance_length: Duration,
    /// Set when this create is a resume from a paused snapshot — forces
    /// placement back onto the node holding the snapshot and preserves
    /// the caller's `auto_pause` value rather than overriding it (spec
    /// section 9's resolved open question).
    pub resume_affinity: Option<PlacementAffinity>,
}

/// Wires the node pool, sandbox store, placement engine, and external
/// collaborators into the operations spec section 4.6 describes.
pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub clusters: ClusterRegistry,
    pub nodes: Arc<NodePool>,
    pub sandboxes: SandboxStore,
    pub placement: PlacementEngine,
    pub reservations: ReservationTable,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub dns: Arc<dyn DnsCatalog>,
    pub discovery: Arc<dyn NodeDiscovery>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        snapshot_store: Arc<dyn SnapshotStore>,
        analytics: Arc<dyn AnalyticsSink>,
        dns: Arc<dyn DnsCatalog>,
        discovery: Arc<dyn NodeDiscovery>,
    ) -> Self {
        let hook_timeout = config.hook_timeout;
        let nodes = Arc::new(NodePool::new());
        let mut sandboxes = SandboxStore::new(hook_timeout);
        let counter_hook = Arc::new(NodeCounterHook::new(nodes.clone()));
        sandboxes.register_insert_hook(counter_hook.clone());
        sandboxes.register_delete_hook(counter_hook);
        Self {
            config,
            clusters: ClusterRegistry::new(),
            nodes,
            sandboxes,
            placement: PlacementEngine::new(),
            reservations: ReservationTable::new(),
            snapshot_store,
            analytics,
            dns,
            discovery,
        }
    }

    /// The 8-step create path (spec section 4.6):
    /// 1. reject a duplicate start-in-flight
    /// 2. reserve the team's concurrency slot
    /// 3. place the sandbox on an eligible node
    /// 4. dispatch the worker `Create` RPC
    /// 5. record the sandbox in the store (fires `onInsert`)
    /// 6. register the node's build-cache entry
    /// 7. update the DNS/routing catalog
    /// 8. emit an analytics event
    ///
    /// Any failure after step 3 releases the placement lock on that node
    /// implicitly (the `Reservation`/lock guards drop) so a retried create
    /// can land on a different node without operator intervention.
    #[instrument(skip(self, request), fields(sandbox_id = %request.sandbox_id, team_id = %request.team_id))]
    pub async fn create_sandbox(&self, mut request: CreateSandboxRequest) -> CoreResult<Sandbox> {
        if request.execution_id.is_empty() {
            request.execution_id = uuid::Uuid::new_v4().to_string();
        }

        // Reserving atomically rejects both a team over its concurrency
        // cap and a duplicate start for this sandbox id — no separate
        // pre-check against the store, which would race a second
        // concurrent call for the same id (spec section 3/4.4).
        let running_count = self.sandboxes.running_count_for_team(&request.team_id).await;
        let _reservation: Reservation = self.reservations.reserve(
            &request.team_id,
            &request.sandbox_id,
            request.team_concurrency_limit,
            running_count,
        )?;

        let now = Instant::now();
        let initial_ttl = request.instance_length.min(request.max_instance_length);
        let end_time = now + initial_ttl;
        let start_time_unix_ms = chrono::Utc::now().timestamp_millis();
        let end_time_unix_ms = start_time_unix_ms + initial_ttl.as_millis() as i64;
        let wire = WireSandboxConfig {
            sandbox_id: request.sandbox_id.clone(),
            execution_id: request.execution_id.clone(),
            template_id: request.template_id.clone(),
            build_id: request.build_id.clone(),
            alias: request.alias.clone(),
            vcpu_count: request.vcpu_count,
            ram_mib: request.ram_mib,
            total_disk_mib: request.total_disk_mib,
            kernel_version: String::new(),
            firecracker_version: String::new(),
            envd_version: String::new(),
            metadata: request.metadata.clone(),
            env_vars: request.env_vars.clone(),
            auto_pause: request.auto_pause,
            allow_internet_access: request.allow_internet_access,
            envd_access_token: String::new(),
            network_descriptor: Vec::new(),
            team_id: request.team_id.clone(),
        };

        // Node-affinity (resume) only applies to the first attempt; a
        // Create RPC failure on the preferred node falls back to the
        // normal search, same as any other excluded node (spec section
        // 4.5, "node-affinity override").
        let mut excluded_node_ids: Vec<String> = Vec::new();
        let mut affinity = request.resume_affinity.clone();
        let node = loop {
            let candidate = self
                .placement
                .place(
                    &self.nodes,
                    &request.cluster_id,
                    PlacementRequest {
                        sandbox_id: request.sandbox_id.clone(),
                        vcpu_count: request.vcpu_count,
                        ram_mib: request.ram_mib,
                    },
                    affinity.take(),
                    &excluded_node_ids,
                    self.config.max_starting_per_node,
                    self.config.max_node_retries,
                    self.config.placement_poll_interval,
                    self.config.placement_wait_timeout,
                )
                .await?;

            match candidate
                .add_sandbox(
                    wire.clone(),
                    start_time_unix_ms,
                    end_time_unix_ms,
                    self.config.placement_wait_timeout,
                )
                .await
            {
                Ok(_) => break candidate,
                Err(err) if excluded_node_ids.len() + 1 >= self.config.max_node_retries as usize => {
                    return Err(err);
                }
                Err(_) => excluded_node_ids.push(candidate.node_id.clone()),
            }
        };

        let sandbox = Sandbox {
            sandbox_id: request.sandbox_id.clone(),
            execution_id: request.execution_id.clone(),
            template_id: request.template_id.clone(),
            build_id: request.build_id.clone(),
            team_id: request.team_id.clone(),
            cluster_id: request.cluster_id.clone(),
            node_id: node.node_id.clone(),
            alias: request.alias.clone(),
            vcpu_count: request.vcpu_count,
            ram_mib: request.ram_mib,
            total_disk_mib: request.total_disk_mib,
            metadata: request.metadata.clone(),
            auto_pause: request.auto_pause,
            allow_internet_access: request.allow_internet_access,
            state: SandboxState::Running,
            start_time: now,
            end_time,
            max_instance_length: request.max_instance_length,
        };
        // If the store rejects the insert, the worker already has the
        // sandbox running and its placement reservation is already
        // committed — unwind both rather than leak them (spec section
        // 4.6 step 7, "on store.Add failure, call DeleteInstance to
        // unwind and return error").
        if let Err(err) = self.sandboxes.add(sandbox.clone()).await {
            node.release_placement(&request.sandbox_id);
            let mut rpc = node.rpc().await;
            let _ = rpc
                .delete(&request.sandbox_id, &request.execution_id, self.config.node_health_check_timeout)
                .await;
            return Err(err);
        }

        node.insert_build(request.build_id.clone(), self.config.build_cache_default_ttl).await;

        self.dns.add(&request.sandbox_id, &node.address).await?;
        self.analytics
            .record(AnalyticsEvent::SandboxCreated {
                sandbox_id: request.sandbox_id.clone(),
                team_id: request.team_id.clone(),
                node_id: node.node_id.clone(),
            })
            .await;

        Ok(sandbox)
    }

    #[instrument(skip(self))]
    pub async fn delete_instance(&self, sandbox_id: &str) -> CoreResult<()> {
        let sandbox = self.sandboxes.get(sandbox_id).await?;
        let node = self.nodes.get(&sandbox.cluster_id, &sandbox.node_id)?;
        let mut rpc = node.rpc().await;
        rpc.delete(sandbox_id, &sandbox.execution_id, self.config.node_health_check_timeout).await?;
        drop(rpc);

        self.sandboxes.delete(sandbox_id, "explicit").await?;
        self.dns.remove(sandbox_id).await?;
        self.analytics
            .record(AnalyticsEvent::SandboxDeleted {
                sandbox_id: sandbox_id.to_string(),
                reason: "explicit".to_string(),
            })
            .await;
        Ok(())
    }

    /// Pauses a sandbox into a snapshot (spec section 4.6). The sandbox is
    /// marked `Pausing` first so a racing `Delete` can see it mid-flight
    /// (spec section 4.4's "pausing set").
    #[instrument(skip(self))]
    pub async fn pause(&self, sandbox_id: &str) -> CoreResult<()> {
        let sandbox = self.sandboxes.get(sandbox_id).await?;
        if sandbox.state != SandboxState::Running {
            return Err(CoreError::NotRunning(sandbox_id.to_string()));
        }
        self.sandboxes.mark_as_pausing(sandbox_id);
        self.sandboxes.update(sandbox_id, |s| s.state = SandboxState::Pausing).await?;

        let node = self.nodes.get(&sandbox.cluster_id, &sandbox.node_id)?;
        let result = {
            let mut rpc = node.rpc().await;
            rpc.pause(
                sandbox_id,
                &sandbox.execution_id,
                &sandbox.template_id,
                &sandbox.build_id,
                self.config.hook_timeout,
            )
            .await
        };
        self.sandboxes.unmark_as_pausing(sandbox_id);

        match result {
            Ok(()) => {
                self.snapshot_store.save_snapshot(&sandbox.template_id, &sandbox.build_id).await?;
                self.sandboxes.delete(sandbox_id, "paused").await?;
                self.analytics
                    .record(AnalyticsEvent::SandboxPaused { sandbox_id: sandbox_id.to_string() })
                    .await;
                Ok(())
            }
            Err(err) => {
                self.sandboxes.update(sandbox_id, |s| s.state = SandboxState::Running).await?;
                Err(err)
            }
        }
    }

    /// Takes a checkpoint without tearing the sandbox down (spec section
    /// 4.6, "Snapshot template").
    #[instrument(skip(self))]
    pub async fn snapshot_template(&self, sandbox_id: &str) -> CoreResult<()> {
        let sandbox = self.sandboxes.get(sandbox_id).await?;
        if sandbox.state != SandboxState::Running {
            return Err(CoreError::NotRunning(sandbox_id.to_string()));
        }
        self.sandboxes.update(sandbox_id, |s| s.state = SandboxState::Snapshotting).await?;
        let node = self.nodes.get(&sandbox.cluster_id, &sandbox.node_id)?;
        let result = {
            let mut rpc = node.rpc().await;
            rpc.checkpoint(
                sandbox_id,
                &sandbox.execution_id,
                &sandbox.template_id,
                &sandbox.build_id,
                self.config.hook_timeout,
            )
            .await
        };
        self.sandboxes.update(sandbox_id, |s| s.state = SandboxState::Running).await?;
        result?;
        self.snapshot_store.save_snapshot(&sandbox.template_id, &sandbox.build_id).await
    }

    /// Extends a sandbox's TTL (spec section 4.6, `KeepAliveFor`): clamps
    /// the requested extension to the sandbox's remaining tier budget, then
    /// only forwards the new end time to the owning worker node if the
    /// store actually moved it (a request that would shorten the TTL is a
    /// no-op unless `allow_shorter` is set).
    #[instrument(skip(self))]
    pub async fn keep_alive_for(
        &self,
        sandbox_id: &str,
        duration: Duration,
        allow_shorter: bool,
    ) -> CoreResult<()> {
        let sandbox = self.sandboxes.get(sandbox_id).await?;
        if sandbox.state != SandboxState::Running {
            return Err(CoreError::SandboxNotFound(sandbox_id.to_string()));
        }
        let now = Instant::now();
        if sandbox.exceeds_max_instance_length(now) {
            return Err(CoreError::MaxUptimeReached(sandbox_id.to_string()));
        }
        let remaining = sandbox.max_instance_length - now.duration_since(sandbox.start_time);
        let ttl = duration.min(remaining);
        let new_end_time = now + ttl;

        let moved = self.sandboxes.extend_end_time(sandbox_id, new_end_time, allow_shorter).await?;
        if !moved {
            return Ok(());
        }

        let node = self.nodes.get(&sandbox.cluster_id, &sandbox.node_id)?;
        let new_end_unix_ms = chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let mut rpc = node.rpc().await;
        rpc.update(
            sandbox_id,
            &sandbox.execution_id,
            new_end_unix_ms,
            HashMap::new(),
            self.config.node_health_check_timeout,
        )
        .await
    }

    #[instrument(skip(self, metadata))]
    pub async fn update_sandbox_metadata(
        &self,
        sandbox_id: &str,
        metadata: HashMap<String, String>,
    ) -> CoreResult<()> {
        let sandbox = self.sandboxes.get(sandbox_id).await?;
        let node = self.nodes.get(&sandbox.cluster_id, &sandbox.node_id)?;
        {
            let mut rpc = node.rpc().await;
            rpc.update(
                sandbox_id,
                &sandbox.execution_id,
                0,
                metadata.clone(),
                self.config.node_health_check_timeout,
            )
            .await?;
        }
        self.sandboxes.update(sandbox_id, |s| s.metadata = metadata).await.map(|_| ())
    }

    /// Preserves the caller-specified `auto_pause` at resume time rather
    /// than silently overriding it (spec section 9's resolved open
    /// question on `autoPause && isResume`).
    #[instrument(skip(self))]
    pub async fn update_sandbox_lifecycle(
        &self,
        sandbox_id: &str,
        auto_pause: bool,
    ) -> CoreResult<()> {
        self.sandboxes.update(sandbox_id, |s| s.auto_pause = auto_pause).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::JsonlCollaborators;
    use tempfile::tempdir;

    fn test_orchestrator() -> Orchestrator {
        let dir = tempdir().unwrap();
        let collaborators = Arc::new(JsonlCollaborators::new(dir.path().join("log.jsonl")));
        Orchestrator::new(
            OrchestratorConfig::default(),
            collaborators.clone(),
            collaborators.clone(),
            collaborators.clone(),
            collaborators,
        )
    }

    fn running_sandbox(id: &str, start_time: Instant, max_instance_length: Duration) -> Sandbox {
        Sandbox {
            sandbox_id: id.to_string(),
            execution_id: "exec-1".into(),
            template_id: "tmpl-1".into(),
            build_id: "build-1".into(),
            team_id: "team-1".into(),
            cluster_id: "c1".into(),
            node_id: "n1".into(),
            alias: String::new(),
            vcpu_count: 1,
            ram_mib: 256,
            total_disk_mib: 512,
            metadata: HashMap::new(),
            auto_pause: false,
            allow_internet_access: true,
            state: SandboxState::Running,
            start_time,
            end_time: start_time + Duration::from_secs(30),
            max_instance_length,
        }
    }

    #[tokio::test]
    async fn keep_alive_for_rejects_once_the_tier_ceiling_is_reached() {
        let orchestrator = test_orchestrator();
        let start_time = Instant::now() - Duration::from_secs(120);
        orchestrator
            .sandboxes
            .add(running_sandbox("sbx-1", start_time, Duration::from_secs(60)))
            .await
            .unwrap();

        let result = orchestrator.keep_alive_for("sbx-1", Duration::from_secs(30), false).await;
        assert!(matches!(result, Err(CoreError::MaxUptimeReached(_))));
    }

    #[tokio::test]
    async fn keep_alive_for_is_a_noop_when_the_request_would_shorten_the_ttl() {
        let orchestrator = test_orchestrator();
        let start_time = Instant::now() - Duration::from_secs(5);
        orchestrator
            .sandboxes
            .add(running_sandbox("sbx-1", start_time, Duration::from_secs(3600)))
            .await
            .unwrap();

        // Current end time is start + 30s; requesting a 1s extension from
        // now is shorter than what's already in force, so with
        // allow_shorter=false this must succeed without touching any node.
        let result = orchestrator.keep_alive_for("sbx-1", Duration::from_secs(1), false).await;
        assert!(result.is_ok());
    }
}
