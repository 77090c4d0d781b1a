//! Sandbox store (spec section 4.4): the orchestrator's view of every
//! live sandbox, keyed by sandbox id.
//!
//! Concurrency shape follows the teacher's warm-pool guard discipline:
//! each sandbox's own state lives behind its own `Mutex` so a long-running
//! update to one sandbox never blocks reads of another, and locks are
//! always released before crossing an `.await` that needs a second one
//! (notably: never hold a sandbox's lock while running a hook).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::sandbox::ttl_wheel::TtlWheel;
use crate::sandbox::{Sandbox, SandboxState};

/// Runs after a sandbox is added to the store (spec section 4.8). Best
/// effort: a hook failure is logged, never propagated to the caller of
/// `Add`.
#[async_trait]
pub trait InsertHook: Send + Sync {
    async fn on_insert(&self, sandbox: &Sandbox);
}

/// Runs after a sandbox is removed from the store (spec section 4.8),
/// with the reason the removal happened (explicit delete, TTL expiry,
/// eviction).
#[async_trait]
pub trait DeleteHook: Send + Sync {
    async fn on_delete(&self, sandbox: &Sandbox, reason: &str);
}

struct Entry {
    sandbox: Mutex<Sandbox>,
    notify: Arc<Notify>,
}

/// One sandbox a worker node's `List` RPC reported it still holds (spec
/// section 4.4, `Sync`). Carries only what the wire call actually
/// returns — `into_sandbox` fills the rest with defaults.
#[derive(Debug, Clone)]
pub struct RemoteSandbox {
    pub sandbox_id: String,
    pub execution_id: String,
    pub team_id: String,
    pub start_time_unix_ms: i64,
    pub end_time_unix_ms: i64,
}

impl RemoteSandbox {
    /// Best-effort reconstruction of a full `Sandbox` record for a
    /// sandbox the store never saw created — `List` doesn't carry the
    /// template/build/resource fields, so those come back empty/zeroed
    /// until the next worker-originated update fills them in.
    fn into_sandbox(self, cluster_id: &str, node_id: &str) -> Sandbox {
        let now = Instant::now();
        let start_time = unix_ms_to_instant(self.start_time_unix_ms, now);
        let end_time = unix_ms_to_instant(self.end_time_unix_ms, now);
        Sandbox {
            sandbox_id: self.sandbox_id,
            execution_id: self.execution_id,
            template_id: String::new(),
            build_id: String::new(),
            team_id: self.team_id,
            cluster_id: cluster_id.to_string(),
            node_id: node_id.to_string(),
            alias: String::new(),
            vcpu_count: 0,
            ram_mib: 0,
            total_disk_mib: 0,
            metadata: std::collections::HashMap::new(),
            auto_pause: false,
            allow_internet_access: true,
            state: SandboxState::Running,
            start_time,
            end_time,
            max_instance_length: end_time.saturating_duration_since(start_time),
        }
    }
}

impl From<crate::rpc::proto::SandboxListEntry> for RemoteSandbox {
    fn from(entry: crate::rpc::proto::SandboxListEntry) -> Self {
        Self {
            sandbox_id: entry.sandbox_id,
            execution_id: entry.execution_id,
            team_id: entry.team_id,
            start_time_unix_ms: entry.start_time_unix_ms,
            end_time_unix_ms: entry.end_time_unix_ms,
        }
    }
}

/// `std::time::Instant` has no epoch anchor, so a unix-millis timestamp
/// from the wire is converted relative to `now` rather than absolutely —
/// mirrors `Orchestrator::keep_alive_for`'s conversion the other way.
fn unix_ms_to_instant(unix_ms: i64, now: Instant) -> Instant {
    let now_unix_ms = chrono::Utc::now().timestamp_millis();
    let delta_ms = unix_ms - now_unix_ms;
    if delta_ms >= 0 {
        now + Duration::from_millis(delta_ms as u64)
    } else {
        now - Duration::from_millis((-delta_ms) as u64)
    }
}

/// The store's public contract (spec section 4.4).
pub struct SandboxStore {
    items: DashMap<String, Arc<Entry>>,
    pausing: DashMap<String, ()>,
    ttl_wheel: Mutex<TtlWheel>,
    insert_hooks: Vec<Arc<dyn InsertHook>>,
    delete_hooks: Vec<Arc<dyn DeleteHook>>,
    hook_timeout: Duration,
}

impl SandboxStore {
    pub fn new(hook_timeout: Duration) -> Self {
        Self {
            items: DashMap::new(),
            pausing: DashMap::new(),
            ttl_wheel: Mutex::new(TtlWheel::new()),
            insert_hooks: Vec::new(),
            delete_hooks: Vec::new(),
            hook_timeout,
        }
    }

    pub fn register_insert_hook(&mut self, hook: Arc<dyn InsertHook>) {
        self.insert_hooks.push(hook);
    }

    pub fn register_delete_hook(&mut self, hook: Arc<dyn DeleteHook>) {
        self.delete_hooks.push(hook);
    }

    /// Inserts a newly-placed sandbox and fires `onInsert` hooks. Rejects
    /// a duplicate id outright — `CreateSandbox` is responsible for
    /// de-duplicating starts-in-flight before calling this (spec section
    /// 4.6, step checking `AlreadyBeingStarted`).
    pub async fn add(&self, sandbox: Sandbox) -> CoreResult<()> {
        let sandbox_id = sandbox.sandbox_id.clone();
        if self.items.contains_key(&sandbox_id) {
            return Err(CoreError::AlreadyBeingStarted(sandbox_id));
        }
        let end_time = sandbox.end_time;
        let entry =
            Arc::new(Entry { sandbox: Mutex::new(sandbox), notify: Arc::new(Notify::new()) });
        self.items.insert(sandbox_id.clone(), entry.clone());
        self.ttl_wheel.lock().await.schedule(sandbox_id.clone(), end_time);

        let snapshot = entry.sandbox.lock().await.clone();
        for hook in &self.insert_hooks {
            if tokio::time::timeout(self.hook_timeout, hook.on_insert(&snapshot)).await.is_err() {
                warn!(sandbox_id = %sandbox_id, "onInsert hook timed out");
            }
        }
        Ok(())
    }

    pub async fn get(&self, sandbox_id: &str) -> CoreResult<Sandbox> {
        let entry = self
            .items
            .get(sandbox_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::SandboxNotFound(sandbox_id.to_string()))?;
        Ok(entry.sandbox.lock().await.clone())
    }

    /// Point-in-time copy of every tracked sandbox (spec section 4.4,
    /// `AllItems`). Used by placement scoring and the admin-facing node
    /// detail view; callers needing a single sandbox should prefer `get`.
    pub async fn all_items(&self) -> Vec<Sandbox> {
        let entries: Vec<Arc<Entry>> = self.items.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.sandbox.lock().await.clone());
        }
        out
    }

    /// Applies `mutate` to the sandbox under its own lock, matching the
    /// teacher's "fetch guard, mutate in place, drop guard" shape.
    pub async fn update<F>(&self, sandbox_id: &str, mutate: F) -> CoreResult<Sandbox>
    where
        F: FnOnce(&mut Sandbox),
    {
        let entry = self
            .items
            .get(sandbox_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::SandboxNotFound(sandbox_id.to_string()))?;
        let mut guard = entry.sandbox.lock().await;
        mutate(&mut guard);
        let updated = guard.clone();
        drop(guard);
        entry.notify.notify_waiters();
        Ok(updated)
    }

    /// Pushes a sandbox's TTL to `new_end_time` (spec section 4.6,
    /// `KeepAliveFor`). Unless `allow_shorter` is set, a `new_end_time`
    /// earlier than the current one is a no-op — returns `Ok(false)` without
    /// touching the TTL wheel, matching the invariant that `KeepAliveFor`
    /// never shortens a sandbox's life by default. Returns `Ok(true)` when
    /// the end time actually moved, so the caller knows whether it still
    /// needs to forward the new end time to the owning worker node.
    pub async fn extend_end_time(
        &self,
        sandbox_id: &str,
        new_end_time: Instant,
        allow_shorter: bool,
    ) -> CoreResult<bool> {
        let entry = self
            .items
            .get(sandbox_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::SandboxNotFound(sandbox_id.to_string()))?;
        let mut guard = entry.sandbox.lock().await;
        if !allow_shorter && new_end_time < guard.end_time {
            return Ok(false);
        }
        guard.end_time = new_end_time;
        drop(guard);
        entry.notify.notify_waiters();
        self.ttl_wheel.lock().await.schedule(sandbox_id.to_string(), new_end_time);
        Ok(true)
    }

    /// Removes a sandbox and fires `onDelete` hooks with `reason`
    /// (explicit delete, TTL expiry, eviction — spec section 4.8).
    pub async fn delete(&self, sandbox_id: &str, reason: &str) -> CoreResult<()> {
        let (_, entry) = self
            .items
            .remove(sandbox_id)
            .ok_or_else(|| CoreError::SandboxNotFound(sandbox_id.to_string()))?;
        self.pausing.remove(sandbox_id);
        self.ttl_wheel.lock().await.cancel(sandbox_id);

        let snapshot = entry.sandbox.lock().await.clone();
        entry.notify.notify_waiters();
        for hook in &self.delete_hooks {
            if tokio::time::timeout(self.hook_timeout, hook.on_delete(&snapshot, reason))
                .await
                .is_err()
            {
                warn!(sandbox_id = %sandbox_id, "onDelete hook timed out");
            }
        }
        debug!(sandbox_id = %sandbox_id, reason, "sandbox removed from store");
        Ok(())
    }

    /// Marks a sandbox as mid-pause so a concurrent `Delete` can tell the
    /// two operations apart (spec section 4.4, "pausing set").
    pub fn mark_as_pausing(&self, sandbox_id: &str) {
        self.pausing.insert(sandbox_id.to_string(), ());
    }

    pub fn unmark_as_pausing(&self, sandbox_id: &str) {
        self.pausing.remove(sandbox_id);
    }

    pub fn is_pausing(&self, sandbox_id: &str) -> bool {
        self.pausing.contains_key(sandbox_id)
    }

    /// Drains every sandbox whose TTL has elapsed as of `now`. Called once
    /// per reconciliation tick (spec section 4.7).
    pub async fn sync(&self, now: Instant) -> Vec<String> {
        self.ttl_wheel.lock().await.drain_expired(now)
    }

    /// Reconciles one node's worker-reported sandbox list against the
    /// store (spec section 4.4, `Sync(ctx, remoteInstances, nodeID)`;
    /// testable property #4). Any id the worker reports that the store
    /// doesn't know about yet is adopted — best-effort, since `List`
    /// doesn't carry every field a `Sandbox` record needs. Any in-store
    /// `Running` entry on this node the worker no longer reports is
    /// removed with reason `"sync"`: the worker has already forgotten it,
    /// so there's nothing left on that node to pause.
    pub async fn sync_node(&self, cluster_id: &str, node_id: &str, remote: Vec<RemoteSandbox>) {
        let remote_ids: HashSet<String> = remote.iter().map(|r| r.sandbox_id.clone()).collect();

        for r in remote {
            if self.items.contains_key(&r.sandbox_id) {
                continue;
            }
            let sandbox_id = r.sandbox_id.clone();
            let sandbox = r.into_sandbox(cluster_id, node_id);
            if let Err(err) = self.add(sandbox).await {
                warn!(sandbox_id = %sandbox_id, error = %err, "failed to adopt worker-reported sandbox");
            }
        }

        let entries: Vec<Arc<Entry>> = self.items.iter().map(|e| e.value().clone()).collect();
        let mut stale = Vec::new();
        for entry in &entries {
            let snapshot = entry.sandbox.lock().await.clone();
            if snapshot.cluster_id == cluster_id
                && snapshot.node_id == node_id
                && snapshot.state == SandboxState::Running
                && !remote_ids.contains(&snapshot.sandbox_id)
            {
                stale.push(snapshot.sandbox_id);
            }
        }
        for sandbox_id in stale {
            if let Err(err) = self.delete(&sandbox_id, "sync").await {
                warn!(sandbox_id = %sandbox_id, error = %err, "failed to remove sandbox absent from worker's list");
            }
        }
    }

    /// Team's currently-`Running` sandbox count, used by the reservation
    /// table to bound a team's cap by running sandboxes plus outstanding
    /// reservations together (spec section 4.4, testable property #2).
    pub async fn running_count_for_team(&self, team_id: &str) -> i64 {
        let entries: Vec<Arc<Entry>> = self.items.iter().map(|e| e.value().clone()).collect();
        let mut count = 0i64;
        for entry in &entries {
            let snapshot = entry.sandbox.lock().await;
            if snapshot.team_id == team_id && snapshot.state == SandboxState::Running {
                count += 1;
            }
        }
        count
    }

    /// Blocks until `sandbox_id` is no longer in the state given by
    /// `from`, or `timeout` elapses.
    pub async fn wait_for_state_change(
        &self,
        sandbox_id: &str,
        from: SandboxState,
        timeout: Duration,
    ) -> CoreResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let entry = self
                .items
                .get(sandbox_id)
                .map(|e| e.value().clone())
                .ok_or_else(|| CoreError::SandboxNotFound(sandbox_id.to_string()))?;
            if entry.sandbox.lock().await.state != from {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::Timeout(timeout));
            }
            let notified = entry.notify.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(CoreError::Timeout(timeout));
            }
        }
    }

    /// Blocks until `sandbox_id` is removed from the store entirely, or
    /// `timeout` elapses.
    pub async fn wait_for_stop(&self, sandbox_id: &str, timeout: Duration) -> CoreResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let entry = match self.items.get(sandbox_id) {
                Some(e) => e.value().clone(),
                None => return Ok(()),
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::Timeout(timeout));
            }
            let notified = entry.notify.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(CoreError::Timeout(timeout));
            }
        }
    }

    pub fn pausing_ids(&self) -> HashSet<String> {
        self.pausing.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_sandbox(id: &str, end_in: Duration) -> Sandbox {
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
            ram_mib: 512,
            total_disk_mib: 1024,
            metadata: HashMap::new(),
            auto_pause: false,
            allow_internet_access: true,
            state: SandboxState::Running,
            start_time: Instant::now(),
            end_time: Instant::now() + end_in,
            max_instance_length: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let store = SandboxStore::new(Duration::from_secs(1));
        store.add(test_sandbox("sbx-1", Duration::from_secs(60))).await.unwrap();
        let sandbox = store.get("sbx-1").await.unwrap();
        assert_eq!(sandbox.sandbox_id, "sbx-1");
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let store = SandboxStore::new(Duration::from_secs(1));
        store.add(test_sandbox("sbx-1", Duration::from_secs(60))).await.unwrap();
        let second = store.add(test_sandbox("sbx-1", Duration::from_secs(60))).await;
        assert!(matches!(second, Err(CoreError::AlreadyBeingStarted(_))));
    }

    #[tokio::test]
    async fn delete_removes_and_cancels_ttl() {
        let store = SandboxStore::new(Duration::from_secs(1));
        store.add(test_sandbox("sbx-1", Duration::from_secs(60))).await.unwrap();
        store.delete("sbx-1", "explicit").await.unwrap();
        assert!(matches!(store.get("sbx-1").await, Err(CoreError::SandboxNotFound(_))));
        assert!(store.sync(Instant::now() + Duration::from_secs(120)).await.is_empty());
    }

    #[tokio::test]
    async fn sync_drains_only_expired_sandboxes() {
        let store = SandboxStore::new(Duration::from_secs(1));
        store.add(test_sandbox("short", Duration::from_millis(10))).await.unwrap();
        store.add(test_sandbox("long", Duration::from_secs(60))).await.unwrap();
        let expired = store.sync(Instant::now() + Duration::from_millis(50)).await;
        assert_eq!(expired, vec!["short".to_string()]);
    }

    #[tokio::test]
    async fn mark_and_unmark_pausing_round_trips() {
        let store = SandboxStore::new(Duration::from_secs(1));
        store.add(test_sandbox("sbx-1", Duration::from_secs(60))).await.unwrap();
        assert!(!store.is_pausing("sbx-1"));
        store.mark_as_pausing("sbx-1");
        assert!(store.is_pausing("sbx-1"));
        store.unmark_as_pausing("sbx-1");
        assert!(!store.is_pausing("sbx-1"));
    }

    #[tokio::test]
    async fn wait_for_state_change_returns_once_state_differs() {
        let store = Arc::new(SandboxStore::new(Duration::from_secs(1)));
        store.add(test_sandbox("sbx-1", Duration::from_secs(60))).await.unwrap();

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            waiter_store
                .wait_for_state_change("sbx-1", SandboxState::Running, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.update("sbx-1", |s| s.state = SandboxState::Pausing).await.unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_for_stop_returns_once_deleted() {
        let store = Arc::new(SandboxStore::new(Duration::from_secs(1)));
        store.add(test_sandbox("sbx-1", Duration::from_secs(60))).await.unwrap();

        let waiter_store = store.clone();
        let waiter =
            tokio::spawn(async move { waiter_store.wait_for_stop("sbx-1", Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.delete("sbx-1", "explicit").await.unwrap();

        waiter.await.unwrap().unwrap();
    }
}
