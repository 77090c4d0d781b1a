//! External collaborator interfaces (spec section 6, "EXTERNAL INTERFACES").
//!
//! The core treats its persistent store, analytics sink, and DNS/routing
//! catalog as pure externally-supplied dependencies — it never owns their
//! storage. The traits below are the contract; the JSONL-backed
//! implementations are a toy reference, grounded in the teacher's
//! `AuditLog` (fire-and-forget JSONL writer, `OnceLock`-backed global
//! accessor) — useful in tests and as a starting point for an embedder, not
//! a production persistence layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};

/// Template/snapshot metadata persistence. Out of scope to implement for
/// real (spec section 1) — the core only needs to read and write through
/// this trait.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_snapshot(&self, template_id: &str, build_id: &str) -> CoreResult<()>;
    async fn load_snapshot(&self, template_id: &str) -> CoreResult<Option<String>>;
}

/// Fire-and-forget telemetry sink. Delivery is best-effort; a failure here
/// must never fail the sandbox operation it's attached to (spec section
/// 4.8, lifecycle hooks).
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record(&self, event: AnalyticsEvent);
}

/// DNS/routing catalog mapping a sandbox id to its current node address.
#[async_trait]
pub trait DnsCatalog: Send + Sync {
    async fn add(&self, sandbox_id: &str, node_ip: &str) -> CoreResult<()>;
    async fn remove(&self, sandbox_id: &str) -> CoreResult<()>;
}

/// One orchestrator-node record yielded by a discovery source (spec section
/// 6, "Discovery interfaces").
#[derive(Debug, Clone)]
pub struct AdvertisedNode {
    pub node_id: String,
    pub address: String,
    pub service_instance_id: String,
}

/// The local cluster's own node list, one of the two discovery sources the
/// reconciliation loop unions on every tick (spec section 4.7). The other
/// source, remote clusters' advertised orchestrator instances, is already
/// modeled in-process by `ClusterRegistry` and needs no external seam.
#[async_trait]
pub trait NodeDiscovery: Send + Sync {
    async fn discover(&self) -> CoreResult<Vec<AdvertisedNode>>;
}

/// Events recorded by [`AnalyticsSink`] at the points the lifecycle hooks
/// fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    SandboxCreated { sandbox_id: String, team_id: String, node_id: String },
    SandboxPaused { sandbox_id: String },
    SandboxDeleted { sandbox_id: String, reason: String },
}

/// A recorded event with the timestamp it was observed at, the shape
/// `JsonlCollaborators` actually writes to disk — mirrors the teacher's
/// `AuditEntry` (timestamp plus the tagged event, flattened into one
/// JSON object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub recorded_at: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub event: AnalyticsEvent,
}

/// JSONL-backed reference implementation of all three collaborator traits,
/// grounded directly in the teacher's `AuditLog`: append-only file, a
/// `Mutex` around the write path since multiple hooks can fire
/// concurrently, best-effort (errors are swallowed for `AnalyticsSink`,
/// surfaced for `SnapshotStore`/`DnsCatalog` since those are load-bearing).
pub struct JsonlCollaborators {
    path: Mutex<PathBuf>,
}

impl JsonlCollaborators {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Mutex::new(path) }
    }

    fn append(&self, line: &str) -> CoreResult<()> {
        let path = self.path.lock().expect("jsonl collaborators mutex poisoned");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&*path)
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        writeln!(file, "{}", line).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))
    }

    fn read_lines(&self) -> CoreResult<Vec<String>> {
        let path = self.path.lock().expect("jsonl collaborators mutex poisoned");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&*path).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        BufReader::new(file)
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    template_id: String,
    build_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DnsRecord {
    sandbox_id: String,
    node_ip: Option<String>,
}

#[async_trait]
impl SnapshotStore for JsonlCollaborators {
    async fn save_snapshot(&self, template_id: &str, build_id: &str) -> CoreResult<()> {
        let record = SnapshotRecord { template_id: template_id.to_string(), build_id: build_id.to_string() };
        let line = serde_json::to_string(&record).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        self.append(&line)
    }

    async fn load_snapshot(&self, template_id: &str) -> CoreResult<Option<String>> {
        let lines = self.read_lines()?;
        for line in lines.into_iter().rev() {
            if let Ok(record) = serde_json::from_str::<SnapshotRecord>(&line) {
                if record.template_id == template_id {
                    return Ok(Some(record.build_id));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl AnalyticsSink for JsonlCollaborators {
    async fn record(&self, event: AnalyticsEvent) {
        let record = AnalyticsRecord { recorded_at: chrono::Utc::now(), event };
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = self.append(&line);
        }
    }
}

#[async_trait]
impl DnsCatalog for JsonlCollaborators {
    async fn add(&self, sandbox_id: &str, node_ip: &str) -> CoreResult<()> {
        let record = DnsRecord { sandbox_id: sandbox_id.to_string(), node_ip: Some(node_ip.to_string()) };
        let line = serde_json::to_string(&record).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        self.append(&line)
    }

    async fn remove(&self, sandbox_id: &str) -> CoreResult<()> {
        let record = DnsRecord { sandbox_id: sandbox_id.to_string(), node_ip: None };
        let line = serde_json::to_string(&record).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        self.append(&line)
    }
}

/// No local nodes by default — an embedder wiring in a real local cluster
/// (e.g. a Nomad/k8s node list) provides its own `NodeDiscovery` impl.
#[async_trait]
impl NodeDiscovery for JsonlCollaborators {
    async fn discover(&self) -> CoreResult<Vec<AdvertisedNode>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_round_trips_through_jsonl() {
        let dir = tempdir().unwrap();
        let store = JsonlCollaborators::new(dir.path().join("snapshots.jsonl"));
        store.save_snapshot("tmpl-1", "build-1").await.unwrap();
        store.save_snapshot("tmpl-1", "build-2").await.unwrap();
        let latest = store.load_snapshot("tmpl-1").await.unwrap();
        assert_eq!(latest, Some("build-2".to_string()));
    }

    #[tokio::test]
    async fn unknown_template_returns_none() {
        let dir = tempdir().unwrap();
        let store = JsonlCollaborators::new(dir.path().join("snapshots.jsonl"));
        assert_eq!(store.load_snapshot("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn analytics_never_panics_on_write() {
        let dir = tempdir().unwrap();
        let sink = JsonlCollaborators::new(dir.path().join("analytics.jsonl"));
        sink.record(AnalyticsEvent::SandboxCreated {
            sandbox_id: "sbx-1".into(),
            team_id: "team-1".into(),
            node_id: "node-1".into(),
        })
        .await;
    }

    #[tokio::test]
    async fn dns_add_then_remove_appends_both_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dns.jsonl");
        let catalog = JsonlCollaborators::new(path.clone());
        catalog.add("sbx-1", "10.0.0.5").await.unwrap();
        catalog.remove("sbx-1").await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
