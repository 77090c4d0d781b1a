//! The core's typed error taxonomy.
//!
//! Every operation exposed to callers (spec section 6's API table) returns
//! `Result<T, CoreError>` so an embedding API layer can match on kind and
//! map to its own status codes, the way `sdk/rust/src/error.rs` maps SDK
//! errors onto HTTP statuses.

use std::time::Duration;

/// Error taxonomy for the orchestration core (see SPEC_FULL.md section 7).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Tenant has reached its concurrent-instance cap.
    #[error("team {team_id} has reached its concurrent sandbox limit ({limit})")]
    LimitExceeded { team_id: String, limit: i64 },

    /// Same sandbox id already has a start in flight.
    #[error("sandbox {0} is already being started")]
    AlreadyBeingStarted(String),

    /// A state-transition precondition wasn't met (e.g. pause/snapshot on a
    /// non-running sandbox).
    #[error("sandbox {0} is not running")]
    NotRunning(String),

    /// A snapshot operation was requested while one was already in flight.
    #[error("sandbox {0} already has a snapshot in progress")]
    SnapshotInProgress(String),

    /// Sandbox id unknown to the store.
    #[error("sandbox {0} not found")]
    SandboxNotFound(String),

    /// Node id unknown to the pool.
    #[error("node {0} not found")]
    NodeNotFound(String),

    /// Cluster id unknown to the registry.
    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    /// The sandbox has reached `start + maxInstanceLength`.
    #[error("sandbox {0} has reached its maximum uptime")]
    MaxUptimeReached(String),

    /// Build id / firecracker version did not map to a known feature set.
    #[error("invalid build info: {0}")]
    BuildInfoInvalid(String),

    /// No node was eligible within the placement budget.
    #[error("no node available for placement after {attempts} attempts")]
    PlacementExhausted { attempts: u32 },

    /// The parent context/deadline expired before placement or the RPC
    /// completed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's context was cancelled.
    #[error("operation canceled")]
    Canceled,

    /// Worker reported `ResourceExhausted` on a Pause call. Not fatal to the
    /// node and never retried automatically.
    #[error("pause queue exhausted on node {0}")]
    PauseQueueExhausted(String),

    /// Build-cache insertion on the node failed after a successful create.
    #[error("failed to record build {build_id} on node {node_id}")]
    CacheAddFailed { node_id: String, build_id: String },

    /// Transient RPC failure surfaced after the retry budget was spent.
    #[error("worker RPC unavailable: {0}")]
    Unavailable(String),

    /// Snapshot/template persistence collaborator reported a typed error.
    #[error("snapshot store error: {0}")]
    SnapshotStore(String),

    /// Catch-all for unexpected failures that don't fit the taxonomy above.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Maps a tonic transport/RPC status to the core's taxonomy. Used by the
    /// worker RPC client (section 4.1) to translate gRPC failure kinds into
    /// the vocabulary the rest of the core reasons about.
    pub fn from_status(status: &tonic::Status, sandbox_id: &str) -> Self {
        use tonic::Code;
        match status.code() {
            Code::NotFound => CoreError::SandboxNotFound(sandbox_id.to_string()),
            Code::ResourceExhausted => CoreError::PauseQueueExhausted(sandbox_id.to_string()),
            Code::Cancelled => CoreError::Canceled,
            Code::DeadlineExceeded => CoreError::Timeout(Duration::default()),
            Code::Unavailable => CoreError::Unavailable(status.message().to_string()),
            _ => CoreError::Internal(anyhow::anyhow!(
                "worker rpc failed ({:?}): {}",
                status.code(),
                status.message()
            )),
        }
    }

    /// True for failures the placement/reconciliation layers should retry
    /// internally rather than surface immediately (spec section 7,
    /// "Transient RPC").
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Unavailable(_) | CoreError::Timeout(_))
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
