//! Sandbox record and sandbox store (spec section 4.4).

pub mod reservation;
pub mod store;
pub mod ttl_wheel;

use std::collections::HashMap;
use std::time::Instant;

pub use reservation::{Reservation, ReservationTable};
pub use store::{RemoteSandbox, SandboxStore};

/// State machine for a tracked sandbox (spec section 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Running,
    Snapshotting,
    Pausing,
    Evicting,
}

/// A sandbox the store is tracking. Mirrors the attributes carried on the
/// wire (`rpc::proto::SandboxConfig`) plus the runtime bookkeeping the
/// store itself owns (state, placement, timing).
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub sandbox_id: String,
    pub execution_id: String,
    pub template_id: String,
    pub build_id: String,
    pub team_id: String,
    pub cluster_id: String,
    pub node_id: String,
    pub alias: String,
    pub vcpu_count: i64,
    pub ram_mib: i64,
    pub total_disk_mib: i64,
    pub metadata: HashMap<String, String>,
    pub auto_pause: bool,
    pub allow_internet_access: bool,
    pub state: SandboxState,
    pub start_time: Instant,
    pub end_time: Instant,
    /// Duration ceiling from the sandbox's tier (spec section 3). `end_time`
    /// never exceeds `start_time + max_instance_length`; `KeepAliveFor`
    /// clamps against it directly rather than against the current
    /// `end_time`.
    pub max_instance_length: std::time::Duration,
}

impl Sandbox {
    /// `start + maxInstanceLength` has been reached (spec section 7,
    /// `MaxUptimeReached`).
    pub fn is_past_end_time(&self, now: Instant) -> bool {
        now >= self.end_time
    }

    /// `now - start > maxInstanceLength` (spec section 4.6, `KeepAliveFor`'s
    /// first rejection check — distinct from `is_past_end_time`, which
    /// tracks the current TTL rather than the tier ceiling).
    pub fn exceeds_max_instance_length(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start_time) > self.max_instance_length
    }
}
