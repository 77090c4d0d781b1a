//! Reservation table (spec section 4.4 / section 3's "Reservation"):
//! per-(team, sandbox) booking, keyed by team id with a reverse index of
//! reserved sandbox ids, that rejects two racing problems atomically in
//! one call — a team over its concurrency cap (counting already-running
//! sandboxes plus outstanding reservations, not reservations alone) and a
//! duplicate start for a sandbox id already being created.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::error::{CoreError, CoreResult};

struct TeamReservations {
    sandbox_ids: DashSet<String>,
}

/// A booked slot against a team's concurrency limit, tied to one sandbox
/// id. Releases the slot automatically when dropped — callers hold this
/// for the lifetime of the `CreateSandbox` call and let it fall out of
/// scope on both the success and failure paths.
pub struct Reservation {
    sandbox_id: String,
    team: Arc<TeamReservations>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.team.sandbox_ids.remove(&self.sandbox_id);
    }
}

/// Reservations grouped by team id.
#[derive(Default)]
pub struct ReservationTable {
    teams: DashMap<String, Arc<TeamReservations>>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self { teams: DashMap::new() }
    }

    /// Books `sandbox_id` against `team_id`'s cap. `running_count` is the
    /// team's already-running sandbox count, sourced from the sandbox
    /// store — the cap bounds running sandboxes plus outstanding
    /// reservations together (spec section 4.4, testable property #2),
    /// not reservations alone. Rejects `sandbox_id` with
    /// `AlreadyBeingStarted` if it's already reserved for this team,
    /// checked atomically with the cap so two concurrent creates for the
    /// same id can't both pass (spec section 3/4.4).
    pub fn reserve(
        &self,
        team_id: &str,
        sandbox_id: &str,
        limit: i64,
        running_count: i64,
    ) -> CoreResult<Reservation> {
        let team = self
            .teams
            .entry(team_id.to_string())
            .or_insert_with(|| Arc::new(TeamReservations { sandbox_ids: DashSet::new() }))
            .clone();

        if !team.sandbox_ids.insert(sandbox_id.to_string()) {
            return Err(CoreError::AlreadyBeingStarted(sandbox_id.to_string()));
        }

        let active = running_count.max(0) as usize + team.sandbox_ids.len();
        let cap = limit.max(0) as usize;
        if active > cap {
            team.sandbox_ids.remove(sandbox_id);
            return Err(CoreError::LimitExceeded { team_id: team_id.to_string(), limit });
        }

        Ok(Reservation { sandbox_id: sandbox_id.to_string(), team })
    }

    /// Number of sandbox ids currently reserved (not yet committed to the
    /// store) for `team_id` — used by admin-facing diagnostics.
    pub fn reserved_count(&self, team_id: &str) -> usize {
        self.teams.get(team_id).map(|t| t.sandbox_ids.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_fails_once_reservations_reach_the_limit() {
        let table = ReservationTable::new();
        let _first = table.reserve("team-1", "sbx-1", 1, 0).unwrap();
        let second = table.reserve("team-1", "sbx-2", 1, 0);
        assert!(matches!(second, Err(CoreError::LimitExceeded { .. })));
    }

    #[test]
    fn reserve_counts_already_running_sandboxes_toward_the_cap() {
        // cap=1 with one sandbox already running must reject a fresh
        // reservation even though nothing is reserved yet.
        let table = ReservationTable::new();
        let result = table.reserve("team-1", "sbx-1", 1, 1);
        assert!(matches!(result, Err(CoreError::LimitExceeded { .. })));
    }

    #[test]
    fn dropping_a_reservation_frees_the_slot() {
        let table = ReservationTable::new();
        {
            let _r = table.reserve("team-1", "sbx-1", 1, 0).unwrap();
            assert_eq!(table.reserved_count("team-1"), 1);
        }
        assert_eq!(table.reserved_count("team-1"), 0);
    }

    #[test]
    fn reserving_the_same_sandbox_id_twice_is_rejected() {
        let table = ReservationTable::new();
        let _first = table.reserve("team-1", "sbx-1", 5, 0).unwrap();
        let second = table.reserve("team-1", "sbx-1", 5, 0);
        assert!(matches!(second, Err(CoreError::AlreadyBeingStarted(_))));
    }

    #[test]
    fn unconfigured_team_gets_the_requested_limit() {
        let table = ReservationTable::new();
        let _r = table.reserve("brand-new-team", "sbx-1", 5, 0).unwrap();
        assert_eq!(table.reserved_count("brand-new-team"), 1);
    }
}
