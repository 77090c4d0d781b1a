//! TTL wheel (spec section 9): schedules sandbox expirations and fires a
//! delete hook when a sandbox's end time elapses, without scanning the
//! whole store on every reconciliation tick.
//!
//! Implemented as a min-heap ordered by expiry instant, with lazy deletion:
//! `cancel`/`reschedule` bump a per-id generation counter instead of
//! removing from the heap directly (a `BinaryHeap` has no efficient
//! arbitrary removal). A popped entry is only acted on if its generation
//! still matches the live one, giving amortized O(log n) schedule and
//! cancel at the cost of occasionally popping a stale entry.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

struct Entry {
    expires_at: Instant,
    sandbox_id: String,
    generation: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expires_at.cmp(&other.expires_at)
    }
}

#[derive(Default)]
pub struct TtlWheel {
    heap: BinaryHeap<Reverse<Entry>>,
    generations: HashMap<String, u64>,
}

impl TtlWheel {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), generations: HashMap::new() }
    }

    /// Schedules (or reschedules, via `ExtendEndTime`) `sandbox_id` to
    /// expire at `expires_at`. Any entry previously scheduled for this id
    /// is implicitly invalidated.
    pub fn schedule(&mut self, sandbox_id: impl Into<String>, expires_at: Instant) {
        let sandbox_id = sandbox_id.into();
        let generation = self.generations.entry(sandbox_id.clone()).or_insert(0);
        *generation += 1;
        self.heap.push(Reverse(Entry { expires_at, sandbox_id: sandbox_id.clone(), generation: *generation }));
    }

    /// Invalidates any pending expiration for `sandbox_id` (spec section
    /// 4.4, `Delete`/`MarkAsPausing`). The stale heap entry is skipped
    /// lazily the next time it would be popped.
    pub fn cancel(&mut self, sandbox_id: &str) {
        if let Some(generation) = self.generations.get_mut(sandbox_id) {
            *generation += 1;
        }
    }

    /// Pops every entry whose expiry is at or before `now` and is still
    /// live (not superseded by a later `schedule`/`cancel`).
    pub fn drain_expired(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.expires_at > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            let live = self.generations.get(&entry.sandbox_id).copied() == Some(entry.generation);
            if live {
                expired.push(entry.sandbox_id);
            }
        }
        expired
    }

    pub fn len_live(&self) -> usize {
        self.generations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expired_entries_drain_in_order() {
        let mut wheel = TtlWheel::new();
        let base = Instant::now();
        wheel.schedule("a", base);
        wheel.schedule("b", base + Duration::from_secs(1));
        let drained = wheel.drain_expired(base + Duration::from_millis(500));
        assert_eq!(drained, vec!["a".to_string()]);
        let drained = wheel.drain_expired(base + Duration::from_secs(2));
        assert_eq!(drained, vec!["b".to_string()]);
    }

    #[test]
    fn cancel_suppresses_a_pending_expiration() {
        let mut wheel = TtlWheel::new();
        let base = Instant::now();
        wheel.schedule("a", base);
        wheel.cancel("a");
        assert!(wheel.drain_expired(base).is_empty());
    }

    #[test]
    fn reschedule_supersedes_the_earlier_entry() {
        let mut wheel = TtlWheel::new();
        let base = Instant::now();
        wheel.schedule("a", base);
        wheel.schedule("a", base + Duration::from_secs(10));
        assert!(wheel.drain_expired(base + Duration::from_secs(1)).is_empty());
        assert_eq!(wheel.drain_expired(base + Duration::from_secs(11)), vec!["a".to_string()]);
    }
}
