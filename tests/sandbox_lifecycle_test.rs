//! Black-box lifecycle tests against the sandbox store, reservation
//! table, and node pool in combination — the pieces that don't require a
//! live worker connection (spec section 8's store/placement invariants).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sandfleet_core::error::CoreError;
use sandfleet_core::node::pool::NodePool;
use sandfleet_core::node::Node;
use sandfleet_core::sandbox::{ReservationTable, Sandbox, SandboxState, SandboxStore};

fn sandbox(id: &str, team: &str, end_in: Duration) -> Sandbox {
    Sandbox {
        sandbox_id: id.to_string(),
        execution_id: "exec".to_string(),
        template_id: "tmpl".to_string(),
        build_id: "build".to_string(),
        team_id: team.to_string(),
        cluster_id: "c1".to_string(),
        node_id: "n1".to_string(),
        alias: String::new(),
        vcpu_count: 1,
        ram_mib: 256,
        total_disk_mib: 512,
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
async fn reservation_caps_concurrent_sandboxes_per_team() {
    let reservations = ReservationTable::new();

    let first = reservations.reserve("team-a", "sbx-1", 2, 0).unwrap();
    let second = reservations.reserve("team-a", "sbx-2", 2, 0).unwrap();
    let third = reservations.reserve("team-a", "sbx-3", 2, 0);
    assert!(matches!(third, Err(CoreError::LimitExceeded { .. })));

    drop(first);
    let fourth = reservations.reserve("team-a", "sbx-3", 2, 0);
    assert!(fourth.is_ok());
    drop(second);
    drop(fourth);
}

#[tokio::test]
async fn reservation_counts_already_running_sandboxes_toward_the_cap() {
    let reservations = ReservationTable::new();
    // A team at cap=1 with one sandbox already running must be rejected
    // even though nothing is reserved yet (spec section 4.4, testable
    // property #2).
    let result = reservations.reserve("team-a", "sbx-1", 1, 1);
    assert!(matches!(result, Err(CoreError::LimitExceeded { .. })));
}

#[tokio::test]
async fn expired_sandboxes_are_reaped_by_store_sync_not_by_scanning() {
    let store = SandboxStore::new(Duration::from_millis(50));
    store.add(sandbox("short-lived", "team-a", Duration::from_millis(10))).await.unwrap();
    store.add(sandbox("long-lived", "team-a", Duration::from_secs(60))).await.unwrap();

    let reaped = store.sync(Instant::now() + Duration::from_millis(30)).await;
    assert_eq!(reaped, vec!["short-lived".to_string()]);

    // The sandbox is still addressable until the caller actually deletes
    // it -- `sync` only reports expirations, it doesn't remove entries.
    assert!(store.get("short-lived").await.is_ok());
    assert!(store.get("long-lived").await.is_ok());
}

#[tokio::test]
async fn pausing_a_sandbox_is_visible_to_a_concurrent_reader() {
    let store = Arc::new(SandboxStore::new(Duration::from_millis(50)));
    store.add(sandbox("sbx-1", "team-a", Duration::from_secs(60))).await.unwrap();

    assert!(!store.is_pausing("sbx-1"));
    store.mark_as_pausing("sbx-1");
    assert!(store.is_pausing("sbx-1"));

    let reader_store = store.clone();
    let still_pausing = tokio::spawn(async move { reader_store.is_pausing("sbx-1") }).await.unwrap();
    assert!(still_pausing);
}

#[tokio::test]
async fn node_pool_lookup_by_short_id_disambiguates_within_a_cluster() {
    let pool = NodePool::new();
    pool.insert(Arc::new(Node::new("c1", "node-aaa111", "http://127.0.0.1:0", "", HashMap::new()).unwrap()));
    pool.insert(Arc::new(Node::new("c2", "node-aaa222", "http://127.0.0.1:0", "", HashMap::new()).unwrap()));

    let found = pool.get_by_cluster_and_short_id("c1", "node-aaa").unwrap();
    assert_eq!(found.node_id, "node-aaa111");

    let not_in_this_cluster = pool.get_by_cluster_and_short_id("c1", "node-aaa222");
    assert!(not_in_this_cluster.is_err());
}

#[tokio::test]
async fn extend_end_time_reschedules_rather_than_duplicates_the_ttl_entry() {
    let store = SandboxStore::new(Duration::from_millis(50));
    store.add(sandbox("sbx-1", "team-a", Duration::from_millis(10))).await.unwrap();

    store.extend_end_time("sbx-1", Instant::now() + Duration::from_secs(60), false).await.unwrap();

    // Had the original short TTL still been live, this would have reaped it.
    let reaped = store.sync(Instant::now() + Duration::from_millis(50)).await;
    assert!(reaped.is_empty());
}

#[tokio::test]
async fn extend_end_time_without_allow_shorter_ignores_an_earlier_deadline() {
    let store = SandboxStore::new(Duration::from_millis(50));
    store.add(sandbox("sbx-1", "team-a", Duration::from_secs(60))).await.unwrap();

    let moved = store
        .extend_end_time("sbx-1", Instant::now() + Duration::from_millis(10), false)
        .await
        .unwrap();
    assert!(!moved);

    // The original 60s TTL is still in force.
    let reaped = store.sync(Instant::now() + Duration::from_millis(50)).await;
    assert!(reaped.is_empty());
}
