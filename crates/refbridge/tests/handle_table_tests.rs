//! Tests for the handle table: lifecycle, session scoping and both eviction policies.
//!
//! Time-dependent tests drive a `ManualClock` so they never sleep on the TTL itself.

use std::{
    collections::HashSet,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use pretty_assertions::assert_eq;
use refbridge::{
    BridgeConfig, BridgeError, ErrorKind, EvictionPolicy, EvictionWorker, HandleTable, ManualClock, PruneReport, Value,
};

fn table_with_clock(ttl: Option<Duration>, max_size: Option<usize>) -> (Arc<HandleTable>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let table = Arc::new(HandleTable::with_clock(EvictionPolicy::new(ttl, max_size), clock.clone()));
    (table, clock)
}

// =============================================================================
// Store / resolve / release
// =============================================================================

#[test]
fn store_then_resolve_returns_the_same_value() {
    let table = HandleTable::new(EvictionPolicy::default());
    let list = Value::list(vec![Value::Int(1)]);
    let id = table.store("s1", list.clone());

    assert_eq!(id.len(), 32, "ids are simple-form uuids");
    let resolved = table.resolve("s1", &id).unwrap();
    assert!(resolved.is(&list), "resolve must hand back the parked object itself");
}

#[test]
fn ids_are_unique() {
    let table = HandleTable::new(EvictionPolicy::default());
    let ids: HashSet<String> = (0..200).map(|i| table.store("s", Value::Int(i))).collect();
    assert_eq!(ids.len(), 200);
}

#[test]
fn unknown_id_is_recoverable_not_found() {
    let table = HandleTable::new(EvictionPolicy::default());
    let err = table.resolve("s1", "nope").unwrap_err();
    assert_eq!(err, BridgeError::not_found("s1", "nope"));
    assert_eq!(err.kind(), ErrorKind::ReferenceNotFound);
    assert!(err.is_recoverable());
}

#[test]
fn resolve_is_scoped_to_the_owning_session() {
    let table = HandleTable::new(EvictionPolicy::default());
    let id = table.store("owner", Value::str("secret"));
    assert!(matches!(
        table.resolve("intruder", &id),
        Err(BridgeError::ReferenceNotFound { .. })
    ));
    assert_eq!(table.resolve("owner", &id).unwrap(), Value::str("secret"));
}

#[test]
fn release_is_idempotent() {
    let table = HandleTable::new(EvictionPolicy::default());
    let id = table.store("s", Value::None);
    assert!(table.release("s", &id));
    assert!(!table.release("s", &id));
    assert!(table.resolve("s", &id).is_err());
    assert!(table.is_empty());
}

#[test]
fn release_session_only_touches_that_session() {
    let table = HandleTable::new(EvictionPolicy::default());
    for i in 0..3 {
        table.store("a", Value::Int(i));
    }
    let kept = table.store("b", Value::Int(99));

    assert_eq!(table.sessions(), vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(table.session_len("a"), 3);
    assert_eq!(table.release_session("a"), 3);
    assert_eq!(table.release_session("a"), 0);
    assert_eq!(table.session_len("a"), 0);
    assert_eq!(table.sessions(), vec!["b".to_owned()]);
    assert_eq!(table.resolve("b", &kept).unwrap(), Value::Int(99));
    assert_eq!(table.stats().released, 3);
}

// =============================================================================
// TTL
// =============================================================================

#[test]
fn idle_handle_expires_after_ttl() {
    let (table, clock) = table_with_clock(Some(Duration::from_secs(1)), None);
    let id = table.store("s", Value::Int(1));

    clock.advance(Duration::from_millis(1500));
    assert!(!table.contains("s", &id));
    assert!(matches!(table.resolve("s", &id), Err(BridgeError::ReferenceNotFound { .. })));
    assert_eq!(table.stats().expired, 1);
    assert!(table.is_empty(), "lazy expiry removes the entry");
}

#[test]
fn exactly_ttl_is_still_alive() {
    let (table, clock) = table_with_clock(Some(Duration::from_secs(1)), None);
    let id = table.store("s", Value::Int(1));
    clock.advance(Duration::from_secs(1));
    assert!(table.resolve("s", &id).is_ok());
}

#[test]
fn access_refreshes_lifetime() {
    let (table, clock) = table_with_clock(Some(Duration::from_secs(1)), None);
    let id = table.store("s", Value::Int(1));

    clock.advance(Duration::from_millis(800));
    assert!(table.resolve("s", &id).is_ok());
    clock.advance(Duration::from_millis(800));
    assert!(table.resolve("s", &id).is_ok(), "the first resolve reset the idle timer");
    assert_eq!(table.age("s", &id), Some(Duration::from_millis(1600)));
}

#[test]
fn contains_does_not_refresh() {
    let (table, clock) = table_with_clock(Some(Duration::from_secs(1)), None);
    let id = table.store("s", Value::Int(1));

    clock.advance(Duration::from_millis(800));
    assert!(table.contains("s", &id));
    clock.advance(Duration::from_millis(800));
    assert!(!table.contains("s", &id));
}

#[test]
fn disabled_ttl_never_expires() {
    let (table, clock) = table_with_clock(None, None);
    let id = table.store("s", Value::Int(1));
    clock.advance(Duration::from_secs(365 * 24 * 3600));
    assert_eq!(table.prune(), PruneReport::default());
    assert!(table.resolve("s", &id).is_ok());
}

#[test]
fn prune_reports_expired_entries() {
    let (table, clock) = table_with_clock(Some(Duration::from_secs(10)), None);
    table.store("s", Value::Int(1));
    table.store("s", Value::Int(2));
    clock.advance(Duration::from_secs(5));
    let fresh = table.store("s", Value::Int(3));
    clock.advance(Duration::from_secs(6));

    assert_eq!(table.prune(), PruneReport { expired: 2, evicted: 0 });
    assert_eq!(table.len(), 1);
    assert!(table.contains("s", &fresh));
}

#[test]
fn store_prunes_expired_entries() {
    let (table, clock) = table_with_clock(Some(Duration::from_secs(1)), None);
    table.store("s", Value::Int(1));
    clock.advance(Duration::from_secs(2));
    table.store("s", Value::Int(2));
    assert_eq!(table.len(), 1);
}

// =============================================================================
// Capacity
// =============================================================================

#[test]
fn storing_past_capacity_evicts_the_oldest() {
    let table = HandleTable::new(EvictionPolicy::new(None, Some(3)));
    let ids: Vec<String> = (0..4).map(|i| table.store("s", Value::Int(i))).collect();

    assert_eq!(table.len(), 3);
    assert!(!table.contains("s", &ids[0]));
    for id in &ids[1..] {
        assert!(table.contains("s", id));
    }
    assert_eq!(table.stats().evicted, 1);
}

#[test]
fn capacity_eviction_follows_access_order() {
    let table = HandleTable::new(EvictionPolicy::new(None, Some(3)));
    let a = table.store("s", Value::str("a"));
    let b = table.store("s", Value::str("b"));
    let c = table.store("s", Value::str("c"));

    table.resolve("s", &a).unwrap();
    let d = table.store("s", Value::str("d"));

    assert!(!table.contains("s", &b), "b is the least recently accessed");
    for id in [&a, &c, &d] {
        assert!(table.contains("s", id));
    }
}

#[test]
fn capacity_spans_sessions() {
    let table = HandleTable::new(EvictionPolicy::new(None, Some(2)));
    let first = table.store("a", Value::Int(1));
    table.store("b", Value::Int(2));
    table.store("c", Value::Int(3));
    assert_eq!(table.len(), 2);
    assert!(!table.contains("a", &first));
    assert_eq!(table.sessions(), vec!["b".to_owned(), "c".to_owned()]);
}

#[test]
fn policy_from_config() {
    let config = BridgeConfig::new().ref_ttl_seconds(0.0).ref_table_max_size(0);
    assert_eq!(EvictionPolicy::from_config(&config), EvictionPolicy::new(None, None));

    let config = BridgeConfig::new().ref_ttl_seconds(2.5).ref_table_max_size(7);
    assert_eq!(
        EvictionPolicy::from_config(&config),
        EvictionPolicy::new(Some(Duration::from_millis(2500)), Some(7))
    );
}

#[test]
fn stats_track_every_removal_path() {
    let (table, clock) = table_with_clock(Some(Duration::from_secs(1)), Some(2));
    let a = table.store("s", Value::Int(1));
    table.store("s", Value::Int(2));
    table.store("s", Value::Int(3));
    assert!(!table.contains("s", &a));
    clock.advance(Duration::from_secs(2));
    table.prune();
    let c = table.store("t", Value::Int(4));
    table.release("t", &c);

    let stats = table.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.minted, 4);
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.expired, 2);
    assert_eq!(stats.released, 1);
}

// =============================================================================
// Concurrency and the background worker
// =============================================================================

#[test]
fn concurrent_stores_are_all_resolvable() {
    let table = Arc::new(HandleTable::new(EvictionPolicy::default()));
    let workers: Vec<_> = (0..8)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let session = format!("s{t}");
                (0..100)
                    .map(|i| (session.clone(), table.store(&session, Value::Int(i))))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let stored: Vec<(String, String)> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
    assert_eq!(stored.len(), 800);
    assert_eq!(table.len(), 800);
    for (session, id) in &stored {
        assert!(table.resolve(session, id).is_ok());
    }
}

#[test]
fn eviction_worker_prunes_in_the_background() {
    let (table, clock) = table_with_clock(Some(Duration::from_secs(1)), None);
    table.store("s", Value::Int(1));
    table.store("s", Value::Int(2));
    let worker = EvictionWorker::spawn(&table, Duration::from_millis(5)).unwrap();

    clock.advance(Duration::from_secs(5));
    let deadline = Instant::now() + Duration::from_secs(5);
    while !table.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    worker.shutdown();

    assert!(table.is_empty());
    assert_eq!(table.stats().expired, 2);
}

#[test]
fn eviction_worker_exits_when_table_is_dropped() {
    let table = Arc::new(HandleTable::new(EvictionPolicy::default()));
    let worker = EvictionWorker::spawn(&table, Duration::from_millis(5)).unwrap();
    drop(table);
    thread::sleep(Duration::from_millis(20));
    // joins without hanging
    drop(worker);
}
