use std::sync::{Arc, Barrier};
use std::time::Duration;

use chrono::TimeZone;
use intercom_signaling::call::{CallState, ManualClock, SessionStore};
use intercom_signaling::error::SessionError;
use intercom_signaling::records::MemoryCallRecordSink;

fn fixture() -> (Arc<ManualClock>, Arc<MemoryCallRecordSink>, Arc<SessionStore>) {
    let clock = Arc::new(ManualClock::new(chrono::Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).unwrap()));
    let sink = Arc::new(MemoryCallRecordSink::new());
    let store = Arc::new(SessionStore::new(clock.clone(), sink.clone()));
    (clock, sink, store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_create_has_single_winner() {
    let (_, _, store) = fixture();

    let mut handles = Vec::new();
    for i in 0..100 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.create_session("dup", &format!("dev{}", i), "res2", "room-1")
        }));
    }

    let (mut created, mut rejected) = (0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(SessionError::AlreadyExists) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(rejected, 99);
    assert_eq!(store.len(), 1);
}

#[test]
fn concurrent_create_from_os_threads() {
    let (_, _, store) = fixture();
    let barrier = Barrier::new(100);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..100)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    store.create_session("race", "dev1", "res2", "room-1")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.to_string() == "session already exists"));
}

#[tokio::test]
async fn ended_session_leaves_registry() {
    let (_, sink, store) = fixture();
    store.create_session("c1", "dev1", "res2", "room-1").unwrap();
    assert_eq!(store.get_session("c1").unwrap().state, CallState::Requesting);

    store.end_session("c1", "completed").await.unwrap();

    assert!(store.get_session("c1").is_none());
    assert!(store.get_all_active().iter().all(|s| s.call_id != "c1"));
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].caller_id, "dev1");
    assert_eq!(records[0].callee_id, "res2");
}

#[test]
fn sweep_uses_state_specific_timeouts() {
    let (clock, sink, store) = fixture();

    store.create_session("c2", "dev1", "res2", "room-2").unwrap();
    store.update_status("c2", CallState::Ringing).unwrap();
    store.create_session("c3", "dev3", "res4", "room-3").unwrap();
    store.update_status("c3", CallState::Connected).unwrap();

    clock.advance(chrono::Duration::seconds(31));
    let evicted = store.cleanup_timed_out(Duration::from_secs(30), Duration::from_secs(600));

    assert_eq!(evicted, 1);
    assert!(store.get_session("c2").is_none());
    assert_eq!(store.get_session("c3").unwrap().state, CallState::Connected);
    assert!(sink.records().is_empty());

    clock.advance(chrono::Duration::seconds(600));
    assert_eq!(store.cleanup_timed_out(Duration::from_secs(30), Duration::from_secs(600)), 1);
    assert!(store.is_empty());
}

#[test]
fn activity_postpones_eviction() {
    let (clock, _, store) = fixture();
    store.create_session("c5", "dev1", "res2", "room-5").unwrap();

    clock.advance(chrono::Duration::seconds(20));
    store.update_status("c5", CallState::Ringing).unwrap();
    clock.advance(chrono::Duration::seconds(20));

    assert_eq!(store.cleanup_timed_out(Duration::from_secs(30), Duration::from_secs(600)), 0);
    assert!(store.get_session("c5").is_some());
}

#[test]
fn create_rejects_duplicate_id() {
    let (_, _, store) = fixture();
    store.create_session("c6", "dev1", "res2", "room-6").unwrap();
    let err = store.create_session("c6", "dev9", "res9", "room-9").unwrap_err();
    assert_eq!(err, SessionError::AlreadyExists);
    assert_eq!(store.get_session("c6").unwrap().caller_id, "dev1");
}
