// Snapshot round-trip (§8): writing a well-formed sequence of directives and
// replaying it on `Snapshotter::open` reproduces the same alive set and
// (safety-biased) clocks; a trailing `leave` clears the alive set unless
// `rejoin_after_leave` tells the coordinator otherwise (a decision the
// coordinator makes from `RecoveredState::left`, not the snapshotter itself).

use serf_core::snapshot::{SnapshotConfig, Snapshotter};
use std::io::Write;

fn write_log(path: &std::path::Path, lines: &[&str]) {
    let mut file = std::fs::File::create(path).unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
}

#[tokio::test]
async fn replay_recovers_alive_set_and_clocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("serf.snapshot");
    write_log(
        &path,
        &[
            "alive: node1 127.0.0.1:7946",
            "alive: node2 127.0.0.1:7947",
            "clock: 10",
            "event-clock: 20",
            "query-clock: 30",
            "not-alive: node2",
            "alive: node3 127.0.0.1:7948",
        ],
    );

    let (snap, recovered, _inputs) = Snapshotter::open(path, SnapshotConfig::default(), false).await.unwrap();

    let mut alive = recovered.alive.clone();
    alive.sort();
    assert_eq!(
        alive,
        vec![
            ("node1".to_string(), "127.0.0.1:7946".parse().unwrap()),
            ("node3".to_string(), "127.0.0.1:7948".parse().unwrap()),
        ]
    );
    assert_eq!(recovered.member_clock, 11);
    assert_eq!(recovered.event_clock, 21);
    assert_eq!(recovered.query_clock, 31);
    assert!(!recovered.left);

    let live_alive_set = snap.alive_set().await;
    assert_eq!(live_alive_set.len(), 2);
}

#[tokio::test]
async fn trailing_leave_clears_the_alive_set_and_sets_the_left_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("serf.snapshot");
    write_log(
        &path,
        &[
            "alive: node1 127.0.0.1:7946",
            "alive: node2 127.0.0.1:7947",
            "leave",
        ],
    );

    let (_snap, recovered, _inputs) = Snapshotter::open(path, SnapshotConfig::default(), false).await.unwrap();

    assert!(recovered.alive.is_empty());
    assert!(recovered.left);
}

#[tokio::test]
async fn trailing_leave_keeps_the_alive_set_when_rejoin_after_leave_is_set() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("serf.snapshot");
    write_log(
        &path,
        &[
            "alive: node1 127.0.0.1:7946",
            "alive: node2 127.0.0.1:7947",
            "leave",
        ],
    );

    let (_snap, recovered, _inputs) = Snapshotter::open(path, SnapshotConfig::default(), true).await.unwrap();

    let mut alive = recovered.alive.clone();
    alive.sort();
    assert_eq!(
        alive,
        vec![
            ("node1".to_string(), "127.0.0.1:7946".parse().unwrap()),
            ("node2".to_string(), "127.0.0.1:7947".parse().unwrap()),
        ]
    );
    assert!(recovered.left);
}

#[tokio::test]
async fn malformed_and_unknown_lines_are_skipped_without_failing_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("serf.snapshot");
    write_log(
        &path,
        &[
            "alive: node1 127.0.0.1:7946",
            "not-a-real-directive: whatever",
            "alive: not-even-an-address",
            "clock: 5",
        ],
    );

    let (_snap, recovered, _inputs) = Snapshotter::open(path, SnapshotConfig::default(), false).await.unwrap();

    assert_eq!(recovered.alive, vec![("node1".to_string(), "127.0.0.1:7946".parse().unwrap())]);
    assert_eq!(recovered.member_clock, 6);
}

#[tokio::test]
async fn missing_file_recovers_nothing_and_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("does-not-exist.snapshot");

    let (_snap, recovered, _inputs) = Snapshotter::open(path, SnapshotConfig::default(), false).await.unwrap();

    assert!(recovered.alive.is_empty());
    assert_eq!(recovered.member_clock, 0);
    assert!(!recovered.left);
}

#[tokio::test]
async fn live_directives_flow_through_to_the_alive_set() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("serf.snapshot");

    let (snap, recovered, inputs) = Snapshotter::open(path, SnapshotConfig::default(), false).await.unwrap();
    assert!(recovered.alive.is_empty());

    let handles = snap.spawn_loops(inputs);
    snap.alive("node1".to_string(), "127.0.0.1:7946".parse().unwrap()).await;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
    loop {
        if snap.alive_set().await.contains_key("node1") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "alive directive never reached the in-memory set");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    snap.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
}
