//! Crash and restart of participants and the coordinator

mod common;

use common::{coordinator_config, open_participant, Cluster};
use kv2pc::common::{ParticipantRpc, Record, RecordStatus, Storage, Wal, WalSyncPolicy};
use kv2pc::participant::LocalParticipant;
use kv2pc::{Command, Coordinator, Reply};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Two participants `p1`, `p2` with their stores, logged under `dir`.
fn participants(dir: &Path) -> Vec<(Storage, Arc<LocalParticipant>)> {
    (1..=2)
        .map(|i| {
            let addr = format!("p{}", i);
            let storage = Storage::new_memory();
            let p = open_participant(&dir.join(&addr), &storage);
            (storage, Arc::new(LocalParticipant::new(addr, p)))
        })
        .collect()
}

fn seed_coordinator_log(dir: &Path, records: &[Record]) {
    let mut wal = Wal::open(dir.join("coordinator.wal"), WalSyncPolicy::Always).unwrap();
    for record in records {
        wal.log(*record).unwrap();
    }
}

fn coordinator(dir: &Path, nodes: &[(Storage, Arc<LocalParticipant>)]) -> Coordinator {
    let addrs: Vec<String> = nodes.iter().map(|(_, h)| h.addr().to_string()).collect();
    let peers = nodes
        .iter()
        .map(|(_, h)| h.clone() as Arc<dyn ParticipantRpc>)
        .collect();
    Coordinator::with_participants(coordinator_config(dir, &addrs), peers).unwrap()
}

#[cfg(feature = "sled-backend")]
#[test]
fn test_participant_restart_on_sled() {
    use kv2pc::common::{ParticipantConfig, StorageBackend};
    use kv2pc::participant::Participant;

    let dir = TempDir::new().unwrap();
    let config = ParticipantConfig {
        data_path: dir.path().join("db"),
        wal_path: dir.path().join("wal"),
        wal_sync: WalSyncPolicy::Always,
        storage: StorageBackend::Sled,
        ..Default::default()
    };

    {
        let p = Participant::open(&config).unwrap();
        assert!(p.prepare(Command::set("CS06142", "Cloud Computing").with_id(0)).unwrap());
        assert_eq!(p.commit(0).unwrap(), Some(Reply::ok()));
        assert!(p.prepare(Command::del(["CS06142"]).with_id(1)).unwrap());
    }

    let p = Participant::open(&config).unwrap();
    assert_eq!(p.next_id().unwrap(), 1);
    assert_eq!(p.pending_ids().unwrap(), vec![1]);
    assert_eq!(
        p.get("CS06142").unwrap().as_deref(),
        Some(&b"Cloud Computing"[..])
    );

    assert_eq!(p.commit(1).unwrap(), Some(Reply::Integer(1)));
    assert_eq!(p.get("CS06142").unwrap(), None);
}

#[test]
fn test_participant_replay_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new_memory();
    {
        let p = open_participant(dir.path(), &storage);
        assert!(p.prepare(Command::set("a", "1").with_id(0)).unwrap());
        assert_eq!(p.commit(0).unwrap(), Some(Reply::ok()));
        assert!(p.prepare(Command::set("b", "2").with_id(1)).unwrap());
        assert!(p.prepare(Command::del(["a"]).with_id(2)).unwrap());
    }

    for _ in 0..3 {
        let p = open_participant(dir.path(), &storage);
        assert_eq!(p.next_id().unwrap(), 1);
        assert_eq!(p.pending_ids().unwrap(), vec![1, 2]);
        assert_eq!(storage.iter_all().unwrap().len(), 1);
    }

    let p = open_participant(dir.path(), &storage);
    assert!(p.abort(1).unwrap());
    assert_eq!(p.commit(2).unwrap(), Some(Reply::Integer(1)));
    drop(p);

    let p = open_participant(dir.path(), &storage);
    assert_eq!(p.next_id().unwrap(), 3);
    assert!(p.pending_ids().unwrap().is_empty());
    assert!(storage.iter_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_recover_aborts_unresolved_request() {
    let dir = TempDir::new().unwrap();
    let nodes = participants(dir.path());
    for (_, handle) in &nodes {
        let p = handle.participant().unwrap();
        p.set_next_id(5).unwrap();
        assert!(p.prepare(Command::set("k", "v").with_id(5)).unwrap());
    }
    // coordinator died after sending PREPARE
    seed_coordinator_log(
        dir.path(),
        &[Record::new(RecordStatus::Unresolved, 5, 6)],
    );

    let coordinator = coordinator(dir.path(), &nodes);
    assert_eq!(coordinator.next_id(), 6);
    coordinator.recover().await.unwrap();

    assert_eq!(coordinator.live_participants().await, vec!["p1", "p2"]);
    assert_eq!(coordinator.status().await.outstanding, 0);
    for (storage, handle) in &nodes {
        let p = handle.participant().unwrap();
        assert_eq!(p.next_id().unwrap(), 6);
        assert!(p.pending_ids().unwrap().is_empty());
        assert_eq!(storage.get("k").unwrap(), None);
    }

    assert_eq!(coordinator.execute(Command::set("k", "w")).await, Reply::ok());
    assert_eq!(nodes[1].0.get("k").unwrap().as_deref(), Some(&b"w"[..]));
}

#[tokio::test]
async fn test_recover_finishes_interrupted_commit() {
    let dir = TempDir::new().unwrap();
    let nodes = participants(dir.path());
    for (_, handle) in &nodes {
        let p = handle.participant().unwrap();
        p.set_next_id(5).unwrap();
        assert!(p.prepare(Command::set("k", "v").with_id(5)).unwrap());
    }
    // COMMIT reached p1 only
    let p1 = nodes[0].1.participant().unwrap();
    assert_eq!(p1.commit(5).unwrap(), Some(Reply::ok()));
    seed_coordinator_log(
        dir.path(),
        &[
            Record::new(RecordStatus::Unresolved, 5, 6),
            Record::new(RecordStatus::Commit, 5, 6),
        ],
    );

    let coordinator = coordinator(dir.path(), &nodes);
    coordinator.recover().await.unwrap();

    assert_eq!(coordinator.live_participants().await, vec!["p1", "p2"]);
    assert_eq!(coordinator.status().await.outstanding, 0);
    for (storage, handle) in &nodes {
        assert_eq!(handle.participant().unwrap().next_id().unwrap(), 6);
        assert_eq!(storage.get("k").unwrap().as_deref(), Some(&b"v"[..]));
    }
}

#[tokio::test]
async fn test_recover_with_nobody_reachable_defers() {
    let dir = TempDir::new().unwrap();
    let nodes = participants(dir.path());
    seed_coordinator_log(
        dir.path(),
        &[Record::new(RecordStatus::Unresolved, 0, 1)],
    );
    for (_, handle) in &nodes {
        handle.crash().unwrap();
    }

    let coordinator = coordinator(dir.path(), &nodes);
    coordinator.recover().await.unwrap();
    assert!(coordinator.live_participants().await.is_empty());
    assert_eq!(coordinator.status().await.outstanding, 1);

    for (i, (storage, handle)) in nodes.iter().enumerate() {
        let wal_dir = dir.path().join(format!("p{}", i + 1));
        handle.restart(open_participant(&wal_dir, storage)).unwrap();
    }
    coordinator.heartbeat_tick().await;
    assert_eq!(coordinator.live_participants().await, vec!["p1", "p2"]);
    assert_eq!(coordinator.status().await.outstanding, 0);
}

#[tokio::test]
async fn test_coordinator_restart_keeps_sequence() {
    let mut cluster = Cluster::start(2).await;
    assert_eq!(cluster.set("a", "1").await, Reply::ok());
    assert_eq!(cluster.set("b", "2").await, Reply::ok());
    assert_eq!(cluster.del(&["a"]).await, Reply::Integer(1));
    assert_eq!(cluster.coordinator.next_id(), 3);

    cluster.restart_coordinator().await;
    assert_eq!(cluster.coordinator.next_id(), 3);
    assert_eq!(cluster.live().await, vec!["p1", "p2"]);

    assert_eq!(cluster.set("c", "3").await, Reply::ok());
    assert_eq!(cluster.get("b").await, common::words(&["2"]));
    for node in &cluster.nodes {
        assert_eq!(node.participant().next_id().unwrap(), 4);
    }
}

#[tokio::test]
async fn test_participant_crash_mid_transaction_recovers() {
    let cluster = Cluster::start(2).await;
    assert_eq!(cluster.set("k", "v1").await, Reply::ok());

    // p2 prepared 1 but died before COMMIT arrived
    let p2 = cluster.nodes[1].participant();
    assert!(p2.prepare(Command::set("k", "lost").with_id(1)).unwrap());
    cluster.nodes[1].crash();
    drop(p2);

    cluster.nodes[1].restart();
    assert_eq!(cluster.nodes[1].participant().pending_ids().unwrap(), vec![1]);

    // the stray prepare makes p2 refuse id 1, so p1 commits it alone
    assert_eq!(cluster.set("k", "v2").await, Reply::ok());
    assert_eq!(cluster.live().await, vec!["p1"]);
    cluster.coordinator.heartbeat_tick().await;
    assert_eq!(cluster.live().await, vec!["p1", "p2"]);
    assert_eq!(
        cluster.nodes[1].storage.get("k").unwrap().as_deref(),
        Some(&b"v2"[..])
    );
    assert!(cluster.nodes[1].participant().pending_ids().unwrap().is_empty());
}
