//! In-process cluster used by the integration tests

#![allow(dead_code)]

use kv2pc::common::{CoordinatorConfig, ParticipantRpc, Storage, WalSyncPolicy};
use kv2pc::participant::{LocalParticipant, Participant};
use kv2pc::{Command, Coordinator, Reply};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn open_participant(dir: &Path, storage: &Storage) -> Arc<Participant> {
    Arc::new(
        Participant::open_with_storage(
            storage.clone(),
            dir,
            WalSyncPolicy::Always,
            Duration::from_millis(200),
        )
        .unwrap(),
    )
}

pub fn coordinator_config(dir: &Path, addrs: &[String]) -> CoordinatorConfig {
    CoordinatorConfig {
        participants: addrs.to_vec(),
        wal_path: dir.join("coordinator.wal"),
        wal_sync: WalSyncPolicy::Always,
        rpc_timeout_ms: 500,
        heartbeat_timeout_ms: 500,
        initial_next_id: Some(0),
        ..Default::default()
    }
}

pub struct Node {
    pub addr: String,
    pub dir: PathBuf,
    /// Survives crashes, like an on-disk engine would.
    pub storage: Storage,
    pub handle: Arc<LocalParticipant>,
}

impl Node {
    pub fn participant(&self) -> Arc<Participant> {
        self.handle.participant().expect("participant is down")
    }

    pub fn crash(&self) {
        self.handle.crash().unwrap();
    }

    pub fn restart(&self) {
        self.handle
            .restart(open_participant(&self.dir, &self.storage))
            .unwrap();
    }

    pub fn dump(&self) -> Vec<(String, Vec<u8>)> {
        self.storage.iter_all().unwrap()
    }
}

pub struct Cluster {
    pub dir: TempDir,
    pub nodes: Vec<Node>,
    pub coordinator: Arc<Coordinator>,
}

impl Cluster {
    /// `n` participants named `p1..pn`, all admitted.
    pub async fn start(n: usize) -> Self {
        Self::start_with(n, |handle| handle as Arc<dyn ParticipantRpc>).await
    }

    /// Like [`Cluster::start`], with each handle passed through `wrap` before the
    /// coordinator sees it.
    pub async fn start_with<F>(n: usize, wrap: F) -> Self
    where
        F: Fn(Arc<LocalParticipant>) -> Arc<dyn ParticipantRpc>,
    {
        let dir = tempfile::tempdir().unwrap();
        let nodes: Vec<Node> = (1..=n)
            .map(|i| {
                let addr = format!("p{}", i);
                let node_dir = dir.path().join(&addr);
                let storage = Storage::new_memory();
                let handle = Arc::new(LocalParticipant::new(
                    addr.clone(),
                    open_participant(&node_dir, &storage),
                ));
                Node {
                    addr,
                    dir: node_dir,
                    storage,
                    handle,
                }
            })
            .collect();

        let coordinator = Self::open_coordinator(dir.path(), &nodes, &wrap);
        coordinator.recover().await.unwrap();
        Self {
            dir,
            nodes,
            coordinator,
        }
    }

    fn open_coordinator<F>(dir: &Path, nodes: &[Node], wrap: &F) -> Arc<Coordinator>
    where
        F: Fn(Arc<LocalParticipant>) -> Arc<dyn ParticipantRpc>,
    {
        let addrs: Vec<String> = nodes.iter().map(|n| n.addr.clone()).collect();
        let peers = nodes.iter().map(|n| wrap(n.handle.clone())).collect();
        Arc::new(Coordinator::with_participants(coordinator_config(dir, &addrs), peers).unwrap())
    }

    /// Drop the coordinator and bring up a new one on the same log.
    pub async fn restart_coordinator(&mut self) {
        let wrap = |handle: Arc<LocalParticipant>| handle as Arc<dyn ParticipantRpc>;
        self.coordinator = Self::open_coordinator(self.dir.path(), &self.nodes, &wrap);
        self.coordinator.recover().await.unwrap();
    }

    pub async fn set(&self, key: &str, value: &str) -> Reply {
        self.coordinator.execute(Command::set(key, value)).await
    }

    pub async fn get(&self, key: &str) -> Reply {
        self.coordinator.execute(Command::get(key)).await
    }

    pub async fn del(&self, keys: &[&str]) -> Reply {
        self.coordinator
            .execute(Command::del(keys.iter().copied()))
            .await
    }

    pub async fn live(&self) -> Vec<String> {
        self.coordinator.live_participants().await
    }
}

pub fn words(words: &[&str]) -> Reply {
    Reply::Array(
        words
            .iter()
            .map(|w| Reply::Data(w.as_bytes().to_vec()))
            .collect(),
    )
}
