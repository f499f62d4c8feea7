//! Transaction driver
//!
//! Every mutating request runs PREPARE on each live participant, then COMMIT or
//! ABORT, with the coordinator's own record logged at each step. The whole
//! transaction, including the RPCs, runs under one coordinator-wide lock.
//!
//! A failed append to the coordinator log is fatal: the log refuses every later
//! record, so no further request can begin until the process is restarted and
//! recovery re-drives what the log holds.

use crate::common::metrics::TxnMetrics;
use crate::common::{
    Command, CoordinatorConfig, Error, ParticipantRpc, Record, RecordStatus, Reply, Result, Wal,
};
use crate::coordinator::participant_client::ParticipantClient;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// State guarded by the coordinator lock.
pub(crate) struct TxnState {
    /// Live participants, keyed by address.
    pub(crate) registry: BTreeMap<String, Arc<dyn ParticipantRpc>>,
    pub(crate) wal: Wal,
    /// Keys deleted while some configured participant was out of the live set.
    pub(crate) deleted_keys: BTreeSet<String>,
    /// Most recent id resolved as ABORT.
    pub(crate) last_aborted: Option<u32>,
}

pub struct Coordinator {
    pub(crate) config: CoordinatorConfig,
    /// Every configured participant, in configuration order.
    pub(crate) peers: Vec<Arc<dyn ParticipantRpc>>,
    pub(crate) state: Mutex<TxnState>,
    next_id: AtomicU32,
    pub(crate) metrics: TxnMetrics,
}

/// Snapshot of coordinator state for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub next_id: u32,
    pub live: Vec<String>,
    pub configured: Vec<String>,
    pub deleted_keys: usize,
    pub outstanding: usize,
    /// The coordinator log failed and requests are refused.
    pub failed: bool,
}

impl Coordinator {
    /// Build a coordinator talking to the configured participants over TCP.
    pub fn open(config: CoordinatorConfig) -> Result<Self> {
        let peers = config
            .participants
            .iter()
            .map(|addr| Arc::new(ParticipantClient::new(addr.clone())) as Arc<dyn ParticipantRpc>)
            .collect();
        Self::with_participants(config, peers)
    }

    /// Build a coordinator over caller-supplied participant handles.
    ///
    /// The live set starts empty; run [`Coordinator::recover`] to populate it.
    pub fn with_participants(
        config: CoordinatorConfig,
        peers: Vec<Arc<dyn ParticipantRpc>>,
    ) -> Result<Self> {
        if peers.is_empty() {
            return Err(Error::InvalidConfig("no participants configured".into()));
        }
        let wal = Wal::open(&config.wal_path, config.wal_sync)?;

        let next_id = match (wal.next_id(), config.initial_next_id) {
            (Some(id), _) => id,
            (None, Some(id)) => id,
            (None, None) => {
                let id = rand::thread_rng().gen_range(0..u32::MAX / 2);
                tracing::warn!("No coordinator log found, starting at random next_id {}", id);
                id
            }
        };
        tracing::info!(
            "Coordinator log {:?}: next_id={} outstanding={}",
            wal.path(),
            next_id,
            wal.records().len()
        );

        Ok(Self {
            config,
            peers,
            state: Mutex::new(TxnState {
                registry: BTreeMap::new(),
                wal,
                deleted_keys: BTreeSet::new(),
                last_aborted: None,
            }),
            next_id: AtomicU32::new(next_id),
            metrics: TxnMetrics::new(),
        })
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &TxnMetrics {
        &self.metrics
    }

    /// Run one client command and build its reply. Failures become the error sentinel.
    pub async fn execute(&self, cmd: Command) -> Reply {
        let reply = match cmd {
            Command::Get { key } => self.read(&key).await,
            cmd => {
                let started = Instant::now();
                let result = self.transact(cmd).await;
                self.metrics.observe_txn(started.elapsed());
                result
            }
        };
        reply.unwrap_or_else(|e| {
            if e.is_fatal() {
                tracing::error!("Request failed: {}", e);
            } else {
                tracing::debug!("Request failed: {}", e);
            }
            self.metrics.failures.inc();
            Reply::error()
        })
    }

    /// GET goes to the first live participant that answers.
    async fn read(&self, key: &str) -> Result<Reply> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let members: Vec<_> = state.registry.values().cloned().collect();

        for member in members {
            match member.get(key, self.config.rpc_timeout()).await {
                Ok(value) => {
                    self.metrics.reads.inc();
                    return Ok(Reply::from_value(value.as_deref()));
                }
                Err(e) => self.evict(state, member.addr(), &e),
            }
        }
        Err(Error::NoParticipants)
    }

    async fn transact(&self, cmd: Command) -> Result<Reply> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.registry.is_empty() {
            return Err(Error::NoParticipants);
        }

        if state.wal.is_failed() {
            return Err(Error::Wal("coordinator log failed, refusing requests".into()));
        }

        let id = self.next_id();
        let next = id.wrapping_add(1);
        let cmd = cmd.with_id(id);
        state
            .wal
            .log(Record::new(RecordStatus::Unresolved, id, next))?;
        self.next_id.store(next, Ordering::SeqCst);
        tracing::debug!("Begin {}", cmd);

        // phase one
        let timeout = self.config.rpc_timeout();
        let members: Vec<_> = state.registry.values().cloned().collect();
        let mut commit = true;
        for member in members {
            match member.prepare(&cmd, timeout).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!("{} voted no on {}", member.addr(), cmd);
                    commit = false;
                    break;
                }
                Err(e) => self.evict(state, member.addr(), &e),
            }
        }

        if state.registry.is_empty() {
            // left UNRESOLVED; aborted by recovery once someone is reachable
            state.last_aborted = Some(id);
            return Err(Error::NoParticipants);
        }

        // phase two
        let (status, done) = if commit {
            (RecordStatus::Commit, RecordStatus::CommitDone)
        } else {
            (RecordStatus::Abort, RecordStatus::AbortDone)
        };
        state.wal.log(Record::new(status, id, self.next_id()))?;

        let reply = if commit {
            self.broadcast_commit(state, id).await
        } else {
            self.broadcast_abort(state, id).await;
            None
        };
        state.wal.log(Record::new(done, id, self.next_id()))?;

        if !commit {
            state.last_aborted = Some(id);
            self.metrics.aborts.inc();
            tracing::debug!("Aborted {}", cmd);
            return Ok(Reply::error());
        }

        self.metrics.commits.inc();
        if let Command::Del { keys, .. } = &cmd {
            if state.registry.len() < self.peers.len() {
                state.deleted_keys.extend(keys.iter().cloned());
            }
        }
        tracing::debug!("Committed {} -> {:?}", cmd, reply);
        Ok(reply.unwrap_or_else(Reply::error))
    }

    /// COMMIT on every live participant; returns the first reply produced.
    pub(crate) async fn broadcast_commit(&self, state: &mut TxnState, id: u32) -> Option<Reply> {
        let members: Vec<_> = state.registry.values().cloned().collect();
        let mut reply = None;
        for member in members {
            match member.commit(id, self.config.rpc_timeout()).await {
                Ok(r) => {
                    if reply.is_none() {
                        reply = r;
                    }
                }
                Err(e) => self.evict(state, member.addr(), &e),
            }
        }
        reply
    }

    pub(crate) async fn broadcast_abort(&self, state: &mut TxnState, id: u32) {
        let members: Vec<_> = state.registry.values().cloned().collect();
        for member in members {
            if let Err(e) = member.abort(id, self.config.rpc_timeout()).await {
                self.evict(state, member.addr(), &e);
            }
        }
    }

    pub(crate) fn evict(&self, state: &mut TxnState, addr: &str, reason: &Error) {
        if state.registry.remove(addr).is_some() {
            tracing::warn!("Evicting participant {}: {}", addr, reason);
            self.metrics.evictions.inc();
            self.metrics
                .live_participants
                .set(state.registry.len() as u64);
        }
    }

    pub(crate) fn admit_member(&self, state: &mut TxnState, member: Arc<dyn ParticipantRpc>) {
        let addr = member.addr().to_string();
        if state.registry.insert(addr.clone(), member).is_none() {
            tracing::info!("Participant {} joined at next_id {}", addr, self.next_id());
            self.metrics.admissions.inc();
            self.metrics
                .live_participants
                .set(state.registry.len() as u64);
        }
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let state = self.state.lock().await;
        CoordinatorStatus {
            next_id: self.next_id(),
            live: state.registry.keys().cloned().collect(),
            configured: self.peers.iter().map(|p| p.addr().to_string()).collect(),
            deleted_keys: state.deleted_keys.len(),
            outstanding: state.wal.records().len(),
            failed: state.wal.is_failed(),
        }
    }

    pub async fn is_failed(&self) -> bool {
        self.state.lock().await.wal.is_failed()
    }

    /// Addresses currently in the live set.
    pub async fn live_participants(&self) -> Vec<String> {
        self.state.lock().await.registry.keys().cloned().collect()
    }
}
