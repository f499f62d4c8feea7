//! Per-replica two-phase commit state machine
//!
//! A participant resolves sequence ids strictly in increasing order. `next_id` is
//! the smallest id it has not resolved yet; `pending` holds every prepared id.
//! Both, along with the two logs, live behind one mutex. A condition variable
//! lets an out-of-order COMMIT/ABORT wait for its predecessor for a bounded time.
//!
//! Once either log fails to append, the participant stops taking part: every
//! later protocol call returns [`Error::Wal`] until it is restarted.

use crate::common::{
    Command, Error, ParticipantConfig, Record, RecordStatus, Reply, Result, Storage, Wal,
    WalSyncPolicy,
};
use crate::participant::cmd_log::CommandLog;
use crate::participant::snapshot;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

const WAL_FILE: &str = "participant.wal";
const CMD_LOG_FILE: &str = "commands.log";

struct State {
    next_id: u32,
    pending: BTreeMap<u32, Command>,
    wal: Wal,
    cmd_log: CommandLog,
}

impl State {
    fn ensure_healthy(&self) -> Result<()> {
        if self.wal.is_failed() || self.cmd_log.is_failed() {
            return Err(Error::Wal("participant logs failed, restart required".into()));
        }
        Ok(())
    }

    fn has_pending_before(&self, id: u32) -> bool {
        self.pending.range(..id).next().is_some()
    }

    /// Close every record still live in the WAL and forget pending commands.
    fn discard_outstanding(&mut self, next_id: u32) -> Result<usize> {
        let live: Vec<u32> = self.wal.records().keys().copied().collect();
        for id in &live {
            self.wal
                .log(Record::new(RecordStatus::AbortDone, *id, next_id))?;
        }
        self.pending.clear();
        Ok(live.len())
    }
}

pub struct Participant {
    storage: Storage,
    state: Mutex<State>,
    resolved: Condvar,
    resolve_wait: Duration,
}

impl Participant {
    /// Open storage and logs as configured, then run local recovery.
    pub fn open(config: &ParticipantConfig) -> Result<Self> {
        let storage = Storage::open(config.storage, &config.data_path)?;
        Self::open_with_storage(
            storage,
            &config.wal_path,
            config.wal_sync,
            config.resolve_wait(),
        )
    }

    /// Recover from the logs in `wal_dir` on top of an already opened store.
    ///
    /// PREPARED records without a decision are staged again and left for the
    /// coordinator to resolve. A COMMIT without COMMIT_DONE is re-applied.
    pub fn open_with_storage(
        storage: Storage,
        wal_dir: &Path,
        sync_policy: WalSyncPolicy,
        resolve_wait: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(wal_dir)?;
        let mut wal = Wal::open(wal_dir.join(WAL_FILE), sync_policy)?;
        let (mut cmd_log, mut commands) =
            CommandLog::open(wal_dir.join(CMD_LOG_FILE), sync_policy)?;

        let mut next_id = wal.next_id().unwrap_or(0);
        let mut pending = BTreeMap::new();
        let outstanding: Vec<Record> = wal.records().values().copied().collect();

        for record in outstanding {
            let id = record.id;
            match record.status {
                RecordStatus::Prepared => {
                    let cmd = commands.remove(&id).ok_or_else(|| {
                        Error::Corrupted(format!("prepared id {} has no logged command", id))
                    })?;
                    tracing::info!("Re-staging prepared {}", cmd);
                    pending.insert(id, cmd);
                }
                RecordStatus::Commit => {
                    let cmd = commands.remove(&id).ok_or_else(|| {
                        Error::Corrupted(format!("committed id {} has no logged command", id))
                    })?;
                    tracing::info!("Re-applying interrupted commit {}", cmd);
                    apply(&storage, &cmd)?;
                    next_id = next_id.max(id.wrapping_add(1));
                    wal.log(Record::new(RecordStatus::CommitDone, id, next_id))?;
                }
                RecordStatus::Abort => {
                    commands.remove(&id);
                    next_id = next_id.max(id.wrapping_add(1));
                    wal.log(Record::new(RecordStatus::AbortDone, id, next_id))?;
                }
                status => {
                    return Err(Error::Corrupted(format!(
                        "unexpected {} record for id {} in participant log",
                        status, id
                    )))
                }
            }
        }

        cmd_log.compact(&pending)?;

        tracing::info!(
            "Participant recovered: next_id={} pending={}",
            next_id,
            pending.len()
        );

        Ok(Self {
            storage,
            state: Mutex::new(State {
                next_id,
                pending,
                wal,
                cmd_log,
            }),
            resolved: Condvar::new(),
            resolve_wait,
        })
    }

    /// Read a key straight from storage. Not sequenced, not logged.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.storage.get(key)
    }

    /// Stage a SET/DEL. Votes `false` only when the command cannot be made durable.
    pub fn prepare(&self, cmd: Command) -> Result<bool> {
        let id = cmd
            .id()
            .ok_or_else(|| Error::Inconsistent(format!("prepare for read {}", cmd)))?;

        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        state.ensure_healthy()?;
        if id < state.next_id {
            return Err(Error::Inconsistent(format!(
                "prepare for resolved id {} (next_id {})",
                id, state.next_id
            )));
        }
        if state.pending.contains_key(&id) {
            return Err(Error::Inconsistent(format!("double prepare of id {}", id)));
        }
        if let Some(len) = cmd.oversized_field() {
            tracing::warn!("Voting no on {}: field of {} bytes", cmd, len);
            return Ok(false);
        }

        let logged = state.cmd_log.append(&cmd).and_then(|_| {
            state
                .wal
                .log(Record::new(RecordStatus::Prepared, id, state.next_id))
        });
        if let Err(e) = logged {
            tracing::error!("Cannot log {}, participant is now failed: {}", cmd, e);
            return Ok(false);
        }

        tracing::debug!("Prepared {}", cmd);
        state.pending.insert(id, cmd);
        Ok(true)
    }

    /// Apply a prepared command. `Ok(None)` when `id` was already resolved.
    pub fn commit(&self, id: u32) -> Result<Option<Reply>> {
        let guard = self.state.lock()?;
        let (mut guard, _) = self
            .resolved
            .wait_timeout_while(guard, self.resolve_wait, |s| id > s.next_id)?;
        let state = &mut *guard;
        state.ensure_healthy()?;

        if id < state.next_id {
            tracing::debug!("Commit of resolved id {} ignored", id);
            return Ok(None);
        }
        if id > state.next_id {
            return Err(Error::Inconsistent(format!(
                "commit of id {} while next_id is {}",
                id, state.next_id
            )));
        }

        if !state.pending.contains_key(&id) {
            return Err(Error::Inconsistent(format!(
                "commit of id {} that was never prepared",
                id
            )));
        }

        state
            .wal
            .log(Record::new(RecordStatus::Commit, id, state.next_id))?;
        let cmd = state
            .pending
            .remove(&id)
            .ok_or_else(|| Error::Internal(format!("pending id {} vanished", id)))?;
        let reply = apply(&self.storage, &cmd)?;
        let next_id = id.wrapping_add(1);
        state
            .wal
            .log(Record::new(RecordStatus::CommitDone, id, next_id))?;
        state.next_id = next_id;
        drop(guard);
        self.resolved.notify_all();

        tracing::debug!("Committed {} -> {:?}", cmd, reply);
        Ok(Some(reply))
    }

    /// Discard a prepared command.
    ///
    /// An abort for an id this replica never prepared fast-forwards `next_id`
    /// past it: the replica is assumed to have missed the prepare.
    pub fn abort(&self, id: u32) -> Result<bool> {
        let guard = self.state.lock()?;
        let (mut guard, _) = self
            .resolved
            .wait_timeout_while(guard, self.resolve_wait, |s| {
                id > s.next_id && s.has_pending_before(id)
            })?;
        let state = &mut *guard;
        state.ensure_healthy()?;

        if id < state.next_id {
            tracing::debug!("Abort of resolved id {} ignored", id);
            return Ok(true);
        }
        if state.has_pending_before(id) {
            return Err(Error::Inconsistent(format!(
                "abort of id {} while earlier ids are unresolved (next_id {})",
                id, state.next_id
            )));
        }

        if !state.pending.contains_key(&id) && id > state.next_id {
            tracing::warn!(
                "Abort of unprepared id {} fast-forwards next_id from {}",
                id,
                state.next_id
            );
        }
        let next_id = id.wrapping_add(1);
        state
            .wal
            .log(Record::new(RecordStatus::AbortDone, id, next_id))?;
        state.pending.remove(&id);
        state.next_id = next_id;
        drop(guard);
        self.resolved.notify_all();

        tracing::debug!("Aborted id {}", id);
        Ok(true)
    }

    pub fn next_id(&self) -> Result<u32> {
        let state = self.state.lock()?;
        state.ensure_healthy()?;
        Ok(state.next_id)
    }

    /// True once a log append failed. A failed participant refuses the protocol.
    pub fn is_failed(&self) -> Result<bool> {
        Ok(self.state.lock()?.ensure_healthy().is_err())
    }

    /// Jump to `next_id`, dropping anything still outstanding.
    pub fn set_next_id(&self, next_id: u32) -> Result<()> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        state.ensure_healthy()?;

        let dropped = state.discard_outstanding(next_id)?;
        state.wal.log(Record::new(
            RecordStatus::AbortDone,
            next_id.wrapping_sub(1),
            next_id,
        ))?;
        tracing::info!(
            "next_id set {} -> {} ({} outstanding dropped)",
            state.next_id,
            next_id,
            dropped
        );
        state.next_id = next_id;
        drop(guard);
        self.resolved.notify_all();
        Ok(())
    }

    pub fn heartbeat(&self) -> Result<()> {
        self.state.lock()?.ensure_healthy()
    }

    /// Dump the whole store.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let _guard = self.state.lock()?;
        snapshot::encode(&self.storage)
    }

    /// Overwrite local state with a snapshot taken from an up-to-date replica.
    /// `deleted_keys` are removed first. The caller sets `next_id` afterwards.
    pub fn recover(&self, snapshot: &[u8], deleted_keys: &[String]) -> Result<bool> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        state.ensure_healthy()?;

        let entries = match snapshot::restore(&self.storage, snapshot, deleted_keys) {
            Ok(n) => n,
            Err(Error::Snapshot(msg)) => {
                tracing::warn!("Rejecting snapshot: {}", msg);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let next_id = state.next_id;
        state.discard_outstanding(next_id)?;

        tracing::info!(
            "Recovered {} entries from snapshot, {} keys deleted",
            entries,
            deleted_keys.len()
        );
        Ok(true)
    }

    /// Ids prepared but not yet resolved.
    pub fn pending_ids(&self) -> Result<Vec<u32>> {
        Ok(self.state.lock()?.pending.keys().copied().collect())
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

/// Apply a command to storage and build the client reply.
fn apply(storage: &Storage, cmd: &Command) -> Result<Reply> {
    match cmd {
        Command::Set { key, value, .. } => {
            storage.put(key, value)?;
            Ok(Reply::ok())
        }
        Command::Del { keys, .. } => {
            let mut count = 0i64;
            for key in keys {
                if storage.delete(key)? {
                    count += 1;
                }
            }
            Ok(Reply::Integer(count))
        }
        Command::Get { .. } => Err(Error::Inconsistent(format!("cannot apply {}", cmd))),
    }
}
