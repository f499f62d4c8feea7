//! Coordinator self-recovery
//!
//! Re-drives every request the coordinator log left without a DONE record:
//! UNRESOLVED and ABORT become ABORT, COMMIT is sent again. Participants treat
//! an already-resolved id as a no-op, so re-driving is safe.

use crate::common::{Error, Record, RecordStatus, Result};
use crate::coordinator::txn::{Coordinator, TxnState};

impl Coordinator {
    /// Ask every participant for its next id, admit the ones in step with the log and finish
    /// outstanding requests. Safe to call again when nobody was reachable.
    pub async fn recover(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        self.recover_locked(&mut guard).await
    }

    pub(crate) async fn recover_locked(&self, state: &mut TxnState) -> Result<()> {
        let outstanding: Vec<Record> = state.wal.records().values().copied().collect();
        let ours = self.next_id();
        // a participant that saw every earlier request cannot be below this
        let floor = outstanding.first().map(|r| r.id).unwrap_or(ours);

        for peer in &self.peers {
            match peer.next_id(self.config.rpc_timeout()).await {
                Ok(their) if their >= floor => self.admit_member(state, peer.clone()),
                Ok(their) => tracing::info!(
                    "{} at next_id {} is behind {}, leaving it to resync",
                    peer.addr(),
                    their,
                    floor
                ),
                Err(e) => tracing::debug!("{} unreachable during recovery: {}", peer.addr(), e),
            }
        }

        if state.registry.is_empty() {
            if !outstanding.is_empty() {
                tracing::warn!(
                    "No participant reachable, deferring {} outstanding requests",
                    outstanding.len()
                );
            }
            return Ok(());
        }

        for record in outstanding {
            let id = record.id;
            match record.status {
                RecordStatus::Unresolved | RecordStatus::Abort => {
                    tracing::info!("Recovery: aborting {} ({})", id, record.status);
                    if record.status == RecordStatus::Unresolved {
                        state
                            .wal
                            .log(Record::new(RecordStatus::Abort, id, ours))?;
                    }
                    self.broadcast_abort(state, id).await;
                    state
                        .wal
                        .log(Record::new(RecordStatus::AbortDone, id, ours))?;
                    state.last_aborted = Some(id);
                    self.metrics.aborts.inc();
                }
                RecordStatus::Commit => {
                    tracing::info!("Recovery: committing {}", id);
                    self.broadcast_commit(state, id).await;
                    state
                        .wal
                        .log(Record::new(RecordStatus::CommitDone, id, ours))?;
                    self.metrics.commits.inc();
                }
                status => {
                    return Err(Error::Corrupted(format!(
                        "unexpected {} record for id {} in coordinator log",
                        status, id
                    )))
                }
            }
        }

        // anyone not in step now goes through resync on the next heartbeat
        let members: Vec<_> = state.registry.values().cloned().collect();
        for member in members {
            match member.next_id(self.config.rpc_timeout()).await {
                Ok(their) if their == ours => {}
                Ok(their) => self.evict(
                    state,
                    member.addr(),
                    &Error::Inconsistent(format!("next_id {} after recovery, expected {}", their, ours)),
                ),
                Err(e) => self.evict(state, member.addr(), &e),
            }
        }

        tracing::info!(
            "Coordinator recovered: next_id={} live={}",
            ours,
            state.registry.len()
        );
        Ok(())
    }
}
