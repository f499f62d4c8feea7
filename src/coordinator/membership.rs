//! Heartbeat-driven membership
//!
//! Live participants are pinged and evicted when they stop answering. Configured
//! participants outside the live set are asked for their `next_id` and admitted
//! once they have caught up, by snapshot transfer when they are too far behind.
//! A lagging participant stays out while no live participant can serve as the
//! snapshot source.

use crate::common::{Error, ParticipantRpc, Result};
use crate::coordinator::txn::{Coordinator, TxnState};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

impl Coordinator {
    /// Run heartbeat ticks at the configured interval until the task is aborted.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.heartbeat_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                coordinator.heartbeat_tick().await;
            }
        })
    }

    /// One membership pass over every configured participant.
    pub async fn heartbeat_tick(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.registry.is_empty() && !state.wal.records().is_empty() {
            if let Err(e) = self.recover_locked(state).await {
                tracing::error!("Coordinator recovery failed: {}", e);
            }
            return;
        }

        let timeout = self.config.heartbeat_timeout();
        for peer in &self.peers {
            let addr = peer.addr();
            if state.registry.contains_key(addr) {
                if let Err(e) = peer.heartbeat(timeout).await {
                    self.evict(state, addr, &e);
                }
                continue;
            }

            match peer.next_id(timeout).await {
                Ok(their) => match self.admit(state, peer.clone(), their).await {
                    Ok(()) => {}
                    Err(Error::NoParticipants) => {
                        tracing::debug!("{} waits for a live snapshot source", addr)
                    }
                    Err(e) => tracing::warn!("Cannot admit {}: {}", addr, e),
                },
                Err(e) => tracing::trace!("{} still unreachable: {}", addr, e),
            }
        }

        if !state.deleted_keys.is_empty() && state.registry.len() == self.peers.len() {
            tracing::info!(
                "All participants live, dropping {} accumulated deleted keys",
                state.deleted_keys.len()
            );
            state.deleted_keys.clear();
        }
    }

    /// Bring a reachable participant reporting `their` next id into the live set.
    async fn admit(
        &self,
        state: &mut TxnState,
        peer: Arc<dyn ParticipantRpc>,
        their: u32,
    ) -> Result<()> {
        let ours = self.next_id();

        if their == ours {
            self.admit_member(state, peer);
            return Ok(());
        }

        if their.wrapping_add(1) == ours && state.last_aborted == Some(their) {
            tracing::info!("{} missed the abort of {}, resolving it", peer.addr(), their);
            peer.abort(their, self.config.rpc_timeout()).await?;
            self.admit_member(state, peer);
            return Ok(());
        }

        tracing::info!(
            "{} is behind (next_id {} vs {}), resynchronising",
            peer.addr(),
            their,
            ours
        );
        self.resync(state, peer.as_ref(), ours).await?;
        self.admit_member(state, peer);
        Ok(())
    }

    /// Copy a live participant's store onto `peer` and align its `next_id`.
    async fn resync(&self, state: &mut TxnState, peer: &dyn ParticipantRpc, ours: u32) -> Result<()> {
        let timeout = self.config.snapshot_timeout();
        let sources: Vec<_> = state.registry.values().cloned().collect();
        let mut taken = None;
        for source in sources {
            match source.get_snapshot(timeout).await {
                Ok(snapshot) => {
                    taken = Some((source, snapshot));
                    break;
                }
                // an unreachable source is dead, one that cannot encode its store is not
                Err(e) if e.is_retryable() => self.evict(state, source.addr(), &e),
                Err(e) => tracing::warn!("{} cannot produce a snapshot: {}", source.addr(), e),
            }
        }
        let (source, snapshot) = taken.ok_or(Error::NoParticipants)?;
        let size = snapshot.len() as u64;
        let deleted: Vec<String> = state.deleted_keys.iter().cloned().collect();

        if !peer.recover(snapshot, deleted, timeout).await? {
            return Err(Error::Snapshot(format!("{} rejected the snapshot", peer.addr())));
        }
        peer.set_next_id(ours, self.config.rpc_timeout()).await?;

        self.metrics.resyncs.inc();
        tracing::info!(
            "Resynchronised {} from {} ({})",
            peer.addr(),
            source.addr(),
            crate::common::format_bytes(size)
        );
        Ok(())
    }
}
