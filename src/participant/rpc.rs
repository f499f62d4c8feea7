//! Request dispatch for a participant
//!
//! One `match` maps every RPC onto the executor. Faults raised by the executor
//! are reported back as `Response::Fault`; the participant keeps serving.

use crate::common::{Command, Error, ParticipantRpc, Request, Response, Result};
use crate::participant::Participant;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Run one request against `participant`. Blocking: call it off the async runtime.
pub fn dispatch(participant: &Participant, request: Request) -> Response {
    let name = request.name();
    let result = match request {
        Request::Get { key } => participant.get(&key).map(Response::Value),
        Request::PrepareSet(cmd @ Command::Set { .. }) => {
            participant.prepare(cmd).map(Response::Vote)
        }
        Request::PrepareDel(cmd @ Command::Del { .. }) => {
            participant.prepare(cmd).map(Response::Vote)
        }
        Request::PrepareSet(cmd) | Request::PrepareDel(cmd) => Err(Error::Inconsistent(
            format!("{} carries mismatched command {}", name, cmd),
        )),
        Request::Commit { id } => participant.commit(id).map(Response::Committed),
        Request::Abort { id } => participant.abort(id).map(Response::Ack),
        Request::NextId => participant.next_id().map(Response::NextId),
        Request::SetNextId { id } => participant.set_next_id(id).map(|_| Response::Unit),
        Request::Heartbeat => participant.heartbeat().map(|_| Response::Unit),
        Request::GetSnapshot => participant.snapshot().map(Response::Snapshot),
        Request::Recover {
            snapshot,
            deleted_keys,
        } => participant
            .recover(&snapshot, &deleted_keys)
            .map(Response::Ack),
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            if e.is_fatal() {
                tracing::error!("{} failed: {}", name, e);
            } else {
                tracing::warn!("{} failed: {}", name, e);
            }
            Response::Fault(e.to_string())
        }
    }
}

/// In-process handle to a participant.
///
/// Calls run on tokio's blocking pool exactly like the TCP server would run them.
/// The handle can be taken down and brought back with a reopened participant,
/// which is how crashes and restarts are simulated without sockets.
pub struct LocalParticipant {
    addr: String,
    inner: RwLock<Option<Arc<Participant>>>,
}

impl LocalParticipant {
    pub fn new(addr: impl Into<String>, participant: Arc<Participant>) -> Self {
        Self {
            addr: addr.into(),
            inner: RwLock::new(Some(participant)),
        }
    }

    /// Make every following call fail as if the process had died.
    pub fn crash(&self) -> Result<()> {
        *self.inner.write()? = None;
        Ok(())
    }

    /// Bring the handle back with a freshly opened participant.
    pub fn restart(&self, participant: Arc<Participant>) -> Result<()> {
        *self.inner.write()? = Some(participant);
        Ok(())
    }

    pub fn participant(&self) -> Option<Arc<Participant>> {
        self.inner.read().ok().and_then(|p| p.clone())
    }
}

#[async_trait]
impl ParticipantRpc for LocalParticipant {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        let participant = self
            .participant()
            .ok_or_else(|| Error::ConnectionFailed(self.addr.clone()))?;

        let task = tokio::task::spawn_blocking(move || dispatch(&participant, request));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Error::Internal(format!("dispatch task failed: {}", e))),
            Err(_) => Err(Error::Timeout(format!("{} after {:?}", self.addr, timeout))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Reply, Storage, WalSyncPolicy};
    use tempfile::tempdir;

    fn participant(dir: &std::path::Path) -> Arc<Participant> {
        Arc::new(
            Participant::open_with_storage(
                Storage::new_memory(),
                dir,
                WalSyncPolicy::Never,
                Duration::from_millis(50),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_dispatch_table() {
        let dir = tempdir().unwrap();
        let p = participant(dir.path());

        let set = Command::set("k", "v").with_id(0);
        assert_eq!(dispatch(&p, Request::PrepareSet(set.clone())), Response::Vote(true));
        assert!(matches!(
            dispatch(&p, Request::PrepareDel(set)),
            Response::Fault(_)
        ));
        assert_eq!(
            dispatch(&p, Request::Commit { id: 0 }),
            Response::Committed(Some(Reply::ok()))
        );
        assert_eq!(
            dispatch(&p, Request::Get { key: "k".into() }),
            Response::Value(Some(b"v".to_vec()))
        );
        assert_eq!(dispatch(&p, Request::NextId), Response::NextId(1));
        assert_eq!(dispatch(&p, Request::Heartbeat), Response::Unit);
        assert!(matches!(
            dispatch(&p, Request::Commit { id: 7 }),
            Response::Fault(_)
        ));
        // still serving after a fault
        assert_eq!(dispatch(&p, Request::SetNextId { id: 9 }), Response::Unit);
        assert_eq!(dispatch(&p, Request::NextId), Response::NextId(9));
    }

    #[tokio::test]
    async fn test_local_handle_crash_and_restart() {
        let dir = tempdir().unwrap();
        let handle = LocalParticipant::new("local:1", participant(dir.path()));
        let t = Duration::from_secs(1);

        handle.heartbeat(t).await.unwrap();
        handle.crash().unwrap();
        let err = handle.heartbeat(t).await.unwrap_err();
        assert!(err.is_retryable());

        handle.restart(participant(dir.path())).unwrap();
        assert_eq!(handle.next_id(t).await.unwrap(), 0);
    }
}
