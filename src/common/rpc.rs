//! Participant RPC surface
//!
//! Every call is one request frame answered by one response frame. A frame is a
//! 4-byte big-endian length followed by a bincode payload.

use crate::common::{Command, Error, Reply, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Get { key: String },
    PrepareSet(Command),
    PrepareDel(Command),
    Commit { id: u32 },
    Abort { id: u32 },
    NextId,
    SetNextId { id: u32 },
    Heartbeat,
    GetSnapshot,
    Recover {
        snapshot: Vec<u8>,
        deleted_keys: Vec<String>,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Get { .. } => "GET",
            Request::PrepareSet(_) => "PREPARE_SET",
            Request::PrepareDel(_) => "PREPARE_DEL",
            Request::Commit { .. } => "COMMIT",
            Request::Abort { .. } => "ABORT",
            Request::NextId => "NEXT_ID",
            Request::SetNextId { .. } => "SET_NEXT_ID",
            Request::Heartbeat => "HEARTBEAT",
            Request::GetSnapshot => "GET_SNAPSHOT",
            Request::Recover { .. } => "RECOVER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Value(Option<Vec<u8>>),
    Vote(bool),
    /// `None` when the id was already resolved.
    Committed(Option<Reply>),
    Ack(bool),
    NextId(u32),
    Unit,
    Snapshot(Vec<u8>),
    /// The participant hit a local fault serving the request.
    Fault(String),
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` on a clean EOF before the header.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {} bytes exceeds limit", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

fn unexpected(req: &str, resp: Response) -> Error {
    match resp {
        Response::Fault(msg) => Error::Rpc(msg),
        other => Error::Internal(format!("unexpected response to {}: {:?}", req, other)),
    }
}

/// Handle on one participant, as seen by the coordinator.
///
/// Implementors only provide [`ParticipantRpc::call`]; the typed helpers map the
/// response variants and turn a remote `Fault` into [`Error::Rpc`].
#[async_trait]
pub trait ParticipantRpc: Send + Sync {
    /// Address this handle talks to.
    fn addr(&self) -> &str;

    /// Issue one request, failing with [`Error::Timeout`] once `timeout` elapses.
    async fn call(&self, request: Request, timeout: Duration) -> Result<Response>;

    async fn get(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.call(Request::Get { key: key.to_string() }, timeout).await? {
            Response::Value(v) => Ok(v),
            other => Err(unexpected("GET", other)),
        }
    }

    /// Route to `PREPARE_SET` or `PREPARE_DEL` by command kind.
    async fn prepare(&self, cmd: &Command, timeout: Duration) -> Result<bool> {
        let request = match cmd {
            Command::Set { .. } => Request::PrepareSet(cmd.clone()),
            Command::Del { .. } => Request::PrepareDel(cmd.clone()),
            Command::Get { .. } => {
                return Err(Error::Internal(format!("cannot prepare {}", cmd)))
            }
        };
        match self.call(request, timeout).await? {
            Response::Vote(v) => Ok(v),
            other => Err(unexpected("PREPARE", other)),
        }
    }

    async fn commit(&self, id: u32, timeout: Duration) -> Result<Option<Reply>> {
        match self.call(Request::Commit { id }, timeout).await? {
            Response::Committed(r) => Ok(r),
            other => Err(unexpected("COMMIT", other)),
        }
    }

    async fn abort(&self, id: u32, timeout: Duration) -> Result<bool> {
        match self.call(Request::Abort { id }, timeout).await? {
            Response::Ack(ok) => Ok(ok),
            other => Err(unexpected("ABORT", other)),
        }
    }

    async fn next_id(&self, timeout: Duration) -> Result<u32> {
        match self.call(Request::NextId, timeout).await? {
            Response::NextId(id) => Ok(id),
            other => Err(unexpected("NEXT_ID", other)),
        }
    }

    async fn set_next_id(&self, id: u32, timeout: Duration) -> Result<()> {
        match self.call(Request::SetNextId { id }, timeout).await? {
            Response::Unit => Ok(()),
            other => Err(unexpected("SET_NEXT_ID", other)),
        }
    }

    async fn heartbeat(&self, timeout: Duration) -> Result<()> {
        match self.call(Request::Heartbeat, timeout).await? {
            Response::Unit => Ok(()),
            other => Err(unexpected("HEARTBEAT", other)),
        }
    }

    async fn get_snapshot(&self, timeout: Duration) -> Result<Vec<u8>> {
        match self.call(Request::GetSnapshot, timeout).await? {
            Response::Snapshot(bytes) => Ok(bytes),
            other => Err(unexpected("GET_SNAPSHOT", other)),
        }
    }

    async fn recover(
        &self,
        snapshot: Vec<u8>,
        deleted_keys: Vec<String>,
        timeout: Duration,
    ) -> Result<bool> {
        match self
            .call(
                Request::Recover {
                    snapshot,
                    deleted_keys,
                },
                timeout,
            )
            .await?
        {
            Response::Ack(ok) => Ok(ok),
            other => Err(unexpected("RECOVER", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = Request::PrepareDel(Command::del(["a", "b"]).with_id(4));

        write_frame(&mut a, &req).await.unwrap();
        write_frame(&mut a, &Request::Heartbeat).await.unwrap();
        drop(a);

        let got: Option<Request> = read_frame(&mut b).await.unwrap();
        assert_eq!(got, Some(req));
        let got: Option<Request> = read_frame(&mut b).await.unwrap();
        assert_eq!(got, Some(Request::Heartbeat));
        let eof: Option<Request> = read_frame(&mut b).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(MAX_FRAME_LEN as u32 + 1).await.unwrap();
        let res: Result<Option<Response>> = read_frame(&mut b).await;
        assert!(matches!(res, Err(Error::Protocol(_))));
    }

    struct Canned(Response);

    #[async_trait]
    impl ParticipantRpc for Canned {
        fn addr(&self) -> &str {
            "canned"
        }
        async fn call(&self, _request: Request, _timeout: Duration) -> Result<Response> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_fault_maps_to_rpc_error() {
        let t = Duration::from_millis(10);
        let faulty = Canned(Response::Fault("commit 9 ahead of 3".into()));
        assert!(matches!(faulty.commit(9, t).await, Err(Error::Rpc(_))));

        let wrong = Canned(Response::Unit);
        assert!(matches!(wrong.prepare(&Command::set("k", "v"), t).await, Err(Error::Internal(_))));
        assert!(wrong.prepare(&Command::get("k"), t).await.is_err());
        assert!(wrong.heartbeat(t).await.is_ok());
    }
}
