use crate::common::rpc::{read_frame, write_frame};
use crate::common::{Error, ParticipantRpc, Request, Response, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// TCP client for one participant.
///
/// Connects lazily and keeps one connection with at most one call in flight.
/// Any failure or timeout drops the connection, abandoning whatever was in flight;
/// the next call reconnects.
pub struct ParticipantClient {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
}

impl ParticipantClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    async fn round_trip(&self, conn: &mut Option<TcpStream>, request: &Request) -> Result<Response> {
        if conn.is_none() {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| Error::ConnectionFailed(format!("{}: {}", self.addr, e)))?;
            stream.set_nodelay(true)?;
            *conn = Some(stream);
        }
        let stream = conn
            .as_mut()
            .ok_or_else(|| Error::ConnectionFailed(self.addr.clone()))?;

        write_frame(stream, request).await?;
        read_frame(stream)
            .await?
            .ok_or_else(|| Error::ConnectionFailed(format!("{}: connection closed", self.addr)))
    }
}

#[async_trait]
impl ParticipantRpc for ParticipantClient {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        let mut conn = self.conn.lock().await;
        let name = request.name();

        let result = tokio::time::timeout(timeout, self.round_trip(&mut conn, &request)).await;
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                *conn = None;
                Err(match e {
                    Error::Io(io) => Error::ConnectionFailed(format!("{}: {}", self.addr, io)),
                    other => other,
                })
            }
            Err(_) => {
                *conn = None;
                Err(Error::Timeout(format!(
                    "{} to {} after {:?}",
                    name, self.addr, timeout
                )))
            }
        }
    }
}
