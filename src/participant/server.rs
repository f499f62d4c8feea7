//! Participant RPC server

use crate::common::rpc::{read_frame, write_frame};
use crate::common::{ParticipantConfig, Request, Response, Result};
use crate::participant::rpc::dispatch;
use crate::participant::Participant;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

pub struct ParticipantServer {
    config: ParticipantConfig,
    node_id: String,
}

impl ParticipantServer {
    pub fn new(config: ParticipantConfig, node_id: String) -> Self {
        Self { config, node_id }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting participant: {}", self.node_id);
        tracing::info!("  RPC: {}", self.config.bind_addr);
        tracing::info!("  Data path: {}", self.config.data_path.display());
        tracing::info!("  WAL path: {}", self.config.wal_path.display());
        tracing::info!("  Storage: {:?}", self.config.storage);

        let config = self.config.clone();
        let participant =
            Arc::new(tokio::task::spawn_blocking(move || Participant::open(&config)).await??);

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("✓ Participant ready");

        tokio::select! {
            res = serve_rpc(listener, participant) => res,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down participant {}", self.node_id);
                Ok(())
            }
        }
    }
}

/// Accept connections forever, answering each request frame in order.
pub async fn serve_rpc(listener: TcpListener, participant: Arc<Participant>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let participant = participant.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, participant).await {
                tracing::debug!("Connection from {} closed: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    participant: Arc<Participant>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    tracing::debug!("Coordinator connected from {}", peer);

    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        let participant = participant.clone();
        let response = tokio::task::spawn_blocking(move || dispatch(&participant, request))
            .await
            .unwrap_or_else(|e| Response::Fault(format!("dispatch task failed: {}", e)));
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}
