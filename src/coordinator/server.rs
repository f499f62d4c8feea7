//! Coordinator server

use crate::common::{CoordinatorConfig, DecodeError, Decoder, Reply, Result};
use crate::coordinator::http::create_router;
use crate::coordinator::Coordinator;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const READ_BUF_SIZE: usize = 4096;

pub struct CoordinatorServer {
    config: CoordinatorConfig,
    node_id: String,
}

impl CoordinatorServer {
    pub fn new(config: CoordinatorConfig, node_id: String) -> Self {
        Self { config, node_id }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting coordinator: {}", self.node_id);
        tracing::info!("  Client API: {}", self.config.bind_addr);
        tracing::info!("  WAL path: {}", self.config.wal_path.display());
        tracing::info!("  Participants: {}", self.config.participants.join(", "));

        let coordinator = Arc::new(Coordinator::open(self.config.clone())?);
        coordinator.recover().await?;
        let heartbeat = coordinator.spawn_heartbeat();

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let admin = match self.config.admin_addr {
            Some(addr) => {
                tracing::info!("  Admin API: {}", addr);
                let admin_listener = TcpListener::bind(addr).await?;
                let router = create_router(coordinator.clone());
                Some(tokio::spawn(async move {
                    if let Err(e) = axum::serve(admin_listener, router).await {
                        tracing::error!("Admin server error: {}", e);
                    }
                }))
            }
            None => None,
        };

        tracing::info!("✓ Coordinator ready (next_id {})", coordinator.next_id());

        let result = tokio::select! {
            res = serve_clients(listener, coordinator.clone()) => res,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down coordinator {}", self.node_id);
                Ok(())
            }
        };

        heartbeat.abort();
        if let Some(admin) = admin {
            admin.abort();
        }
        result
    }
}

/// Accept client connections forever.
pub async fn serve_clients(listener: TcpListener, coordinator: Arc<Coordinator>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer, coordinator).await {
                tracing::debug!("Client {} closed: {}", peer, e);
            }
        });
    }
}

/// Serve one client. Commands may be split across reads or pipelined in one.
async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<Coordinator>,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);

    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }

        loop {
            let mut decoder = Decoder::new(&buf);
            let cmd = match decoder.next_command() {
                Ok(cmd) => cmd,
                Err(DecodeError::Incomplete) => break,
                Err(DecodeError::Malformed(msg)) => {
                    tracing::warn!("Malformed request from {}: {}", peer, msg);
                    stream.write_all(&Reply::error().to_vec()).await?;
                    return Ok(());
                }
            };
            let consumed = decoder.position();
            buf.advance(consumed);

            tracing::debug!("{} -> {}", peer, cmd);
            let reply = coordinator.execute(cmd).await;
            stream.write_all(&reply.to_vec()).await?;
        }
    }
}
