//! Participant binary

use anyhow::Context;
use clap::Parser;
use kv2pc::common::{Config, NodeRole, StorageBackend};
use kv2pc::ParticipantServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kv2pc-participant")]
#[command(about = "kv2pc participant replica")]
#[command(version)]
struct Cli {
    /// Configuration file (`.toml`, or the line-based `.conf` format)
    #[arg(long, short)]
    config: PathBuf,

    /// Override the RPC bind address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override the storage directory
    #[arg(long)]
    data: Option<PathBuf>,

    /// Override the log directory
    #[arg(long)]
    wal: Option<PathBuf>,

    /// Override the storage engine (memory, sled, rocksdb)
    #[arg(long, value_parser = parse_backend)]
    storage: Option<StorageBackend>,
}

fn parse_backend(s: &str) -> Result<StorageBackend, String> {
    match s {
        "memory" => Ok(StorageBackend::Memory),
        "sled" => Ok(StorageBackend::Sled),
        "rocksdb" => Ok(StorageBackend::RocksDb),
        other => Err(format!("unknown storage backend '{}'", other)),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if config.role != NodeRole::Participant {
        anyhow::bail!("{} does not describe a participant", cli.config.display());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut part_config = config
        .participant
        .context("missing participant section")?;
    if let Some(bind) = cli.bind {
        part_config.bind_addr = bind;
    }
    if let Some(data) = cli.data {
        part_config.data_path = data;
    }
    if let Some(wal) = cli.wal {
        part_config.wal_path = wal;
    }
    if let Some(storage) = cli.storage {
        part_config.storage = storage;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(part_config.num_workers)
        .enable_all()
        .build()?;

    runtime.block_on(ParticipantServer::new(part_config, config.node_id).serve())?;
    Ok(())
}
