//! Coordinator binary

use anyhow::Context;
use clap::Parser;
use kv2pc::common::{Config, NodeRole};
use kv2pc::CoordinatorServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kv2pc-coord")]
#[command(about = "kv2pc two-phase commit coordinator")]
#[command(version)]
struct Cli {
    /// Configuration file (`.toml`, or the line-based `.conf` format)
    #[arg(long, short)]
    config: PathBuf,

    /// Override the client bind address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override the admin HTTP bind address
    #[arg(long)]
    admin: Option<SocketAddr>,

    /// Override the coordinator log path
    #[arg(long)]
    wal: Option<PathBuf>,

    /// Override the participant list (comma-separated)
    #[arg(long, value_delimiter = ',')]
    participants: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if config.role != NodeRole::Coordinator {
        anyhow::bail!("{} does not describe a coordinator", cli.config.display());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut coord_config = config
        .coordinator
        .context("missing coordinator section")?;
    // CLI has priority over the file
    if let Some(bind) = cli.bind {
        coord_config.bind_addr = bind;
    }
    if let Some(admin) = cli.admin {
        coord_config.admin_addr = Some(admin);
    }
    if let Some(wal) = cli.wal {
        coord_config.wal_path = wal;
    }
    if !cli.participants.is_empty() {
        coord_config.participants = cli.participants;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(coord_config.num_workers)
        .enable_all()
        .build()?;

    runtime.block_on(CoordinatorServer::new(coord_config, config.node_id).serve())?;
    Ok(())
}
