//! Configuration for kv2pc components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Role (coordinator or participant)
    pub role: NodeRole,

    /// Coordinator-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    /// Participant-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant: Option<ParticipantConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Participant,
}

/// How hard a WAL append pushes bytes towards the disk before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// flush + fsync on every record
    Always,
    /// flush to the OS on every record
    Interval,
    /// leave it buffered (tests only)
    Never,
}

impl Default for WalSyncPolicy {
    fn default() -> Self {
        WalSyncPolicy::Always
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sled,
    RocksDb,
}

impl Default for StorageBackend {
    fn default() -> Self {
        if cfg!(feature = "sled-backend") {
            StorageBackend::Sled
        } else if cfg!(feature = "rocksdb") {
            StorageBackend::RocksDb
        } else {
            StorageBackend::Memory
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for the client protocol
    pub bind_addr: SocketAddr,

    /// Bind address for the admin HTTP API
    #[serde(default)]
    pub admin_addr: Option<SocketAddr>,

    /// Configured participant addresses (`ip:port`)
    pub participants: Vec<String>,

    /// Coordinator record log
    #[serde(default = "default_coord_wal_path")]
    pub wal_path: PathBuf,

    #[serde(default)]
    pub wal_sync: WalSyncPolicy,

    /// Timeout for GET / PREPARE / COMMIT / ABORT calls
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Timeout for snapshot pull / push during resync
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_ms: u64,

    /// Size of the worker pool serving client connections
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// First sequence id when no WAL exists. Random when unset.
    #[serde(default)]
    pub initial_next_id: Option<u32>,
}

fn default_coord_wal_path() -> PathBuf {
    PathBuf::from("./coord-data/coordinator.wal")
}
fn default_rpc_timeout() -> u64 {
    200
}
fn default_heartbeat_interval() -> u64 {
    500
}
fn default_heartbeat_timeout() -> u64 {
    100
}
fn default_snapshot_timeout() -> u64 {
    5_000
}
fn default_num_workers() -> usize {
    4
}

impl CoordinatorConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            admin_addr: None,
            participants: vec!["127.0.0.1:8001".to_string()],
            wal_path: default_coord_wal_path(),
            wal_sync: WalSyncPolicy::default(),
            rpc_timeout_ms: default_rpc_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            snapshot_timeout_ms: default_snapshot_timeout(),
            num_workers: default_num_workers(),
            initial_next_id: None,
        }
    }
}

/// Participant configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantConfig {
    /// Bind address for the RPC server
    pub bind_addr: SocketAddr,

    /// Storage engine directory
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Directory holding the record log and the command log
    #[serde(default = "default_participant_wal_path")]
    pub wal_path: PathBuf,

    #[serde(default)]
    pub wal_sync: WalSyncPolicy,

    #[serde(default)]
    pub storage: StorageBackend,

    /// How long an out-of-order COMMIT/ABORT waits for its predecessor
    #[serde(default = "default_resolve_wait")]
    pub resolve_wait_ms: u64,

    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./participant-data/db")
}
fn default_participant_wal_path() -> PathBuf {
    PathBuf::from("./participant-data/wal")
}
fn default_resolve_wait() -> u64 {
    1_000
}

impl ParticipantConfig {
    pub fn resolve_wait(&self) -> Duration {
        Duration::from_millis(self.resolve_wait_ms)
    }
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8001)),
            data_path: default_data_path(),
            wal_path: default_participant_wal_path(),
            wal_sync: WalSyncPolicy::default(),
            storage: StorageBackend::default(),
            resolve_wait_ms: default_resolve_wait(),
            num_workers: default_num_workers(),
        }
    }
}

impl Config {
    /// Load a configuration file.
    ///
    /// `.toml` files go through the `config` crate, with `KV2PC__`-prefixed
    /// environment variables layered on top. Anything else is read as the
    /// line-based `.conf` format (see [`Config::parse_conf`]).
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        if is_toml {
            let settings = config::Config::builder()
                .add_source(config::File::from(path))
                .add_source(config::Environment::with_prefix("KV2PC").separator("__"))
                .build()
                .map_err(|e| Error::InvalidConfig(e.to_string()))?;
            let conf: Config = settings
                .try_deserialize()
                .map_err(|e| Error::InvalidConfig(e.to_string()))?;
            conf.validate()?;
            Ok(conf)
        } else {
            let text = std::fs::read_to_string(path)?;
            Self::parse_conf(&text)
        }
    }

    /// Parse the line-based `.conf` format:
    ///
    /// ```text
    /// ! comment
    /// mode coordinator
    /// coordinator_info 127.0.0.1:8080
    /// participant_info 127.0.0.1:8001
    /// participant_info 127.0.0.1:8002
    /// ```
    ///
    /// In participant mode the first `participant_info` is the node's own address.
    pub fn parse_conf(text: &str) -> Result<Self> {
        let mut role = None;
        let mut coordinator_info: Option<SocketAddr> = None;
        let mut participant_info: Vec<String> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('!') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let name = parts.next().unwrap_or_default();
            let value = parts.next().ok_or_else(|| {
                Error::InvalidConfig(format!("line {}: missing value for '{}'", lineno + 1, name))
            })?;

            match name {
                "mode" => {
                    role = Some(match value {
                        "coordinator" => NodeRole::Coordinator,
                        "participant" => NodeRole::Participant,
                        other => {
                            return Err(Error::InvalidConfig(format!(
                                "line {}: unknown mode '{}'",
                                lineno + 1,
                                other
                            )))
                        }
                    })
                }
                "coordinator_info" => {
                    coordinator_info = Some(value.parse().map_err(|_| {
                        Error::InvalidConfig(format!("line {}: bad address '{}'", lineno + 1, value))
                    })?)
                }
                "participant_info" => participant_info.push(value.to_string()),
                other => {
                    tracing::warn!("Ignoring unknown config option '{}'", other);
                }
            }
        }

        let role = role.ok_or_else(|| Error::InvalidConfig("missing 'mode'".into()))?;
        let conf = match role {
            NodeRole::Coordinator => Config {
                node_id: "coordinator".to_string(),
                role,
                coordinator: Some(CoordinatorConfig {
                    bind_addr: coordinator_info.ok_or_else(|| {
                        Error::InvalidConfig("missing 'coordinator_info'".into())
                    })?,
                    participants: participant_info,
                    ..Default::default()
                }),
                participant: None,
                log_level: default_log_level(),
            },
            NodeRole::Participant => {
                let own = participant_info.first().ok_or_else(|| {
                    Error::InvalidConfig("missing 'participant_info'".into())
                })?;
                let bind_addr: SocketAddr = own.parse().map_err(|_| {
                    Error::InvalidConfig(format!("bad participant address '{}'", own))
                })?;
                let base = PathBuf::from(format!("./participant-{}", bind_addr.port()));
                Config {
                    node_id: format!("participant-{}", bind_addr.port()),
                    role,
                    coordinator: None,
                    participant: Some(ParticipantConfig {
                        bind_addr,
                        data_path: base.join("db"),
                        wal_path: base.join("wal"),
                        ..Default::default()
                    }),
                    log_level: default_log_level(),
                }
            }
        };

        conf.validate()?;
        Ok(conf)
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        match self.role {
            NodeRole::Coordinator => {
                let coord = self.coordinator.as_ref().ok_or_else(|| {
                    Error::InvalidConfig("coordinator role without [coordinator] section".into())
                })?;
                if coord.participants.is_empty() {
                    return Err(Error::InvalidConfig("no participants configured".into()));
                }
                if coord.num_workers == 0 {
                    return Err(Error::InvalidConfig("num_workers must be > 0".into()));
                }
            }
            NodeRole::Participant => {
                let part = self.participant.as_ref().ok_or_else(|| {
                    Error::InvalidConfig("participant role without [participant] section".into())
                })?;
                if part.num_workers == 0 {
                    return Err(Error::InvalidConfig("num_workers must be > 0".into()));
                }
            }
        }
        Ok(())
    }
}
