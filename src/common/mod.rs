//! Common types shared by the coordinator and participants

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rpc;
pub mod storage;
pub mod utils;
pub mod wal;

pub use codec::{encode_command, DecodeError, Decoder, Reply};
pub use command::Command;
pub use config::{
    Config, CoordinatorConfig, NodeRole, ParticipantConfig, StorageBackend, WalSyncPolicy,
};
pub use error::{Error, Result};
pub use rpc::{ParticipantRpc, Request, Response};
pub use storage::Storage;
pub use utils::{crc32, format_bytes, parse_duration};
pub use wal::{Record, RecordStatus, Wal};
