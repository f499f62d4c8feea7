//! Client commands accepted by the store

use serde::{Deserialize, Serialize};

/// Longest key or value a command may carry. Snapshot entries store lengths in 16 bits.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// A decoded client command.
///
/// Only the mutating commands carry a sequence `id`; it is assigned exactly once
/// by the coordinator before the command enters two-phase commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Get { key: String },
    Set { id: u32, key: String, value: Vec<u8> },
    Del { id: u32, keys: Vec<String> },
}

impl Command {
    pub fn get(key: impl Into<String>) -> Self {
        Command::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Command::Set {
            id: 0,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command::Del {
            id: 0,
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Sequence id, `None` for reads.
    pub fn id(&self) -> Option<u32> {
        match self {
            Command::Get { .. } => None,
            Command::Set { id, .. } | Command::Del { id, .. } => Some(*id),
        }
    }

    /// Stamp the coordinator-assigned id. No-op on reads.
    pub fn with_id(mut self, new_id: u32) -> Self {
        match &mut self {
            Command::Get { .. } => {}
            Command::Set { id, .. } | Command::Del { id, .. } => *id = new_id,
        }
        self
    }

    /// Length of the first key or value longer than [`MAX_FIELD_LEN`].
    pub fn oversized_field(&self) -> Option<usize> {
        let lens: Vec<usize> = match self {
            Command::Get { key } => vec![key.len()],
            Command::Set { key, value, .. } => vec![key.len(), value.len()],
            Command::Del { keys, .. } => keys.iter().map(String::len).collect(),
        };
        lens.into_iter().find(|len| *len > MAX_FIELD_LEN)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Get { key } => write!(f, "GET {}", key),
            Command::Set { id, key, value } => {
                write!(f, "SET#{} {} ({} bytes)", id, key, value.len())
            }
            Command::Del { id, keys } => write!(f, "DEL#{} {}", id, keys.join(" ")),
        }
    }
}
