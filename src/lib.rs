//! # kv2pc
//!
//! A replicated key-value store with:
//! - Two-phase commit across every reachable replica
//! - Write-ahead logs on the coordinator and on each participant
//! - Heartbeat-driven membership with snapshot resynchronisation
//! - A RESP-style client protocol
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!             clients (*N\r\n$len\r\n...)
//!                       │
//!             ┌─────────▼──────────┐
//!             │    Coordinator     │
//!             │  id allocator, WAL │
//!             │  heartbeat loop    │
//!             └─────────┬──────────┘
//!                       │ PREPARE / COMMIT / ABORT
//!   ┌───────────────────┼───────────────────┐
//!   │                   │                   │
//! ┌─▼────────────┐ ┌────▼─────────┐ ┌───────▼──────┐
//! │ Participant 1│ │ Participant 2│ │ Participant 3│
//! │ WAL + cmd log│ │ WAL + cmd log│ │ WAL + cmd log│
//! │   storage    │ │   storage    │ │   storage    │
//! └──────────────┘ └──────────────┘ └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start participants
//! ```bash
//! kv2pc-participant --config participant1.conf
//! kv2pc-participant --config participant2.conf
//! ```
//!
//! ### Start the coordinator
//! ```bash
//! kv2pc-coord --config coordinator.conf
//! ```
//!
//! ### Use the CLI
//! ```bash
//! kv2pc set CS06142 "Cloud Computing"
//! kv2pc get CS06142
//! kv2pc del CS06142 CS162
//! ```

pub mod common;
pub mod coordinator;
pub mod participant;

// Re-export commonly used types
pub use common::{Command, Config, Error, Reply, Result};
pub use coordinator::{Coordinator, CoordinatorServer};
pub use participant::{Participant, ParticipantServer};
