//! Coordinator node
//!
//! Assigns sequence ids, drives two-phase commit across the live participants,
//! tracks membership through heartbeats and recovers from its own log.

pub mod http;
pub mod membership;
pub mod participant_client;
pub mod recovery;
pub mod server;
pub mod txn;

pub use participant_client::ParticipantClient;
pub use server::CoordinatorServer;
pub use txn::{Coordinator, CoordinatorStatus};
