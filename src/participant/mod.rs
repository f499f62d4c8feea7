//! Participant (replica) node
//!
//! Votes on and applies transactions driven by the coordinator, keeping its own
//! record log and command log for crash recovery.

pub mod cmd_log;
pub mod executor;
pub mod rpc;
pub mod server;
pub mod snapshot;

pub use executor::Participant;
pub use rpc::{dispatch, LocalParticipant};
pub use server::ParticipantServer;
