//! Raft consensus core for the replikv replicated key-value store
//!
//! This crate implements the replica state machine: leader election, log
//! replication, commit advancement and application of client commands to the
//! key-value map. It is transport-agnostic: the replica consumes decoded
//! [`rpc::Envelope`] values and produces envelopes to send, so the datagram
//! socket, argument parsing and logging setup live in the `replikv-node`
//! binary.

pub mod election;
pub mod log;
pub mod node;
pub mod rpc;
pub mod state;
pub mod store;

pub use log::{Command, LogEntry, RaftLog};
pub use node::{Replica, ReplicaConfig, HEARTBEAT_INTERVAL};
pub use rpc::{Body, Envelope, BROADCAST};
pub use state::{LeaderState, PersistentState, RaftRole, VolatileState};
pub use store::KvStore;

use thiserror::Error;

/// Result type for consensus operations
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors that can occur during consensus operations
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("invalid log index: {0}")]
    InvalidLogIndex(u64),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Replica identifier type
pub type NodeId = String;

/// Term number in Raft consensus
pub type Term = u64;

/// Log index in the replicated log
pub type LogIndex = u64;
