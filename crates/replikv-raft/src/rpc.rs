//! Wire protocol
//!
//! Every datagram is a JSON object carrying the envelope fields (`src`,
//! `dst`, `leader`) plus a body tagged by its `type` field. One enum arm per
//! message type, with exactly the fields that message requires; field names
//! follow the wire (`MID`, `lastLogIndex`, `prevLogTerm`, ...).

use crate::log::LogEntry;
use crate::{LogIndex, NodeId, RaftResult, Term};
use serde::{Deserialize, Serialize};

/// Reserved id: addressed to all replicas, or "leader unknown".
pub const BROADCAST: &str = "FFFF";

/// One datagram on the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: NodeId,
    /// Destination replica or client, or [`BROADCAST`]
    pub dst: NodeId,
    /// Sender's best-known leader, or [`BROADCAST`] when unknown
    pub leader: NodeId,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    pub fn to_bytes(&self) -> RaftResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> RaftResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst == BROADCAST
    }
}

/// Message bodies, dispatched by the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Startup announcement, broadcast once
    Hello,

    /// Client read
    Get {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
    },

    /// Client write
    Put {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
        value: String,
    },

    /// Success response to a client; carries the value for reads
    Ok {
        #[serde(rename = "MID")]
        mid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// The request cannot be served here and no leader is known
    Fail {
        #[serde(rename = "MID")]
        mid: String,
    },

    /// The request should be reissued to the leader named in the envelope
    Redirect {
        #[serde(rename = "MID")]
        mid: String,
    },

    /// Vote request from a candidate
    Vote {
        term: Term,
        #[serde(rename = "lastLogIndex")]
        last_log_index: LogIndex,
        #[serde(rename = "lastLogTerm")]
        last_log_term: Term,
    },

    /// Vote response
    #[serde(rename = "response")]
    VoteReply {
        term: Term,
        #[serde(rename = "voteGranted")]
        vote_granted: bool,
    },

    /// Log replication; empty `entries` is a heartbeat
    AppendEntries {
        term: Term,
        #[serde(rename = "prevLogIndex")]
        prev_log_index: LogIndex,
        #[serde(rename = "prevLogTerm")]
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        #[serde(rename = "leaderCommit")]
        leader_commit: LogIndex,
    },

    /// Append accepted; the follower's log now ends just before `nextIndex`
    #[serde(rename = "true")]
    AppendOk {
        term: Term,
        #[serde(rename = "nextIndex")]
        next_index: LogIndex,
    },

    /// Append refused; `nextIndex` hints where the leader should back up to
    #[serde(rename = "false")]
    AppendReject {
        term: Term,
        #[serde(
            rename = "nextIndex",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        next_index: Option<LogIndex>,
    },
}
