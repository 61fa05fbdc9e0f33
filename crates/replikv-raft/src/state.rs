//! Replica state management
//!
//! Implements the state a replica carries through role transitions:
//! - Persistent state (term, vote, log)
//! - Volatile state (commit index, last applied)
//! - Leader-specific state (next index, match index)

use crate::log::RaftLog;
use crate::{LogIndex, NodeId, Term};
use std::collections::HashMap;

/// The three roles a replica can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    /// Responds to appends from leaders and vote requests from candidates
    Follower,
    /// Attempts to become leader
    Candidate,
    /// Handles client requests and replicates the log
    Leader,
}

impl RaftRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, RaftRole::Leader)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, RaftRole::Candidate)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, RaftRole::Follower)
    }
}

/// State every replica carries across role changes.
///
/// Named for the durability class it would have with stable storage; this
/// deployment keeps it in memory.
#[derive(Debug, Clone)]
pub struct PersistentState {
    /// Latest term seen (initialized to 0, increases monotonically)
    pub current_term: Term,

    /// Replica that received our vote in the current term (or None)
    pub voted_for: Option<NodeId>,

    /// The replicated log
    pub log: RaftLog,
}

impl PersistentState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
        }
    }

    /// Start a new term of our own; the vote resets with the term.
    pub fn increment_term(&mut self) {
        self.current_term += 1;
        self.voted_for = None;
    }

    /// Adopt a higher term. The vote resets only when the term actually
    /// advances; an equal term keeps any vote already cast.
    pub fn update_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            true
        } else {
            false
        }
    }

    /// Cast our vote for the current term.
    pub fn vote_for(&mut self, candidate: NodeId) {
        self.voted_for = Some(candidate);
    }

    /// Whether a vote can still go to the given candidate this term.
    pub fn can_vote_for(&self, candidate: &NodeId) -> bool {
        match &self.voted_for {
            None => true,
            Some(voted) => voted == candidate,
        }
    }
}

impl Default for PersistentState {
    fn default() -> Self {
        Self::new()
    }
}

/// Volatile state on all replicas
#[derive(Debug, Clone)]
pub struct VolatileState {
    /// Highest log index known to be committed (increases monotonically)
    pub commit_index: LogIndex,

    /// Highest log index applied to the K/V map (increases monotonically,
    /// never past `commit_index`)
    pub last_applied: LogIndex,
}

impl VolatileState {
    pub fn new() -> Self {
        Self {
            commit_index: 0,
            last_applied: 0,
        }
    }

    /// Raise the commit index; lower values are ignored.
    pub fn update_commit_index(&mut self, index: LogIndex) {
        if index > self.commit_index {
            self.commit_index = index;
        }
    }
}

impl Default for VolatileState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-peer replication cursors, reinitialized after each election win
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// For each peer, index of the next log entry to send
    pub next_index: HashMap<NodeId, LogIndex>,

    /// For each peer, highest log index known to be replicated there
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    /// Cursors for a fresh leader: next = just past our log, match = 0.
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in peers {
            next_index.insert(peer.clone(), last_log_index + 1);
            match_index.insert(peer.clone(), 0);
        }
        Self {
            next_index,
            match_index,
        }
    }

    pub fn next_index_for(&self, peer: &NodeId) -> Option<LogIndex> {
        self.next_index.get(peer).copied()
    }

    pub fn match_index_for(&self, peer: &NodeId) -> Option<LogIndex> {
        self.match_index.get(peer).copied()
    }

    /// Record a successful append: the follower's log now runs through
    /// `next - 1`. The match cursor never moves backwards within a term.
    pub fn update_replication(&mut self, peer: &NodeId, next: LogIndex) {
        self.next_index.insert(peer.clone(), next.max(1));
        let matched = self.match_index.entry(peer.clone()).or_insert(0);
        *matched = (*matched).max(next.saturating_sub(1));
    }

    /// Back off after a refusal, to the follower's hint when it gave one.
    pub fn back_off(&mut self, peer: &NodeId, hint: Option<LogIndex>) {
        let current = self.next_index.get(peer).copied().unwrap_or(1);
        let next = hint.unwrap_or_else(|| current.saturating_sub(1)).max(1);
        self.next_index.insert(peer.clone(), next);
    }

    /// How many peers have replicated through `index`.
    pub fn match_count(&self, index: LogIndex) -> usize {
        self.match_index.values().filter(|&&m| m >= index).count()
    }
}
