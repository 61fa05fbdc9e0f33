//! Leader election
//!
//! Implements the election machinery:
//! - Randomized election deadlines, drawn from one of two ranges
//! - Vote accounting with a strict-majority quorum
//! - The vote-granting rule

use crate::{LogIndex, NodeId, Term};
use rand::Rng;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Timeout range while no leader is known, in milliseconds.
pub const NO_LEADER_TIMEOUT_MS: (u64, u64) = (150, 300);

/// Timeout range while a leader is known, in milliseconds. Longer, so a
/// healthy leader's heartbeats comfortably suppress elections.
pub const KNOWN_LEADER_TIMEOUT_MS: (u64, u64) = (250, 400);

fn draw_timeout((min_ms, max_ms): (u64, u64)) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..max_ms))
}

/// Election timer holding an absolute deadline.
///
/// The deadline is re-drawn on every reset; which range applies depends on
/// whether a leader is currently known. Time is always supplied by the
/// caller, so the timer is deterministic under test.
#[derive(Debug)]
pub struct ElectionTimer {
    deadline: Instant,
}

impl ElectionTimer {
    /// A fresh replica knows no leader, so the first draw uses the
    /// no-leader range.
    pub fn new(now: Instant) -> Self {
        Self {
            deadline: now + draw_timeout(NO_LEADER_TIMEOUT_MS),
        }
    }

    /// Re-draw the deadline from the range matching the leader situation.
    pub fn reset(&mut self, now: Instant, leader_known: bool) {
        let range = if leader_known {
            KNOWN_LEADER_TIMEOUT_MS
        } else {
            NO_LEADER_TIMEOUT_MS
        };
        self.deadline = now + draw_timeout(range);
    }

    pub fn is_elapsed(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Vote accounting for one election
#[derive(Debug)]
pub struct VoteTracker {
    votes_received: BTreeSet<NodeId>,
    quorum_size: usize,
}

impl VoteTracker {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            votes_received: BTreeSet::new(),
            quorum_size: cluster_size / 2 + 1,
        }
    }

    /// Record a vote; duplicates from the same replica count once.
    pub fn record_vote(&mut self, replica: NodeId) {
        self.votes_received.insert(replica);
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size
    }

    pub fn vote_count(&self) -> usize {
        self.votes_received.len()
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    pub fn reset(&mut self) {
        self.votes_received.clear();
    }
}

/// Election timer plus the votes of the election in progress
#[derive(Debug)]
pub struct ElectionState {
    pub timer: ElectionTimer,
    pub votes: VoteTracker,
}

impl ElectionState {
    pub fn new(cluster_size: usize, now: Instant) -> Self {
        Self {
            timer: ElectionTimer::new(now),
            votes: VoteTracker::new(cluster_size),
        }
    }

    /// Begin a candidacy: only our own vote so far, fresh no-leader
    /// deadline.
    pub fn start_election(&mut self, self_id: &NodeId, now: Instant) {
        self.votes.reset();
        self.votes.record_vote(self_id.clone());
        self.timer.reset(now, false);
    }

    pub fn reset_timer(&mut self, now: Instant, leader_known: bool) {
        self.timer.reset(now, leader_known);
    }

    pub fn should_start_election(&self, now: Instant) -> bool {
        self.timer.is_elapsed(now)
    }

    /// Record a vote and report whether it completes a quorum.
    pub fn record_vote(&mut self, replica: NodeId) -> bool {
        self.votes.record_vote(replica);
        self.votes.has_quorum()
    }
}

/// Vote request validation
pub struct VoteValidator;

impl VoteValidator {
    /// Whether a vote request should be granted.
    ///
    /// Grant only if all of:
    /// 1. the candidate's term is at least ours,
    /// 2. we have not voted for anyone else this term,
    /// 3. our last log index is no greater than the candidate's, and
    /// 4. our last log term is no greater than the candidate's.
    ///
    /// Both log conditions must permit; ties on both are grantable.
    pub fn should_grant_vote(
        receiver_term: Term,
        receiver_voted_for: &Option<NodeId>,
        receiver_last_log_index: LogIndex,
        receiver_last_log_term: Term,
        candidate: &NodeId,
        candidate_term: Term,
        candidate_last_log_index: LogIndex,
        candidate_last_log_term: Term,
    ) -> bool {
        if candidate_term < receiver_term {
            return false;
        }

        let can_vote = match receiver_voted_for {
            None => true,
            Some(voted) => voted == candidate,
        };
        if !can_vote {
            return false;
        }

        receiver_last_log_index <= candidate_last_log_index
            && receiver_last_log_term <= candidate_last_log_term
    }
}
