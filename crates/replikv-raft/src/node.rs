//! The replica
//!
//! Coordinates all consensus components: role transitions, leader election,
//! log replication, commit advancement, and client request handling. The
//! replica is sans-IO: [`Replica::handle`] consumes one decoded envelope and
//! returns the envelopes to send, [`Replica::tick`] fires the timers, and
//! [`Replica::next_wake`] tells the event loop how long it may block on the
//! transport.

use crate::election::{ElectionState, VoteValidator};
use crate::log::Command;
use crate::rpc::{Body, Envelope, BROADCAST};
use crate::state::{LeaderState, PersistentState, RaftRole, VolatileState};
use crate::store::KvStore;
use crate::{LogEntry, LogIndex, NodeId, RaftError, RaftResult, Term};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Leader heartbeat cadence: an empty append-entries goes out at least this
/// often.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);

/// Cluster membership, fixed at startup.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// This replica's id
    pub id: NodeId,
    /// Ids of the other replicas (excluding self)
    pub peers: Vec<NodeId>,
}

impl ReplicaConfig {
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self { id, peers }
    }
}

/// A single replica of the replicated key-value store.
pub struct Replica {
    config: ReplicaConfig,
    persistent: PersistentState,
    volatile: VolatileState,
    role: RaftRole,
    /// Best known leader; `None` is the unknown sentinel
    leader_hint: Option<NodeId>,
    store: KvStore,
    election: ElectionState,
    /// Replication cursors, present only while leader
    leader_state: Option<LeaderState>,
    last_heartbeat: Instant,
}

impl Replica {
    pub fn new(config: ReplicaConfig, now: Instant) -> RaftResult<Self> {
        if config.id == BROADCAST || config.peers.iter().any(|p| p == BROADCAST) {
            return Err(RaftError::Config(format!(
                "{BROADCAST} is reserved for broadcast"
            )));
        }
        if config.peers.iter().any(|p| p == &config.id) {
            return Err(RaftError::Config(
                "peer list must not contain the replica's own id".to_string(),
            ));
        }
        let cluster_size = config.peers.len() + 1;
        Ok(Self {
            persistent: PersistentState::new(),
            volatile: VolatileState::new(),
            role: RaftRole::Follower,
            leader_hint: None,
            store: KvStore::new(),
            election: ElectionState::new(cluster_size, now),
            leader_state: None,
            last_heartbeat: now,
            config,
        })
    }

    // -- introspection --

    pub fn id(&self) -> &NodeId {
        &self.config.id
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    pub fn leader_hint(&self) -> Option<&NodeId> {
        self.leader_hint.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.volatile.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.volatile.last_applied
    }

    pub fn log(&self) -> &crate::RaftLog {
        &self.persistent.log
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Startup announcement for the transport to broadcast.
    pub fn hello(&self) -> Envelope {
        self.envelope(BROADCAST.to_string(), Body::Hello)
    }

    /// The next instant at which [`Replica::tick`] has work to do. The
    /// event loop should block on the transport no longer than this.
    pub fn next_wake(&self) -> Instant {
        if self.role.is_leader() {
            self.last_heartbeat + HEARTBEAT_INTERVAL
        } else {
            self.election.timer.deadline()
        }
    }

    /// Fire whichever timer is due: the heartbeat for a leader, the
    /// election deadline for everyone else.
    pub fn tick(&mut self, now: Instant) -> Vec<Envelope> {
        if self.role.is_leader() {
            if now.duration_since(self.last_heartbeat) >= HEARTBEAT_INTERVAL {
                self.last_heartbeat = now;
                return vec![self.heartbeat()];
            }
            Vec::new()
        } else if self.election.should_start_election(now) {
            self.start_election(now)
        } else {
            Vec::new()
        }
    }

    /// Process one decoded message and return the messages to send.
    pub fn handle(&mut self, now: Instant, msg: Envelope) -> RaftResult<Vec<Envelope>> {
        let Envelope {
            src, leader, body, ..
        } = msg;
        match body {
            Body::Get { mid, key } => Ok(self.handle_get(src, mid, key)),
            Body::Put { mid, key, value } => Ok(self.handle_put(src, mid, key, value)),
            Body::Vote {
                term,
                last_log_index,
                last_log_term,
            } => Ok(self.handle_vote_request(now, src, term, last_log_index, last_log_term)),
            Body::VoteReply { term, vote_granted } => {
                Ok(self.handle_vote_reply(now, src, term, vote_granted))
            }
            Body::AppendEntries {
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                now,
                src,
                leader,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            Body::AppendOk { term, next_index } => {
                Ok(self.handle_append_ok(now, src, term, next_index))
            }
            Body::AppendReject { term, next_index } => {
                Ok(self.handle_append_reject(now, src, term, next_index))
            }
            // announcements and client-bound responses carry nothing for us
            Body::Hello | Body::Ok { .. } | Body::Fail { .. } | Body::Redirect { .. } => {
                Ok(Vec::new())
            }
        }
    }

    // -- client requests --

    /// Reads are served by the leader from the applied map. This is a
    /// leader-local read without a quorum round, so a deposed leader that
    /// has not yet heard the new term can answer stale.
    fn handle_get(&mut self, client: NodeId, mid: String, key: String) -> Vec<Envelope> {
        if !self.role.is_leader() {
            return self.route_to_leader(client, mid);
        }
        let value = self.store.get(&key).unwrap_or("").to_string();
        vec![self.envelope(
            client,
            Body::Ok {
                mid,
                value: Some(value),
            },
        )]
    }

    /// Writes append to the leader's log and go out to the peers at once;
    /// the client is answered only when the entry commits and applies.
    fn handle_put(&mut self, client: NodeId, mid: String, key: String, value: String) -> Vec<Envelope> {
        if !self.role.is_leader() {
            return self.route_to_leader(client, mid);
        }
        let term = self.persistent.current_term;
        let command = Command {
            key,
            value,
            client,
            mid,
        };
        let index = self.persistent.log.append(term, command);
        debug!(index, term, "appended client command");

        let mut out = self.replicate_to_peers();
        // a single-replica cluster commits on its own
        out.extend(self.advance_commit());
        out
    }

    fn route_to_leader(&self, client: NodeId, mid: String) -> Vec<Envelope> {
        let body = match self.leader_hint {
            Some(_) => Body::Redirect { mid },
            None => Body::Fail { mid },
        };
        vec![self.envelope(client, body)]
    }

    // -- elections --

    fn start_election(&mut self, now: Instant) -> Vec<Envelope> {
        self.role = RaftRole::Candidate;
        self.leader_hint = None;
        self.leader_state = None;
        self.persistent.increment_term();
        self.persistent.vote_for(self.config.id.clone());
        self.election.start_election(&self.config.id, now);
        info!(
            term = self.persistent.current_term,
            "election timeout, starting election"
        );

        if self.election.votes.has_quorum() {
            // single-replica cluster: our own vote is a majority
            return self.become_leader(now);
        }

        vec![self.envelope(
            BROADCAST.to_string(),
            Body::Vote {
                term: self.persistent.current_term,
                last_log_index: self.persistent.log.last_index(),
                last_log_term: self.persistent.log.last_term(),
            },
        )]
    }

    fn handle_vote_request(
        &mut self,
        now: Instant,
        candidate: NodeId,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Vec<Envelope> {
        if term > self.persistent.current_term {
            self.step_down(now, term);
        }

        let grant = VoteValidator::should_grant_vote(
            self.persistent.current_term,
            &self.persistent.voted_for,
            self.persistent.log.last_index(),
            self.persistent.log.last_term(),
            &candidate,
            term,
            last_log_index,
            last_log_term,
        );

        if grant {
            self.persistent.vote_for(candidate.clone());
            self.election.reset_timer(now, self.leader_hint.is_some());
            info!(candidate = %candidate, term, "granted vote");
        } else {
            debug!(candidate = %candidate, term, "refused vote");
        }

        vec![self.envelope(
            candidate,
            Body::VoteReply {
                term: self.persistent.current_term,
                vote_granted: grant,
            },
        )]
    }

    fn handle_vote_reply(
        &mut self,
        now: Instant,
        voter: NodeId,
        term: Term,
        vote_granted: bool,
    ) -> Vec<Envelope> {
        if !vote_granted {
            if term > self.persistent.current_term {
                self.step_down(now, term);
            }
            return Vec::new();
        }
        if !self.role.is_candidate() || term != self.persistent.current_term {
            return Vec::new();
        }
        if self.election.record_vote(voter) {
            return self.become_leader(now);
        }
        Vec::new()
    }

    fn become_leader(&mut self, now: Instant) -> Vec<Envelope> {
        info!(
            term = self.persistent.current_term,
            votes = self.election.votes.vote_count(),
            "won election, becoming leader"
        );
        self.role = RaftRole::Leader;
        self.leader_hint = Some(self.config.id.clone());
        self.leader_state = Some(LeaderState::new(
            &self.config.peers,
            self.persistent.log.last_index(),
        ));
        self.last_heartbeat = now;
        vec![self.heartbeat()]
    }

    /// Any message with a higher term demotes us: adopt the term, drop any
    /// vote and election in progress, go back to following.
    fn step_down(&mut self, now: Instant, term: Term) {
        info!(term, "observed higher term, stepping down");
        self.persistent.update_term(term);
        self.role = RaftRole::Follower;
        self.leader_state = None;
        self.election.votes.reset();
        self.election.reset_timer(now, self.leader_hint.is_some());
    }

    // -- replication --

    /// Empty append-entries, broadcast. Followers that are behind refuse
    /// the consistency check, which is what starts their repair.
    fn heartbeat(&self) -> Envelope {
        self.envelope(
            BROADCAST.to_string(),
            Body::AppendEntries {
                term: self.persistent.current_term,
                prev_log_index: self.persistent.log.last_index(),
                prev_log_term: self.persistent.log.last_term(),
                entries: Vec::new(),
                leader_commit: self.volatile.commit_index,
            },
        )
    }

    fn replicate_to_peers(&self) -> Vec<Envelope> {
        let Some(state) = self.leader_state.as_ref() else {
            return Vec::new();
        };
        self.config
            .peers
            .iter()
            .map(|peer| self.append_entries_for(peer, state))
            .collect()
    }

    /// Entry-carrying append for one peer, built from its replication
    /// cursor.
    fn append_entries_for(&self, peer: &NodeId, state: &LeaderState) -> Envelope {
        let next = state
            .next_index_for(peer)
            .unwrap_or_else(|| self.persistent.log.len());
        let prev_log_index = next - 1;
        let prev_log_term = self.persistent.log.term_at(prev_log_index).unwrap_or(0);
        self.envelope(
            peer.clone(),
            Body::AppendEntries {
                term: self.persistent.current_term,
                prev_log_index,
                prev_log_term,
                entries: self.persistent.log.entries_from(next),
                leader_commit: self.volatile.commit_index,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        now: Instant,
        src: NodeId,
        leader: NodeId,
        term: Term,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> RaftResult<Vec<Envelope>> {
        if term < self.persistent.current_term {
            // stale leader
            return Ok(Vec::new());
        }

        // a valid leader for this term or a later one: follow it
        self.persistent.update_term(term);
        if !self.role.is_follower() {
            info!(term, leader = %leader, "observed current leader, becoming follower");
        }
        self.role = RaftRole::Follower;
        self.leader_state = None;
        self.election.votes.reset();
        self.leader_hint = if leader == BROADCAST {
            None
        } else {
            Some(leader)
        };
        self.election.reset_timer(now, self.leader_hint.is_some());

        let reply_term = self.persistent.current_term;
        let last = self.persistent.log.last_index();
        if prev_log_index > last {
            // the leader is past our end; point it at our tail
            debug!(prev_log_index, last, "append past end of log, refusing");
            return Ok(vec![self.envelope(
                src,
                Body::AppendReject {
                    term: reply_term,
                    next_index: Some(last + 1),
                },
            )]);
        }

        if !self.persistent.log.matches(prev_log_index, prev_log_term) {
            // point the leader at the first entry of the conflicting term
            // so it can skip the whole run
            let conflict_term = self.persistent.log.term_at(prev_log_index).unwrap_or(0);
            let next_index = self
                .persistent
                .log
                .first_index_of_term(conflict_term)
                .unwrap_or(1);
            debug!(
                prev_log_index,
                conflict_term, next_index, "log conflict, refusing"
            );
            return Ok(vec![self.envelope(
                src,
                Body::AppendReject {
                    term: reply_term,
                    next_index: Some(next_index),
                },
            )]);
        }

        let had_entries = !entries.is_empty();
        self.persistent.log.truncate_to(prev_log_index + 1)?;
        self.persistent.log.extend(entries);

        let mut out = Vec::new();
        if leader_commit > self.volatile.commit_index {
            let new_commit = leader_commit.min(self.persistent.log.last_index());
            self.volatile.update_commit_index(new_commit);
            out.extend(self.apply_committed());
        }

        // heartbeats go unanswered in this protocol variant
        if had_entries {
            out.push(self.envelope(
                src,
                Body::AppendOk {
                    term: reply_term,
                    next_index: self.persistent.log.last_index() + 1,
                },
            ));
        }
        Ok(out)
    }

    fn handle_append_ok(
        &mut self,
        now: Instant,
        peer: NodeId,
        term: Term,
        next_index: LogIndex,
    ) -> Vec<Envelope> {
        if term > self.persistent.current_term {
            self.step_down(now, term);
            return Vec::new();
        }
        if !self.role.is_leader() {
            return Vec::new();
        }
        if let Some(state) = self.leader_state.as_mut() {
            state.update_replication(&peer, next_index);
        }
        self.advance_commit()
    }

    fn handle_append_reject(
        &mut self,
        now: Instant,
        peer: NodeId,
        term: Term,
        next_index: Option<LogIndex>,
    ) -> Vec<Envelope> {
        if term > self.persistent.current_term {
            self.step_down(now, term);
            return Vec::new();
        }
        if !self.role.is_leader() {
            return Vec::new();
        }
        let Some(state) = self.leader_state.as_mut() else {
            return Vec::new();
        };
        state.back_off(&peer, next_index);
        debug!(peer = %peer, "append refused, backing up and retrying");

        let Some(state) = self.leader_state.as_ref() else {
            return Vec::new();
        };
        vec![self.append_entries_for(&peer, state)]
    }

    // -- commit --

    /// Advance the commit index to the highest entry of our own term that a
    /// strict majority has replicated, then apply.
    fn advance_commit(&mut self) -> Vec<Envelope> {
        if !self.role.is_leader() {
            return Vec::new();
        }
        let current = self.persistent.current_term;
        let quorum = self.quorum_size();

        let mut target = None;
        let mut idx = self.persistent.log.last_index();
        while idx > self.volatile.commit_index {
            match self.persistent.log.term_at(idx) {
                Some(t) if t == current => {
                    // self counts as replicated through its whole log
                    let replicated = 1 + self
                        .leader_state
                        .as_ref()
                        .map_or(0, |state| state.match_count(idx));
                    if replicated >= quorum {
                        target = Some(idx);
                        break;
                    }
                    idx -= 1;
                }
                // entries of earlier terms are never committed by count;
                // everything below here is older still
                _ => break,
            }
        }

        match target {
            Some(idx) => {
                self.volatile.update_commit_index(idx);
                info!(commit_index = idx, "advanced commit index");
                self.apply_committed()
            }
            None => Vec::new(),
        }
    }

    /// Apply every committed-but-unapplied entry to the map. The leader
    /// acknowledges the origin client as each entry takes effect.
    fn apply_committed(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while self.volatile.last_applied < self.volatile.commit_index {
            self.volatile.last_applied += 1;
            let index = self.volatile.last_applied;
            let Some(entry) = self.persistent.log.get(index) else {
                break;
            };
            let Command {
                key,
                value,
                client,
                mid,
            } = entry.command.clone();
            debug!(index, key = %key, "applied entry");
            self.store.put(key, value);
            if self.role.is_leader() {
                out.push(self.envelope(client, Body::Ok { mid, value: None }));
            }
        }
        out
    }

    // -- helpers --

    fn envelope(&self, dst: NodeId, body: Body) -> Envelope {
        Envelope {
            src: self.config.id.clone(),
            dst,
            leader: self
                .leader_hint
                .clone()
                .unwrap_or_else(|| BROADCAST.to_string()),
            body,
        }
    }

    fn quorum_size(&self) -> usize {
        (self.config.peers.len() + 1) / 2 + 1
    }
}
