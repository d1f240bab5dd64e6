//! The Raft replica state machine.
//!
//! [`RaftNode`] is driven entirely by the caller: [`tick`](RaftNode::tick)
//! advances logical time, [`step`](RaftNode::step) delivers one message.
//! Outbound messages accumulate in an outbox and observable transitions in
//! an event buffer; the caller drains both with
//! [`take_outbox`](RaftNode::take_outbox) / [`take_events`](RaftNode::take_events).

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::log::{DurableState, RaftLog};
use crate::message::{Entry, Message, MessageKind, ReplicaId};

/// Timer configuration shared by every replica in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftConfig {
    /// Minimum ticks of leader silence before a follower campaigns. The
    /// actual timeout is drawn uniformly from `[election_tick, 2*election_tick)`.
    pub election_tick: u32,
    /// Ticks between leader heartbeat broadcasts.
    pub heartbeat_tick: u32,
}

/// An observable transition, recorded for the event trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// Election timer fired; the node campaigned.
    ElectionTimeout { term: u64 },
    /// Heartbeat timer fired; the leader broadcast heartbeats.
    HeartbeatTimeout { term: u64 },
    /// The node won an election.
    BecameLeader { term: u64 },
}

enum Role {
    Follower {
        leader: Option<ReplicaId>,
    },
    Candidate {
        votes: BTreeSet<ReplicaId>,
    },
    Leader {
        next_idx: BTreeMap<ReplicaId, u64>,
        match_idx: BTreeMap<ReplicaId, u64>,
    },
}

/// One Raft replica.
pub struct RaftNode {
    id: ReplicaId,
    peers: BTreeSet<ReplicaId>,
    config: RaftConfig,

    term: u64,
    voted_for: Option<ReplicaId>,
    log: RaftLog,
    commit: u64,
    role: Role,

    election_elapsed: u32,
    heartbeat_elapsed: u32,
    randomized_election_timeout: u32,
    rng: ChaCha8Rng,

    outbox: Vec<Message>,
    events: Vec<NodeEvent>,
}

impl RaftNode {
    /// A fresh replica with empty storage. `peers` may include `id`.
    pub fn new(id: ReplicaId, peers: BTreeSet<ReplicaId>, config: RaftConfig, seed: u64) -> Self {
        Self::restore(id, peers, config, seed, DurableState::default())
    }

    /// Rebuild a replica from crash-surviving state. A fresh session
    /// begins: timers reset, role is follower, commit index is rediscovered
    /// from the leader.
    pub fn restore(
        id: ReplicaId,
        mut peers: BTreeSet<ReplicaId>,
        config: RaftConfig,
        seed: u64,
        durable: DurableState,
    ) -> Self {
        peers.remove(&id);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let randomized_election_timeout = random_election_timeout(&mut rng, config.election_tick);
        Self {
            id,
            peers,
            config,
            term: durable.term,
            voted_for: durable.voted_for,
            log: RaftLog::from_entries(durable.entries),
            commit: 0,
            role: Role::Follower { leader: None },
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout,
            rng,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Snapshot the state that survives a crash.
    pub fn durable(&self) -> DurableState {
        DurableState {
            term: self.term,
            voted_for: self.voted_for,
            entries: self.log.entries().to_vec(),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    pub fn commit_index(&self) -> u64 {
        self.commit
    }

    /// The committed prefix of the log.
    pub fn committed_entries(&self) -> &[Entry] {
        self.log.committed(self.commit)
    }

    pub fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Advance logical time by one tick.
    pub fn tick(&mut self) {
        match &self.role {
            Role::Follower { .. } | Role::Candidate { .. } => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_election_timeout {
                    self.campaign();
                }
            }
            Role::Leader { .. } => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_tick {
                    self.heartbeat_elapsed = 0;
                    self.events.push(NodeEvent::HeartbeatTimeout { term: self.term });
                    self.broadcast_heartbeat();
                }
            }
        }
    }

    /// Deliver one message addressed to this node.
    pub fn step(&mut self, msg: Message) {
        // A higher term always demotes, regardless of message kind. Client
        // proposals carry term 0 and are exempt.
        if msg.kind != MessageKind::MsgProp && msg.term > self.term {
            let leader = match msg.kind {
                MessageKind::MsgApp | MessageKind::MsgHeartbeat => Some(msg.from),
                _ => None,
            };
            self.become_follower(msg.term, leader);
        }

        match msg.kind {
            MessageKind::MsgProp => self.handle_proposal(msg),
            MessageKind::MsgVote => self.handle_vote_request(msg),
            MessageKind::MsgVoteResp => self.handle_vote_response(msg),
            MessageKind::MsgApp => self.handle_append(msg),
            MessageKind::MsgAppResp => self.handle_append_response(msg),
            MessageKind::MsgHeartbeat => self.handle_heartbeat(msg),
            MessageKind::MsgHeartbeatResp => self.handle_heartbeat_response(msg),
        }
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn campaign(&mut self) {
        self.term += 1;
        self.voted_for = Some(self.id);
        let mut votes = BTreeSet::new();
        votes.insert(self.id);
        self.role = Role::Candidate { votes };
        self.reset_election_timer();
        self.events.push(NodeEvent::ElectionTimeout { term: self.term });
        debug!("node {} campaigning at term {}", self.id, self.term);

        if self.quorum() == 1 {
            self.become_leader();
            return;
        }
        for &peer in &self.peers {
            let mut req = Message::new(self.id, peer, MessageKind::MsgVote, self.term);
            req.index = self.log.last_index();
            req.log_term = self.log.last_term();
            self.outbox.push(req);
        }
    }

    fn become_leader(&mut self) {
        let next = self.log.last_index() + 1;
        let next_idx = self.peers.iter().map(|&p| (p, next)).collect();
        let match_idx = self.peers.iter().map(|&p| (p, 0)).collect();
        self.role = Role::Leader {
            next_idx,
            match_idx,
        };
        self.heartbeat_elapsed = 0;
        self.events.push(NodeEvent::BecameLeader { term: self.term });
        debug!("node {} became leader at term {}", self.id, self.term);

        // Appending a no-op lets the new leader commit entries from older
        // terms (a leader may only count replicas for entries of its own term).
        let noop = Entry::new(self.term, self.log.last_index() + 1, bytes::Bytes::new());
        self.log.push(noop);
        let peers: Vec<ReplicaId> = self.peers.iter().copied().collect();
        for peer in peers {
            self.send_append(peer);
        }
        self.advance_commit();
    }

    fn become_follower(&mut self, term: u64, leader: Option<ReplicaId>) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        self.role = Role::Follower { leader };
        self.reset_election_timer();
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.randomized_election_timeout =
            random_election_timeout(&mut self.rng, self.config.election_tick);
    }

    fn handle_proposal(&mut self, msg: Message) {
        if !self.is_leader() {
            debug!("node {} dropping proposal: not leader", self.id);
            return;
        }
        for entry in msg.entries {
            let appended = Entry::new(self.term, self.log.last_index() + 1, entry.data);
            self.log.push(appended);
        }
        let peers: Vec<ReplicaId> = self.peers.iter().copied().collect();
        for peer in peers {
            self.send_append(peer);
        }
        self.advance_commit();
    }

    fn handle_vote_request(&mut self, msg: Message) {
        let up_to_date = (msg.log_term, msg.index) >= (self.log.last_term(), self.log.last_index());
        let grant = msg.term == self.term
            && up_to_date
            && matches!(self.role, Role::Follower { .. })
            && (self.voted_for.is_none() || self.voted_for == Some(msg.from));

        let mut resp = Message::new(self.id, msg.from, MessageKind::MsgVoteResp, self.term);
        if grant {
            self.voted_for = Some(msg.from);
            self.reset_election_timer();
        } else {
            resp.reject = true;
        }
        self.outbox.push(resp);
    }

    fn handle_vote_response(&mut self, msg: Message) {
        if msg.term < self.term || msg.reject {
            return;
        }
        let quorum = self.quorum();
        let won = if let Role::Candidate { votes } = &mut self.role {
            votes.insert(msg.from);
            votes.len() >= quorum
        } else {
            false
        };
        if won {
            self.become_leader();
        }
    }

    fn handle_append(&mut self, msg: Message) {
        let mut resp = Message::new(self.id, msg.from, MessageKind::MsgAppResp, self.term);
        if msg.term < self.term {
            resp.reject = true;
            resp.index = msg.index;
            self.outbox.push(resp);
            return;
        }

        self.become_follower(msg.term, Some(msg.from));
        resp.term = self.term;

        if self.log.matches(msg.index, msg.log_term) {
            let last_new = msg.index + msg.entries.len() as u64;
            self.log.append(msg.index, &msg.entries);
            if msg.commit > self.commit {
                self.commit = msg.commit.min(last_new);
            }
            resp.index = last_new;
        } else {
            resp.reject = true;
            resp.index = msg.index;
        }
        self.outbox.push(resp);
    }

    fn handle_append_response(&mut self, msg: Message) {
        if msg.term < self.term {
            return;
        }
        let behind = if let Role::Leader {
            next_idx,
            match_idx,
        } = &mut self.role
        {
            if msg.reject {
                let next = next_idx.entry(msg.from).or_insert(1);
                *next = (*next - 1).max(1).min(msg.index.max(1));
                true
            } else {
                if let Some(m) = match_idx.get_mut(&msg.from) {
                    if msg.index > *m {
                        *m = msg.index;
                        next_idx.insert(msg.from, msg.index + 1);
                    }
                }
                false
            }
        } else {
            return;
        };

        self.advance_commit();
        if behind {
            self.send_append(msg.from);
        }
    }

    fn handle_heartbeat(&mut self, msg: Message) {
        if msg.term < self.term {
            let mut resp = Message::new(self.id, msg.from, MessageKind::MsgHeartbeatResp, self.term);
            resp.reject = true;
            self.outbox.push(resp);
            return;
        }
        self.become_follower(msg.term, Some(msg.from));
        // Heartbeats carry a commit index clamped to this follower's match
        // index on the leader side.
        if msg.commit > self.commit {
            self.commit = msg.commit.min(self.log.last_index());
        }
        let mut resp = Message::new(self.id, msg.from, MessageKind::MsgHeartbeatResp, self.term);
        resp.index = self.log.last_index();
        self.outbox.push(resp);
    }

    fn handle_heartbeat_response(&mut self, msg: Message) {
        if msg.term < self.term {
            return;
        }
        let behind = if let Role::Leader { match_idx, .. } = &self.role {
            match_idx
                .get(&msg.from)
                .is_some_and(|&m| m < self.log.last_index())
        } else {
            false
        };
        if behind {
            self.send_append(msg.from);
        }
    }

    /// Send the peer every entry from its next index, with the preceding
    /// entry as the consistency pivot.
    fn send_append(&mut self, to: ReplicaId) {
        let next = if let Role::Leader { next_idx, .. } = &self.role {
            *next_idx.get(&to).unwrap_or(&1)
        } else {
            return;
        };
        let prev = next - 1;
        let prev_term = match self.log.term(prev) {
            Some(t) => t,
            None => return,
        };
        let mut msg = Message::new(self.id, to, MessageKind::MsgApp, self.term);
        msg.index = prev;
        msg.log_term = prev_term;
        msg.commit = self.commit;
        msg.entries = self.log.entries_from(next).to_vec();
        self.outbox.push(msg);
    }

    fn broadcast_heartbeat(&mut self) {
        let targets: Vec<(ReplicaId, u64)> = if let Role::Leader { match_idx, .. } = &self.role {
            match_idx
                .iter()
                .map(|(&p, &m)| (p, self.commit.min(m)))
                .collect()
        } else {
            return;
        };
        for (peer, commit_hint) in targets {
            let mut msg = Message::new(self.id, peer, MessageKind::MsgHeartbeat, self.term);
            msg.commit = commit_hint;
            self.outbox.push(msg);
        }
    }

    /// Advance the commit index to the highest index replicated on a quorum,
    /// restricted to entries of the current term.
    fn advance_commit(&mut self) {
        let quorum = self.quorum();
        let mut indices: Vec<u64> = if let Role::Leader { match_idx, .. } = &self.role {
            match_idx.values().copied().collect()
        } else {
            return;
        };
        indices.push(self.log.last_index());
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = indices[quorum - 1];
        if candidate > self.commit && self.log.term(candidate) == Some(self.term) {
            self.commit = candidate;
        }
    }
}

fn random_election_timeout(rng: &mut ChaCha8Rng, election_tick: u32) -> u32 {
    rng.gen_range(election_tick..election_tick.saturating_mul(2).max(election_tick + 1))
}
