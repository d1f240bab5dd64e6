//! The Raft cluster wrapper the fuzzer replays schedules against.
//!
//! Owns `N` replicas indexed `1..=N` and one FIFO queue per ordered pair
//! `(from, to)`. The environment is rebuilt from scratch for every
//! iteration; the only state that crosses a crash/restart of a single
//! replica is its durable Raft state (log, term, vote).

use std::collections::{BTreeMap, VecDeque};

use log::debug;
use raftfuzz_raft::{
    DurableState, Entry, Message, NodeEvent, RaftConfig, RaftNode, ReplicaId,
};
use thiserror::Error;

use crate::event::{Event, TimeoutKind};

/// Errors from environment construction.
#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("cluster needs at least one replica")]
    NoReplicas,
}

/// Cluster shape and timer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftEnvironmentConfig {
    /// Number of replicas, ids `1..=replicas`.
    pub replicas: u64,
    /// Minimum election timeout in ticks.
    pub election_tick: u32,
    /// Heartbeat interval in ticks.
    pub heartbeat_tick: u32,
    /// Raft ticks per logical fuzzer step.
    pub ticks_per_step: u32,
}

impl Default for RaftEnvironmentConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            election_tick: 20,
            heartbeat_tick: 2,
            ticks_per_step: 2,
        }
    }
}

struct Replica {
    node: RaftNode,
    crashed: bool,
    /// Restart generation, used to derive a fresh timer seed per session.
    sessions: u64,
}

/// A simulated Raft cluster with per-pair message queues.
pub struct RaftEnvironment {
    config: RaftEnvironmentConfig,
    seed: u64,
    replicas: BTreeMap<ReplicaId, Replica>,
    queues: BTreeMap<(ReplicaId, ReplicaId), VecDeque<Message>>,
    /// Last-committed snapshot per replica; survives a replica's crash.
    committed: BTreeMap<ReplicaId, Vec<Entry>>,
    events: Vec<Event>,
}

impl RaftEnvironment {
    /// Build a fresh cluster: every replica starts with empty storage and a
    /// peer list of `1..=N`.
    pub fn new(config: RaftEnvironmentConfig, seed: u64) -> Result<Self, EnvironmentError> {
        if config.replicas == 0 {
            return Err(EnvironmentError::NoReplicas);
        }
        let raft_config = RaftConfig {
            election_tick: config.election_tick,
            heartbeat_tick: config.heartbeat_tick,
        };
        let peers: Vec<ReplicaId> = (1..=config.replicas).collect();

        let mut replicas = BTreeMap::new();
        let mut committed = BTreeMap::new();
        let mut queues = BTreeMap::new();
        for &id in &peers {
            let node = RaftNode::new(
                id,
                peers.iter().copied().collect(),
                raft_config,
                session_seed(seed, id, 0),
            );
            replicas.insert(
                id,
                Replica {
                    node,
                    crashed: false,
                    sessions: 0,
                },
            );
            committed.insert(id, Vec::new());
            for &other in &peers {
                if other != id {
                    queues.insert((id, other), VecDeque::new());
                }
            }
        }

        Ok(Self {
            config,
            seed,
            replicas,
            queues,
            committed,
            events: Vec::new(),
        })
    }

    pub fn config(&self) -> &RaftEnvironmentConfig {
        &self.config
    }

    pub fn node_ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas.keys().copied()
    }

    /// Out-of-range ids are reported crashed so callers uniformly skip them.
    pub fn is_crashed(&self, node: ReplicaId) -> bool {
        self.replicas.get(&node).map_or(true, |r| r.crashed)
    }

    pub fn live_nodes(&self) -> Vec<ReplicaId> {
        self.replicas
            .iter()
            .filter(|(_, r)| !r.crashed)
            .map(|(&id, _)| id)
            .collect()
    }

    /// The live replica currently claiming leadership, preferring the
    /// highest term when a stale leader has not yet learned better.
    pub fn leader(&self) -> Option<ReplicaId> {
        self.replicas
            .iter()
            .filter(|(_, r)| !r.crashed && r.node.is_leader())
            .max_by_key(|(_, r)| r.node.term())
            .map(|(&id, _)| id)
    }

    /// Advance every live replica by `ticks_per_step` ticks and return the
    /// harvested outbound messages. The caller routes each message into its
    /// `(from, to)` queue via [`enqueue`](Self::enqueue).
    pub fn tick(&mut self) -> Vec<Message> {
        let mut outbound = Vec::new();
        let ids: Vec<ReplicaId> = self.replicas.keys().copied().collect();
        for id in ids {
            let ticked = match self.replicas.get_mut(&id) {
                Some(replica) if !replica.crashed => {
                    for _ in 0..self.config.ticks_per_step {
                        replica.node.tick();
                    }
                    outbound.extend(replica.node.take_outbox());
                    true
                }
                _ => false,
            };
            if ticked {
                self.collect_node_events(id);
                self.refresh_committed(id);
            }
        }
        outbound
    }

    /// Deliver `msg` to its target replica, iff the target is alive.
    /// Follow-up messages are harvested on the next [`tick`](Self::tick).
    pub fn step(&mut self, msg: Message) {
        let to = msg.to;
        match self.replicas.get_mut(&to) {
            Some(replica) if !replica.crashed => replica.node.step(msg),
            _ => {
                debug!("dropping {} to crashed or unknown replica", msg);
                return;
            }
        }
        self.collect_node_events(to);
        self.refresh_committed(to);
    }

    /// Crash a replica: durable state is preserved, queued outbound
    /// messages and timers are lost.
    pub fn stop(&mut self, node: ReplicaId) {
        if let Some(replica) = self.replicas.get_mut(&node) {
            replica.crashed = true;
            replica.node.take_outbox();
            replica.node.take_events();
        }
    }

    /// Restart a crashed replica from its durable state. A fresh session
    /// begins: follower role, reset timers, new election jitter.
    pub fn start(&mut self, node: ReplicaId) {
        let raft_config = RaftConfig {
            election_tick: self.config.election_tick,
            heartbeat_tick: self.config.heartbeat_tick,
        };
        let peers: Vec<ReplicaId> = (1..=self.config.replicas).collect();
        if let Some(replica) = self.replicas.get_mut(&node) {
            if !replica.crashed {
                return;
            }
            let durable: DurableState = replica.node.durable();
            replica.sessions += 1;
            replica.node = RaftNode::restore(
                node,
                peers.into_iter().collect(),
                raft_config,
                session_seed(self.seed, node, replica.sessions),
                durable,
            );
            replica.crashed = false;
        }
    }

    /// Route an outbound message into its pair queue. Self-addressed or
    /// out-of-range messages are dropped.
    pub fn enqueue(&mut self, msg: Message) {
        match self.queues.get_mut(&(msg.from, msg.to)) {
            Some(queue) => queue.push_back(msg),
            None => debug!("dropping unroutable {}", msg),
        }
    }

    /// Pop up to `max` messages from the `(from, to)` queue, in FIFO order.
    pub fn dequeue(&mut self, from: ReplicaId, to: ReplicaId, max: usize) -> Vec<Message> {
        let queue = match self.queues.get_mut(&(from, to)) {
            Some(queue) => queue,
            None => return Vec::new(),
        };
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn queue_len(&self, from: ReplicaId, to: ReplicaId) -> usize {
        self.queues.get(&(from, to)).map_or(0, |q| q.len())
    }

    /// Snapshot of the last-committed entries per replica. The snapshot is
    /// monotone: it keeps the pre-crash view of replicas that are down.
    pub fn committed(&self) -> &BTreeMap<ReplicaId, Vec<Entry>> {
        &self.committed
    }

    /// Drain the Timeout/BecomeLeader events observed since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    fn collect_node_events(&mut self, id: ReplicaId) {
        let node_events = match self.replicas.get_mut(&id) {
            Some(replica) => replica.node.take_events(),
            None => return,
        };
        for event in node_events {
            self.events.push(match event {
                NodeEvent::ElectionTimeout { .. } => Event::Timeout {
                    node: id,
                    kind: TimeoutKind::Election,
                },
                NodeEvent::HeartbeatTimeout { .. } => Event::Timeout {
                    node: id,
                    kind: TimeoutKind::Heartbeat,
                },
                NodeEvent::BecameLeader { term } => Event::BecomeLeader { node: id, term },
            });
        }
    }

    fn refresh_committed(&mut self, id: ReplicaId) {
        let replica = match self.replicas.get(&id) {
            Some(replica) => replica,
            None => return,
        };
        let committed = replica.node.committed_entries();
        let snapshot = self.committed.entry(id).or_default();
        if committed.len() > snapshot.len() {
            *snapshot = committed.to_vec();
        }
    }
}

fn session_seed(seed: u64, id: ReplicaId, session: u64) -> u64 {
    seed.wrapping_add(id.wrapping_mul(0x9e37_79b9_7f4a_7c15))
        .wrapping_add(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftfuzz_raft::MessageKind;

    fn env(replicas: u64) -> RaftEnvironment {
        RaftEnvironment::new(
            RaftEnvironmentConfig {
                replicas,
                election_tick: 4,
                heartbeat_tick: 2,
                ticks_per_step: 1,
            },
            7,
        )
        .unwrap()
    }

    /// Tick and flood-deliver every queue for `rounds` rounds.
    fn settle(env: &mut RaftEnvironment, rounds: usize) {
        for _ in 0..rounds {
            for msg in env.tick() {
                env.enqueue(msg);
            }
            let pairs: Vec<(ReplicaId, ReplicaId)> = env.queues.keys().copied().collect();
            for (from, to) in pairs {
                for msg in env.dequeue(from, to, usize::MAX) {
                    env.step(msg);
                }
            }
        }
    }

    #[test]
    fn rejects_empty_cluster() {
        let result = RaftEnvironment::new(
            RaftEnvironmentConfig {
                replicas: 0,
                ..Default::default()
            },
            0,
        );
        assert!(matches!(result, Err(EnvironmentError::NoReplicas)));
    }

    #[test]
    fn builds_queues_for_all_ordered_pairs() {
        let env = env(3);
        assert_eq!(env.queues.len(), 6);
        assert!(env.queues.contains_key(&(1, 2)));
        assert!(env.queues.contains_key(&(2, 1)));
        assert!(!env.queues.contains_key(&(1, 1)));
    }

    #[test]
    fn queue_is_fifo() {
        let mut env = env(2);
        for term in 1..=3 {
            let msg = Message::new(1, 2, MessageKind::MsgHeartbeat, term);
            env.enqueue(msg);
        }
        let first = env.dequeue(1, 2, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].term, 1);
        assert_eq!(first[1].term, 2);
        let rest = env.dequeue(1, 2, 10);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].term, 3);
    }

    #[test]
    fn step_to_crashed_replica_is_dropped() {
        let mut env = env(2);
        env.stop(2);
        assert!(env.is_crashed(2));
        // Would reset node 2's election timer if it were delivered.
        env.step(Message::new(1, 2, MessageKind::MsgHeartbeat, 1));
        assert!(env.take_events().is_empty());
    }

    #[test]
    fn crashed_replica_is_not_ticked() {
        let mut env = env(2);
        env.stop(1);
        env.stop(2);
        for _ in 0..50 {
            assert!(env.tick().is_empty());
        }
        assert!(env.take_events().is_empty());
    }

    #[test]
    fn cluster_elects_leader_and_commits_request() {
        let mut env = env(3);
        settle(&mut env, 20);
        let leader = env.leader().expect("leader after settling");

        env.step(Message::proposal(leader, "1"));
        settle(&mut env, 10);

        for id in 1..=3 {
            let entries = &env.committed()[&id];
            assert!(
                entries.iter().any(|e| &e.data[..] == b"1"),
                "replica {} missing committed request",
                id
            );
        }
        let events = env.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::BecomeLeader { .. })));
    }

    #[test]
    fn restart_preserves_durable_log() {
        let mut env = env(3);
        settle(&mut env, 20);
        let leader = env.leader().expect("leader");
        env.step(Message::proposal(leader, "1"));
        settle(&mut env, 10);

        let follower = (1..=3).find(|&id| id != leader).unwrap();
        let before = env.committed()[&follower].clone();
        assert!(!before.is_empty());

        env.stop(follower);
        // The committed snapshot keeps the pre-crash view.
        assert_eq!(env.committed()[&follower], before);

        env.start(follower);
        assert!(!env.is_crashed(follower));
        settle(&mut env, 20);
        // The restarted replica catches back up from its durable log.
        assert!(env.committed()[&follower].len() >= before.len());
    }

    #[test]
    fn same_seed_same_environment_behaviour() {
        let mut a = env(3);
        let mut b = env(3);
        for _ in 0..30 {
            let ma = a.tick();
            let mb = b.tick();
            assert_eq!(ma, mb);
            for m in ma {
                a.enqueue(m);
            }
            for m in mb {
                b.enqueue(m);
            }
        }
        assert_eq!(a.take_events(), b.take_events());
    }
}
