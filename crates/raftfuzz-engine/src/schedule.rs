//! Scheduling choices and the schedules built from them.
//!
//! A [`Schedule`] is the unit the fuzzer mutates and replays. During replay
//! it is consumed positionally through [`ScheduleCursors`]: message-channel
//! and random-draw choices are popped from kind-keyed FIFO cursors, while
//! crash/restart/client-request choices are indexed by step.

use raftfuzz_raft::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// One decision made (or to be replayed) at some point of an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SchedulingChoice {
    /// Deliver up to `max_messages` pending messages from `from` to `to`.
    Node {
        from: ReplicaId,
        to: ReplicaId,
        max_messages: usize,
    },
    /// Pinned answer to a [`Strategy::pick_bool`](crate::strategy::Strategy::pick_bool) request.
    RandomBoolean { value: bool },
    /// Pinned answer to a [`Strategy::pick_int`](crate::strategy::Strategy::pick_int) request.
    RandomInteger { value: i64 },
    /// Restart `node` at logical step `step`.
    StartNode { step: usize, node: ReplicaId },
    /// Crash `node` at logical step `step`.
    StopNode { step: usize, node: ReplicaId },
    /// Inject client write number `request` at `step`.
    ClientRequest { step: usize, request: u64 },
}

impl SchedulingChoice {
    pub fn is_node(&self) -> bool {
        matches!(self, Self::Node { .. })
    }
}

impl fmt::Display for SchedulingChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node {
                from,
                to,
                max_messages,
            } => write!(f, "node({from}->{to},{max_messages})"),
            Self::RandomBoolean { value } => write!(f, "bool({value})"),
            Self::RandomInteger { value } => write!(f, "int({value})"),
            Self::StartNode { step, node } => write!(f, "start({node}@{step})"),
            Self::StopNode { step, node } => write!(f, "stop({node}@{step})"),
            Self::ClientRequest { step, request } => write!(f, "request({request}@{step})"),
        }
    }
}

/// An ordered sequence of scheduling choices.
pub type Schedule = Vec<SchedulingChoice>;

/// Kind-keyed replay cursors over a mimic schedule.
///
/// `Node`/`RandomBoolean`/`RandomInteger` choices are consumed FIFO;
/// `StartNode`/`StopNode`/`ClientRequest` are looked up by step, with
/// last-write-wins when a schedule holds duplicates for one step.
#[derive(Debug, Default)]
pub struct ScheduleCursors {
    nodes: VecDeque<(ReplicaId, ReplicaId, usize)>,
    bools: VecDeque<bool>,
    ints: VecDeque<i64>,
    starts: BTreeMap<usize, ReplicaId>,
    stops: BTreeMap<usize, ReplicaId>,
    requests: BTreeMap<usize, u64>,
}

impl ScheduleCursors {
    pub fn from_schedule(schedule: &Schedule) -> Self {
        let mut cursors = Self::default();
        for choice in schedule {
            match *choice {
                SchedulingChoice::Node {
                    from,
                    to,
                    max_messages,
                } => cursors.nodes.push_back((from, to, max_messages)),
                SchedulingChoice::RandomBoolean { value } => cursors.bools.push_back(value),
                SchedulingChoice::RandomInteger { value } => cursors.ints.push_back(value),
                SchedulingChoice::StartNode { step, node } => {
                    cursors.starts.insert(step, node);
                }
                SchedulingChoice::StopNode { step, node } => {
                    cursors.stops.insert(step, node);
                }
                SchedulingChoice::ClientRequest { step, request } => {
                    cursors.requests.insert(step, request);
                }
            }
        }
        cursors
    }

    pub fn next_node(&mut self) -> Option<(ReplicaId, ReplicaId, usize)> {
        self.nodes.pop_front()
    }

    pub fn next_bool(&mut self) -> Option<bool> {
        self.bools.pop_front()
    }

    pub fn next_int(&mut self) -> Option<i64> {
        self.ints.pop_front()
    }

    pub fn start_at(&self, step: usize) -> Option<ReplicaId> {
        self.starts.get(&step).copied()
    }

    pub fn stop_at(&self, step: usize) -> Option<ReplicaId> {
        self.stops.get(&step).copied()
    }

    pub fn request_at(&self, step: usize) -> Option<u64> {
        self.requests.get(&step).copied()
    }

    /// Whether the mimic pins any client request at all.
    pub fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }
}
