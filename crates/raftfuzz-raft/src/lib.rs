//! Deterministic in-process Raft node library.
//!
//! This crate implements a single Raft replica as a pure state machine
//! driven from the outside: the caller delivers messages with
//! [`node::RaftNode::step`], advances logical time with
//! [`node::RaftNode::tick`], and harvests outbound messages and observable
//! transitions afterwards. There is no I/O, no threads and no wall clock —
//! given the same seed and the same delivered-message sequence, a node's
//! behaviour is bit-for-bit reproducible. That property is what makes the
//! fuzzing engine's schedule replay meaningful.
//!
//! # Module Structure
//!
//! - [`message`] — message and log-entry types exchanged between replicas
//! - [`log`] — the replicated log and the durable portion of node state
//! - [`node`] — the Follower/Candidate/Leader state machine
//!
//! # Determinism
//!
//! All collections are `BTreeMap`/`BTreeSet`, and the only randomness is
//! the election-timeout jitter drawn from a `ChaCha8Rng` seeded by the
//! caller.

pub mod log;
pub mod message;
pub mod node;

pub use crate::log::{DurableState, RaftLog};
pub use crate::message::{Entry, Message, MessageKind, ReplicaId, CLIENT_ID};
pub use crate::node::{NodeEvent, RaftConfig, RaftNode};
