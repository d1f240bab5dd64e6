//! The event trace recorded during replay.
//!
//! Events are what the TLC-based guiders consume: the wire format keeps the
//! discriminator explicit (`"type"` tag) so the model checker can dispatch
//! on it. A trace also has a canonical form — ordered event signatures with
//! the `Reset` sentinel dropped and message payloads normalized to
//! from/to/kind/term — which the trace-coverage guider hashes.

use raftfuzz_raft::{MessageKind, ReplicaId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutKind {
    Election,
    Heartbeat,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Election => write!(f, "election"),
            Self::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// One observable event of an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Sentinel appended before submission to TLC.
    Reset,
    /// Membership change — reserved, currently never emitted.
    AddNode { step: usize, node: ReplicaId },
    /// Membership change — reserved, currently never emitted.
    RemoveNode { step: usize, node: ReplicaId },
    /// A replica emitted a message into its outbound queue.
    SendMessage {
        from: ReplicaId,
        to: ReplicaId,
        kind: MessageKind,
        term: u64,
    },
    /// A queued message was handed to its target replica.
    DeliverMessage {
        from: ReplicaId,
        to: ReplicaId,
        kind: MessageKind,
        term: u64,
    },
    /// A client write was injected.
    ClientRequest { request: u64, node: ReplicaId },
    /// A replica timer fired.
    Timeout { node: ReplicaId, kind: TimeoutKind },
    /// A replica won an election.
    BecomeLeader { node: ReplicaId, term: u64 },
}

impl Event {
    /// Compact canonical signature used for trace hashing.
    pub fn signature(&self) -> String {
        match self {
            Self::Reset => "Reset".to_string(),
            Self::AddNode { step, node } => format!("Add({node}@{step})"),
            Self::RemoveNode { step, node } => format!("Remove({node}@{step})"),
            Self::SendMessage {
                from,
                to,
                kind,
                term,
            } => format!("Send({from}->{to},{kind},t{term})"),
            Self::DeliverMessage {
                from,
                to,
                kind,
                term,
            } => format!("Deliver({from}->{to},{kind},t{term})"),
            Self::ClientRequest { request, node } => format!("Request({request}@{node})"),
            Self::Timeout { node, kind } => format!("Timeout({node},{kind})"),
            Self::BecomeLeader { node, term } => format!("Leader({node},t{term})"),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

/// Ordered record of the events one iteration emitted.
pub type EventTrace = Vec<Event>;

/// The canonical form of a trace: ordered signatures, `Reset` dropped.
pub fn canonical_form(trace: &[Event]) -> Vec<String> {
    trace
        .iter()
        .filter(|e| !matches!(e, Event::Reset))
        .map(Event::signature)
        .collect()
}

/// SHA-256 hex digest of the canonical trace form.
pub fn trace_hash(trace: &[Event]) -> String {
    let mut hasher = Sha256::new();
    for signature in canonical_form(trace) {
        hasher.update(signature.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
