//! Message and log-entry types exchanged between Raft replicas.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one replica in the cluster. Valid replicas are `1..=N`.
pub type ReplicaId = u64;

/// Reserved sender id for client-injected proposals.
pub const CLIENT_ID: ReplicaId = 0;

/// The kind of a Raft message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MessageKind {
    /// Client proposal to append data to the replicated log.
    MsgProp,
    /// AppendEntries request from a leader.
    MsgApp,
    /// Response to [`MsgApp`](Self::MsgApp).
    MsgAppResp,
    /// RequestVote from a candidate.
    MsgVote,
    /// Response to [`MsgVote`](Self::MsgVote).
    MsgVoteResp,
    /// Leader heartbeat.
    MsgHeartbeat,
    /// Response to [`MsgHeartbeat`](Self::MsgHeartbeat).
    MsgHeartbeatResp,
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MsgProp => "MsgProp",
            Self::MsgApp => "MsgApp",
            Self::MsgAppResp => "MsgAppResp",
            Self::MsgVote => "MsgVote",
            Self::MsgVoteResp => "MsgVoteResp",
            Self::MsgHeartbeat => "MsgHeartbeat",
            Self::MsgHeartbeatResp => "MsgHeartbeatResp",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An entry in the replicated log. Indices are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Term of leadership under which the entry was appended.
    pub term: u64,
    /// 1-based position in the log.
    pub index: u64,
    /// Arbitrary payload. Empty for the no-op entry a fresh leader appends.
    pub data: Bytes,
}

impl Entry {
    pub fn new(term: u64, index: u64, data: impl Into<Bytes>) -> Self {
        Self {
            term,
            index,
            data: data.into(),
        }
    }

    /// Whether this is a leader no-op (empty payload).
    pub fn is_noop(&self) -> bool {
        self.data.is_empty()
    }
}

/// A message between replicas (or from the client, for [`MessageKind::MsgProp`]).
///
/// The `index`/`log_term` pair pivots on the message kind: for appends it is
/// the entry immediately preceding `entries`, for votes it is the candidate's
/// last entry, and for append responses it is the follower's match index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: ReplicaId,
    pub to: ReplicaId,
    pub kind: MessageKind,
    /// Sender's current term. Zero for client proposals.
    pub term: u64,
    pub index: u64,
    pub log_term: u64,
    /// Sender's commit index (appends and heartbeats).
    pub commit: u64,
    pub entries: Vec<Entry>,
    /// Set on negative vote and append responses.
    pub reject: bool,
}

impl Message {
    /// A message with every positional field zeroed; callers fill in what
    /// the kind requires.
    pub fn new(from: ReplicaId, to: ReplicaId, kind: MessageKind, term: u64) -> Self {
        Self {
            from,
            to,
            kind,
            term,
            index: 0,
            log_term: 0,
            commit: 0,
            entries: Vec::new(),
            reject: false,
        }
    }

    /// A client proposal carrying `data`, addressed to `to`.
    pub fn proposal(to: ReplicaId, data: impl Into<Bytes>) -> Self {
        let mut msg = Self::new(CLIENT_ID, to, MessageKind::MsgProp, 0);
        msg.entries.push(Entry::new(0, 0, data));
        msg
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} t{} idx={} lt={} c={} n={}{}",
            self.kind,
            self.from,
            self.to,
            self.term,
            self.index,
            self.log_term,
            self.commit,
            self.entries.len(),
            if self.reject { " reject" } else { "" },
        )
    }
}
