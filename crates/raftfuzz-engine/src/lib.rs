//! Coverage-guided schedule fuzzing for a simulated Raft cluster.
//!
//! The engine drives a deterministic in-process cluster of
//! [`raftfuzz-raft`](raftfuzz_raft) replicas, choosing at every logical step
//! which inter-node messages to deliver, which replicas to crash or restart,
//! and when to inject client writes. Each run produces a concrete schedule
//! and an event trace; a pluggable coverage oracle (a [`guider::Guider`])
//! scores the trace, and high-scoring schedules are mutated and queued for
//! replay.
//!
//! ```text
//! 1. Pop a schedule from the corpus (or start from nothing)
//! 2. Replay it against a fresh Raft environment → concrete trace + events
//! 3. Ask the guider how many new states / trace hashes / lines it covered
//! 4. If novel: produce `num_new × mut_per_trace` mutants, push them
//! 5. Periodically reseed the corpus with fresh random schedules
//! ```
//!
//! # Module Structure
//!
//! - [`schedule`] — scheduling choices and replay cursors
//! - [`event`] — the recorded event trace and its canonical hash
//! - [`environment`] — the Raft cluster wrapper (queues, crash/restart)
//! - [`strategy`] — the random decision oracle for unpinned choices
//! - [`tlc`] — HTTP client for the TLC model-checker oracle
//! - [`guider`] — TLC-state, trace-coverage and line-coverage oracles
//! - [`mutator`] — mutation operators over schedules
//! - [`corpus`] — the FIFO of schedules awaiting execution
//! - [`checker`] — end-of-iteration cluster invariant checks
//! - [`fuzzer`] — the main loop
//! - [`compare`] — the (mutator, guider) comparison harness
//!
//! # Determinism
//!
//! A run is reproducible from its master seed: per-iteration PRNGs are
//! derived from `(seed, iteration)`, replica election jitter from the
//! environment seed, and all engine collections are `BTreeMap`/`BTreeSet`.

pub mod checker;
pub mod compare;
pub mod corpus;
pub mod environment;
pub mod event;
pub mod fuzzer;
pub mod guider;
pub mod mutator;
pub mod schedule;
pub mod strategy;
pub mod tlc;

#[cfg(test)]
pub(crate) mod testutil;

pub use checker::{serializability_checker, Checker};
pub use compare::Comparison;
pub use corpus::Corpus;
pub use environment::{EnvironmentError, RaftEnvironment, RaftEnvironmentConfig};
pub use event::{trace_hash, Event, EventTrace, TimeoutKind};
pub use fuzzer::{FuzzError, Fuzzer, FuzzerConfig, FuzzStats, IterationOutcome};
pub use guider::{Guider, LineCoverageGuider, TlcStateGuider, TraceCoverageGuider};
pub use mutator::{
    CombinedMutator, EmptyMutator, Mutator, SwapCrashNodeMutator, SwapMaxMessagesMutator,
    SwapNodeMutator,
};
pub use schedule::{Schedule, ScheduleCursors, SchedulingChoice};
pub use strategy::{RandomStrategy, Strategy};
pub use tlc::{TlcClient, TlcError, TlcState};
