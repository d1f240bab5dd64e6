//! End-to-end schedule replay scenarios.
//!
//! These drive `Fuzzer::run_iteration` with hand-built mimic schedules and
//! check cluster-level outcomes, without any oracle server.

use std::collections::BTreeSet;

use raftfuzz_engine::checker::serializability_checker;
use raftfuzz_engine::environment::RaftEnvironmentConfig;
use raftfuzz_engine::event::{trace_hash, Event, EventTrace};
use raftfuzz_engine::fuzzer::{Fuzzer, FuzzerConfig};
use raftfuzz_engine::guider::Guider;
use raftfuzz_engine::mutator::EmptyMutator;
use raftfuzz_engine::schedule::{Schedule, SchedulingChoice};
use raftfuzz_engine::strategy::RandomStrategy;
use tempfile::TempDir;

/// Offline guider scoring by canonical trace novelty; keeps these
/// scenarios free of any HTTP dependency.
struct HashGuider {
    seen: BTreeSet<String>,
}

impl HashGuider {
    fn new() -> Self {
        Self {
            seen: BTreeSet::new(),
        }
    }
}

impl Guider for HashGuider {
    fn check(&mut self, _trace: &Schedule, events: &EventTrace) -> (usize, f64) {
        let num_new = usize::from(self.seen.insert(trace_hash(events)));
        (num_new, num_new as f64 / self.seen.len().max(1) as f64)
    }

    fn coverage(&self) -> usize {
        self.seen.len()
    }

    fn reset(&mut self) {
        self.seen.clear();
    }
}

fn build_fuzzer(config: FuzzerConfig) -> Fuzzer {
    let strategy = Box::new(RandomStrategy::new(
        config.raft.replicas,
        config.max_messages,
        config.seed,
    ));
    Fuzzer::new(
        config,
        strategy,
        Box::new(HashGuider::new()),
        Box::new(EmptyMutator),
        None,
    )
    .unwrap()
}

/// Config with elections slow relative to the six-pair delivery rotation:
/// a full vote round trip (12 steps worst case) always fits well inside
/// one election timeout, so an election resolves once it starts.
fn rotation_config(save: &TempDir, crash_quota: usize) -> FuzzerConfig {
    FuzzerConfig {
        iterations: 1,
        steps: 250,
        raft: RaftEnvironmentConfig {
            replicas: 3,
            election_tick: 100,
            heartbeat_tick: 2,
            ticks_per_step: 1,
        },
        mut_per_trace: 5,
        number_requests: 1,
        crash_quota,
        max_messages: 5,
        seed_population_size: 2,
        reseed_frequency: 2_000,
        seed: 42,
        save_path: save.path().to_path_buf(),
    }
}

/// `steps` Node choices cycling all six ordered pairs of a 3-replica
/// cluster, each with a budget of 5 messages.
fn round_robin(steps: usize) -> Schedule {
    const PAIRS: [(u64, u64); 6] = [(1, 2), (1, 3), (2, 1), (2, 3), (3, 1), (3, 2)];
    (0..steps)
        .map(|i| {
            let (from, to) = PAIRS[i % PAIRS.len()];
            SchedulingChoice::Node {
                from,
                to,
                max_messages: 5,
            }
        })
        .collect()
}

fn committed_payloads(outcome: &raftfuzz_engine::fuzzer::IterationOutcome, node: u64) -> Vec<Vec<u8>> {
    outcome.environment.committed()[&node]
        .iter()
        .filter(|e| !e.is_noop())
        .map(|e| e.data.to_vec())
        .collect()
}

#[test]
fn all_deliver_schedule_commits_the_request_everywhere() {
    let save = TempDir::new().unwrap();
    let mut fuzzer = build_fuzzer(rotation_config(&save, 0));

    let mut mimic = round_robin(250);
    mimic.push(SchedulingChoice::ClientRequest {
        step: 220,
        request: 1,
    });

    let outcome = fuzzer.run_iteration(Some(&mimic)).unwrap();

    // A leader was elected and the injected write reached every replica.
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, Event::BecomeLeader { .. })));
    for node in 1..=3 {
        assert_eq!(
            committed_payloads(&outcome, node),
            vec![b"1".to_vec()],
            "replica {node} did not commit the request"
        );
    }
    let checker = serializability_checker();
    assert!(checker(&outcome.environment));
}

#[test]
fn lone_node_partition_makes_no_progress() {
    let save = TempDir::new().unwrap();
    let config = FuzzerConfig {
        iterations: 1,
        steps: 10,
        raft: RaftEnvironmentConfig {
            replicas: 3,
            election_tick: 20,
            heartbeat_tick: 2,
            ticks_per_step: 2,
        },
        mut_per_trace: 5,
        number_requests: 0,
        crash_quota: 0,
        max_messages: 5,
        seed_population_size: 2,
        reseed_frequency: 2_000,
        seed: 42,
        save_path: save.path().to_path_buf(),
    };
    let mut fuzzer = build_fuzzer(config);

    // Only the 2->3 channel ever flows; node 1 is effectively partitioned
    // and no vote response can reach a candidate.
    let mimic: Schedule = (0..10)
        .map(|_| SchedulingChoice::Node {
            from: 2,
            to: 3,
            max_messages: 5,
        })
        .collect();

    let outcome = fuzzer.run_iteration(Some(&mimic)).unwrap();

    assert!(!outcome
        .events
        .iter()
        .any(|e| matches!(e, Event::BecomeLeader { .. })));
    for node in 1..=3 {
        assert!(outcome.environment.committed()[&node].is_empty());
    }
}

#[test]
fn crash_then_restart_keeps_the_restarted_log_a_prefix() {
    let save = TempDir::new().unwrap();
    let mut fuzzer = build_fuzzer(rotation_config(&save, 1));

    let mut mimic = round_robin(250);
    // Out-of-range stop pins occupy the steps before the real crash; they
    // are silently ignored without spending the crash quota, and they keep
    // the randomized crash path from firing first.
    mimic.push(SchedulingChoice::StopNode { step: 0, node: 9 });
    mimic.push(SchedulingChoice::StopNode { step: 1, node: 9 });
    mimic.push(SchedulingChoice::StopNode { step: 2, node: 2 });
    mimic.push(SchedulingChoice::StartNode { step: 7, node: 2 });
    mimic.push(SchedulingChoice::ClientRequest {
        step: 220,
        request: 1,
    });
    // Pin the restart coin to "no" while node 2 is down so the only
    // restart is the one scheduled at step 7.
    for _ in 0..6 {
        mimic.push(SchedulingChoice::RandomBoolean { value: false });
    }

    let outcome = fuzzer.run_iteration(Some(&mimic)).unwrap();

    // The pinned crash and restart were honoured.
    assert!(outcome
        .trace
        .contains(&SchedulingChoice::StopNode { step: 2, node: 2 }));
    assert!(outcome
        .trace
        .contains(&SchedulingChoice::StartNode { step: 7, node: 2 }));

    // The restarted replica's committed log never diverges: it is a prefix
    // of both peers' logs.
    let committed = outcome.environment.committed();
    let restarted = &committed[&2];
    for peer in [1u64, 3] {
        let other = &committed[&peer];
        assert!(restarted.len() <= other.len());
        assert_eq!(&other[..restarted.len()], restarted.as_slice());
    }
}

#[test]
fn stop_wins_when_pinned_with_same_step_start() {
    let save = TempDir::new().unwrap();
    let mut fuzzer = build_fuzzer(rotation_config(&save, 1));

    let mut mimic = round_robin(20);
    // Malformed pins shield the earlier steps from random crashes.
    for step in 0..4 {
        mimic.push(SchedulingChoice::StopNode { step, node: 9 });
    }
    mimic.push(SchedulingChoice::StopNode { step: 4, node: 3 });
    mimic.push(SchedulingChoice::StartNode { step: 4, node: 3 });

    let outcome = fuzzer.run_iteration(Some(&mimic)).unwrap();

    // Out-of-range pins are dropped without consuming quota.
    assert!(!outcome
        .trace
        .iter()
        .any(|c| matches!(c, SchedulingChoice::StopNode { node: 9, .. })));

    // The start pin targets a live node when it is evaluated, so only the
    // stop applies and the node ends the iteration crashed.
    assert!(outcome
        .trace
        .contains(&SchedulingChoice::StopNode { step: 4, node: 3 }));
    assert!(!outcome
        .trace
        .iter()
        .any(|c| matches!(c, SchedulingChoice::StartNode { step: 4, .. })));
}

#[test]
fn fully_pinned_replay_is_reproducible() {
    let save = TempDir::new().unwrap();
    let mut seeder = build_fuzzer(rotation_config(&save, 2));
    let mimic = seeder.run_iteration(None).unwrap().trace;

    let mut a = build_fuzzer(rotation_config(&save, 2));
    let mut b = build_fuzzer(rotation_config(&save, 2));
    let oa = a.run_iteration(Some(&mimic)).unwrap();
    let ob = b.run_iteration(Some(&mimic)).unwrap();

    assert_eq!(oa.trace, ob.trace);
    assert_eq!(oa.events, ob.events);
    assert_eq!(trace_hash(&oa.events), trace_hash(&ob.events));
}

#[test]
fn executed_trace_is_realisable_as_its_own_mimic() {
    // Replaying a concrete trace must keep the environment consistent and
    // honour the recorded crash schedule.
    let save = TempDir::new().unwrap();
    let mut seeder = build_fuzzer(rotation_config(&save, 2));
    let first = seeder.run_iteration(None).unwrap();

    let mut replayer = build_fuzzer(rotation_config(&save, 2));
    let replay = replayer.run_iteration(Some(&first.trace)).unwrap();

    let stops = |t: &Schedule| {
        t.iter()
            .filter(|c| matches!(c, SchedulingChoice::StopNode { .. }))
            .count()
    };
    assert!(stops(&replay.trace) <= 2);

    let checker = serializability_checker();
    assert!(checker(&replay.environment));
}
