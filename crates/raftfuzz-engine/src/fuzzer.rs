//! The main fuzzing loop.
//!
//! Each iteration replays one corpus schedule (the *mimic*) against a fresh
//! Raft environment, producing a concrete trace and an event trace. The
//! mimic is a hint, not a contract: crash limits, crashed-target skipping
//! and unpinned randomness may override pinned choices, and the executed
//! concrete trace — not the mimic — is what the mutator operates on next.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use raftfuzz_raft::{Message, ReplicaId};
use serde::Serialize;
use thiserror::Error;

use crate::checker::Checker;
use crate::corpus::Corpus;
use crate::environment::{EnvironmentError, RaftEnvironment, RaftEnvironmentConfig};
use crate::event::{Event, EventTrace};
use crate::guider::Guider;
use crate::mutator::Mutator;
use crate::schedule::{Schedule, ScheduleCursors, SchedulingChoice};
use crate::strategy::Strategy;

/// Errors that abort a fuzzing run.
#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("reseed frequency must be at least 1")]
    InvalidReseedFrequency,

    #[error("failed to write under {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Knobs of one fuzzing run.
#[derive(Debug, Clone)]
pub struct FuzzerConfig {
    /// Iterations (episodes) to execute.
    pub iterations: usize,
    /// Logical steps per iteration (the horizon).
    pub steps: usize,
    pub raft: RaftEnvironmentConfig,
    /// Mutation attempts per new coverage point.
    pub mut_per_trace: usize,
    /// Client requests injected over the first steps of a random iteration.
    pub number_requests: u64,
    /// Upper bound on crashes per iteration.
    pub crash_quota: usize,
    /// Upper bound on messages per channel delivery.
    pub max_messages: usize,
    /// Random schedules the corpus is (re)seeded with.
    pub seed_population_size: usize,
    /// Reseed every this many iterations; must be at least 1.
    pub reseed_frequency: usize,
    /// Master seed; every other PRNG derives from it.
    pub seed: u64,
    /// Root directory for persisted results.
    pub save_path: PathBuf,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            iterations: 10_000,
            steps: 50,
            raft: RaftEnvironmentConfig::default(),
            mut_per_trace: 5,
            number_requests: 1,
            crash_quota: 2,
            max_messages: 10,
            seed_population_size: 10,
            reseed_frequency: 2_000,
            seed: 42,
            save_path: PathBuf::from("results"),
        }
    }
}

/// Counters and series tracked across one run.
#[derive(Debug, Clone, Default)]
pub struct FuzzStats {
    /// Iterations executed without a mimic.
    pub random_executions: u64,
    /// Iterations that replayed a corpus schedule.
    pub mutated_executions: u64,
    /// Total new coverage points reported by the guider.
    pub new_states: u64,
    /// Mutants pushed onto the corpus.
    pub mutants_pushed: u64,
    /// Iterations whose checker verdict was false.
    pub buggy_executions: u64,
    /// Times the corpus was (re)seeded.
    pub reseeds: u64,
    /// Cumulative guider coverage after each iteration.
    pub coverage_series: Vec<usize>,
}

/// What one iteration produced.
pub struct IterationOutcome {
    /// The concrete executed schedule.
    pub trace: Schedule,
    /// The observable events, in emission order.
    pub events: EventTrace,
    /// The finished environment, for checkers.
    pub environment: RaftEnvironment,
}

/// The coverage-guided fuzzer.
pub struct Fuzzer {
    config: FuzzerConfig,
    strategy: Box<dyn Strategy>,
    guider: Box<dyn Guider>,
    mutator: Box<dyn Mutator>,
    checker: Option<Checker>,
    corpus: Corpus,
    stats: FuzzStats,
    /// Total `run_iteration` calls; the per-iteration seed derives from it.
    executions: u64,
}

impl Fuzzer {
    pub fn new(
        config: FuzzerConfig,
        strategy: Box<dyn Strategy>,
        guider: Box<dyn Guider>,
        mutator: Box<dyn Mutator>,
        checker: Option<Checker>,
    ) -> Result<Self, FuzzError> {
        if config.reseed_frequency == 0 {
            return Err(FuzzError::InvalidReseedFrequency);
        }
        Ok(Self {
            config,
            strategy,
            guider,
            mutator,
            checker,
            corpus: Corpus::new(),
            stats: FuzzStats::default(),
            executions: 0,
        })
    }

    pub fn stats(&self) -> &FuzzStats {
        &self.stats
    }

    pub fn corpus_len(&self) -> usize {
        self.corpus.len()
    }

    /// Rewind for an independent run: fresh corpus, stats and guider state
    /// under a new master seed.
    pub fn reset(&mut self, seed: u64) {
        self.config.seed = seed;
        self.corpus.clear();
        self.stats = FuzzStats::default();
        self.executions = 0;
        self.guider.reset();
    }

    /// Execute the configured iteration budget.
    pub fn run(&mut self) -> Result<FuzzStats, FuzzError> {
        fs::create_dir_all(&self.config.save_path).map_err(|e| FuzzError::Save {
            path: self.config.save_path.clone(),
            source: e,
        })?;
        info!(
            "fuzzing: {} iterations, {} steps each, {} replicas",
            self.config.iterations, self.config.steps, self.config.raft.replicas
        );

        for iteration in 0..self.config.iterations {
            if iteration % self.config.reseed_frequency == 0 {
                self.seed_corpus()?;
            }

            let mimic = self.corpus.pop();
            match mimic {
                Some(_) => self.stats.mutated_executions += 1,
                None => self.stats.random_executions += 1,
            }

            let outcome = self.run_iteration(mimic.as_ref())?;
            let (num_new, ratio) = self.guider.check(&outcome.trace, &outcome.events);
            if num_new > 0 {
                debug!(
                    "iteration {}: {} new coverage points (novelty {:.3})",
                    iteration, num_new, ratio
                );
                for _ in 0..num_new * self.config.mut_per_trace {
                    if let Some(mutant) = self.mutator.mutate(&outcome.trace, &outcome.events) {
                        self.corpus.push(mutant);
                        self.stats.mutants_pushed += 1;
                    }
                }
            }
            self.stats.new_states += num_new as u64;
            self.stats.coverage_series.push(self.guider.coverage());

            if let Some(checker) = &self.checker {
                if !checker(&outcome.environment) {
                    self.stats.buggy_executions += 1;
                    self.persist_violation(iteration, &outcome)?;
                }
            }

            if (iteration + 1) % 100 == 0 {
                info!(
                    "iteration {}/{}: coverage {}, corpus {}, buggy {}",
                    iteration + 1,
                    self.config.iterations,
                    self.guider.coverage(),
                    self.corpus.len(),
                    self.stats.buggy_executions
                );
            }
        }

        Ok(self.stats.clone())
    }

    /// Discard the corpus and repopulate it with freshly-sampled random
    /// schedules.
    fn seed_corpus(&mut self) -> Result<(), FuzzError> {
        debug!(
            "reseeding corpus with {} random schedules",
            self.config.seed_population_size
        );
        self.corpus.clear();
        for _ in 0..self.config.seed_population_size {
            let outcome = self.run_iteration(None)?;
            self.corpus.push(outcome.trace);
        }
        self.stats.reseeds += 1;
        Ok(())
    }

    /// Replay `mimic` (or run purely randomly) against a fresh environment.
    pub fn run_iteration(
        &mut self,
        mimic: Option<&Schedule>,
    ) -> Result<IterationOutcome, FuzzError> {
        let iteration_seed = self.config.seed.wrapping_add(self.executions);
        self.executions += 1;
        self.strategy.reseed(iteration_seed);
        let mut rng = ChaCha8Rng::seed_from_u64(iteration_seed.wrapping_add(0x9e37_79b9));

        let replicas = self.config.raft.replicas;
        let mut env = RaftEnvironment::new(self.config.raft, iteration_seed)?;
        let mut cursors = mimic.map(ScheduleCursors::from_schedule).unwrap_or_default();
        let mut trace: Schedule = Vec::new();
        let mut events: EventTrace = Vec::new();
        let mut crashed: BTreeSet<ReplicaId> = BTreeSet::new();
        let mut crashes_used = 0usize;
        let mut requests_made = 0u64;
        let crash_probability =
            (self.config.crash_quota as f64 / self.config.steps.max(1) as f64).min(1.0);

        for step in 0..self.config.steps {
            // Restarts are applied before crashes: when a mimic pins both a
            // stop and a start of one node at the same step, the stop wins
            // and the node is crashed at step end.
            if let Some(node) = cursors.start_at(step) {
                // A pin for a node that is not down is malformed; skip it.
                if crashed.remove(&node) {
                    env.start(node);
                    trace.push(SchedulingChoice::StartNode { step, node });
                }
            } else if !crashed.is_empty() {
                let restart = cursors
                    .next_bool()
                    .unwrap_or_else(|| self.strategy.pick_bool());
                trace.push(SchedulingChoice::RandomBoolean { value: restart });
                if restart {
                    let down: Vec<ReplicaId> = crashed.iter().copied().collect();
                    let pick = cursors
                        .next_int()
                        .unwrap_or_else(|| self.strategy.pick_int());
                    trace.push(SchedulingChoice::RandomInteger { value: pick });
                    let node = down[pick.unsigned_abs() as usize % down.len()];
                    env.start(node);
                    crashed.remove(&node);
                    trace.push(SchedulingChoice::StartNode { step, node });
                }
            }

            if let Some(node) = cursors.stop_at(step) {
                if (1..=replicas).contains(&node)
                    && !crashed.contains(&node)
                    && crashes_used < self.config.crash_quota
                {
                    env.stop(node);
                    crashed.insert(node);
                    crashes_used += 1;
                    trace.push(SchedulingChoice::StopNode { step, node });
                }
            } else if crashes_used < self.config.crash_quota && rng.gen_bool(crash_probability) {
                let live = env.live_nodes();
                if !live.is_empty() {
                    let pick = cursors
                        .next_int()
                        .unwrap_or_else(|| self.strategy.pick_int());
                    trace.push(SchedulingChoice::RandomInteger { value: pick });
                    let node = live[pick.unsigned_abs() as usize % live.len()];
                    env.stop(node);
                    crashed.insert(node);
                    crashes_used += 1;
                    trace.push(SchedulingChoice::StopNode { step, node });
                }
            }

            // Channel choice. A malformed pin (out-of-range id, self-loop)
            // is silently replaced by a fresh random draw.
            let (from, to, max_messages) = match cursors.next_node() {
                Some((from, to, max)) if valid_channel(from, to, replicas) => (from, to, max),
                Some(_) => self.strategy.pick_node(),
                None => self.strategy.pick_node(),
            };
            trace.push(SchedulingChoice::Node {
                from,
                to,
                max_messages,
            });

            if !env.is_crashed(to) {
                for msg in env.dequeue(from, to, max_messages) {
                    events.push(Event::DeliverMessage {
                        from,
                        to,
                        kind: msg.kind,
                        term: msg.term,
                    });
                    env.step(msg);
                    events.extend(env.take_events());
                }
            }

            // Client requests: pins drive mimicked runs; otherwise inject
            // one request per step until the budget is served.
            let inject = match cursors.request_at(step) {
                Some(request) => Some(request),
                None if !cursors.has_requests()
                    && requests_made < self.config.number_requests =>
                {
                    Some(requests_made + 1)
                }
                None => None,
            };
            if let Some(request) = inject {
                if let Some(target) = request_target(&env, &mut rng) {
                    events.push(Event::ClientRequest {
                        request,
                        node: target,
                    });
                    env.step(Message::proposal(target, request.to_string()));
                    events.extend(env.take_events());
                    trace.push(SchedulingChoice::ClientRequest { step, request });
                    requests_made += 1;
                }
            }

            let outbound = env.tick();
            events.extend(env.take_events());
            for msg in outbound {
                events.push(Event::SendMessage {
                    from: msg.from,
                    to: msg.to,
                    kind: msg.kind,
                    term: msg.term,
                });
                env.enqueue(msg);
            }
        }

        Ok(IterationOutcome {
            trace,
            events,
            environment: env,
        })
    }

    fn persist_violation(
        &self,
        iteration: usize,
        outcome: &IterationOutcome,
    ) -> Result<(), FuzzError> {
        let dir = self.config.save_path.join("violations");
        fs::create_dir_all(&dir).map_err(|e| FuzzError::Save {
            path: dir.clone(),
            source: e,
        })?;
        let path = dir.join(format!("fuzz_{iteration}.json"));
        let record = ViolationRecord {
            trace: &outcome.trace,
            event_trace: &outcome.events,
        };
        let file = fs::File::create(&path).map_err(|e| FuzzError::Save {
            path: path.clone(),
            source: e,
        })?;
        serde_json::to_writer_pretty(file, &record).map_err(|e| FuzzError::Save {
            path: path.clone(),
            source: e.into(),
        })?;
        warn!(
            "checker violation at iteration {}, trace saved to {}",
            iteration,
            path.display()
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct ViolationRecord<'a> {
    trace: &'a Schedule,
    event_trace: &'a EventTrace,
}

fn valid_channel(from: ReplicaId, to: ReplicaId, replicas: u64) -> bool {
    (1..=replicas).contains(&from) && (1..=replicas).contains(&to) && from != to
}

/// Proposals go to the leader when one is known, else to any live replica.
fn request_target(env: &RaftEnvironment, rng: &mut ChaCha8Rng) -> Option<ReplicaId> {
    if let Some(leader) = env.leader() {
        return Some(leader);
    }
    let live = env.live_nodes();
    if live.is_empty() {
        None
    } else {
        Some(live[rng.gen_range(0..live.len())])
    }
}
