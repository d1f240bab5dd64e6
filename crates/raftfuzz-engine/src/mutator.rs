//! Schedule mutation — produces candidate schedules from an executed trace.
//!
//! Every mutator works on a deep copy of its input and is deterministic
//! given its construction seed: each call derives a child seed from the
//! master seed and a counter.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use raftfuzz_raft::ReplicaId;

use crate::event::EventTrace;
use crate::schedule::{Schedule, SchedulingChoice};

/// A mutation operator over schedules. `None` means the operator does not
/// apply to this trace (too few entries of the right kind); the fuzzer
/// discards the attempt and moves on.
pub trait Mutator {
    fn mutate(&mut self, trace: &Schedule, events: &EventTrace) -> Option<Schedule>;
}

fn child_rng(seed: u64, counter: &mut u64) -> ChaCha8Rng {
    let child_seed = seed.wrapping_add(*counter);
    *counter += 1;
    ChaCha8Rng::seed_from_u64(child_seed)
}

/// The "random" baseline: never produces a mutant, so the corpus is only
/// ever fed by reseeding.
pub struct EmptyMutator;

impl Mutator for EmptyMutator {
    fn mutate(&mut self, _trace: &Schedule, _events: &EventTrace) -> Option<Schedule> {
        None
    }
}

/// Permutes pairs of `Node` choices, changing the interleaving of channel
/// deliveries while preserving the multiset of channel payloads.
pub struct SwapNodeMutator {
    swaps: usize,
    seed: u64,
    counter: u64,
}

impl SwapNodeMutator {
    pub fn new(swaps: usize, seed: u64) -> Self {
        Self {
            swaps,
            seed,
            counter: 0,
        }
    }
}

impl Mutator for SwapNodeMutator {
    fn mutate(&mut self, trace: &Schedule, _events: &EventTrace) -> Option<Schedule> {
        let mut rng = child_rng(self.seed, &mut self.counter);
        let positions: Vec<usize> = trace
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_node())
            .map(|(i, _)| i)
            .collect();
        if positions.len() < 2 {
            return None;
        }

        let mut mutated = trace.clone();
        for _ in 0..self.swaps {
            let a = positions[rng.gen_range(0..positions.len())];
            let b = positions[rng.gen_range(0..positions.len())];
            mutated.swap(a, b);
        }
        Some(mutated)
    }
}

/// Reassigns crash targets and jitters crash timing. Matching restart
/// entries are co-updated so a restart keeps following its crash.
pub struct SwapCrashNodeMutator {
    swaps: usize,
    replicas: u64,
    horizon: usize,
    seed: u64,
    counter: u64,
}

impl SwapCrashNodeMutator {
    pub fn new(swaps: usize, replicas: u64, horizon: usize, seed: u64) -> Self {
        Self {
            swaps,
            replicas: replicas.max(1),
            horizon: horizon.max(1),
            seed,
            counter: 0,
        }
    }
}

impl Mutator for SwapCrashNodeMutator {
    fn mutate(&mut self, trace: &Schedule, _events: &EventTrace) -> Option<Schedule> {
        let mut rng = child_rng(self.seed, &mut self.counter);
        let stops: Vec<usize> = trace
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, SchedulingChoice::StopNode { .. }))
            .map(|(i, _)| i)
            .collect();
        if stops.is_empty() {
            return None;
        }

        let mut mutated = trace.clone();
        for _ in 0..self.swaps.min(stops.len()) {
            let pos = stops[rng.gen_range(0..stops.len())];
            let (old_step, old_node) = match mutated[pos] {
                SchedulingChoice::StopNode { step, node } => (step, node),
                _ => continue,
            };

            let new_node = rng.gen_range(1..=self.replicas);
            let mut new_step = old_step;
            let mut shift: i64 = 0;
            if rng.gen_bool(0.5) {
                let delta = rng.gen_range(1..=(self.horizon / 4).max(1)) as i64;
                shift = if rng.gen_bool(0.5) { delta } else { -delta };
                new_step = clamp_step(old_step as i64 + shift, self.horizon);
                shift = new_step as i64 - old_step as i64;
            }
            mutated[pos] = SchedulingChoice::StopNode {
                step: new_step,
                node: new_node,
            };

            // Co-update the first restart of the old target after the crash,
            // keeping start-after-stop.
            for choice in mutated.iter_mut() {
                if let SchedulingChoice::StartNode { step, node } = choice {
                    if *node == old_node && *step >= old_step {
                        let shifted = clamp_step(*step as i64 + shift, self.horizon);
                        *choice = SchedulingChoice::StartNode {
                            step: shifted.max(new_step),
                            node: new_node,
                        };
                        break;
                    }
                }
            }
        }
        Some(mutated)
    }
}

fn clamp_step(step: i64, horizon: usize) -> usize {
    step.clamp(0, horizon as i64 - 1) as usize
}

/// Resamples the delivery budget of `Node` choices.
pub struct SwapMaxMessagesMutator {
    swaps: usize,
    max_messages: usize,
    seed: u64,
    counter: u64,
}

impl SwapMaxMessagesMutator {
    pub fn new(swaps: usize, max_messages: usize, seed: u64) -> Self {
        Self {
            swaps,
            max_messages: max_messages.max(1),
            seed,
            counter: 0,
        }
    }
}

impl Mutator for SwapMaxMessagesMutator {
    fn mutate(&mut self, trace: &Schedule, _events: &EventTrace) -> Option<Schedule> {
        let mut rng = child_rng(self.seed, &mut self.counter);
        let positions: Vec<usize> = trace
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_node())
            .map(|(i, _)| i)
            .collect();
        if positions.is_empty() {
            return None;
        }

        let mut mutated = trace.clone();
        for _ in 0..self.swaps {
            let pos = positions[rng.gen_range(0..positions.len())];
            if let SchedulingChoice::Node { from, to, .. } = mutated[pos] {
                mutated[pos] = SchedulingChoice::Node {
                    from,
                    to,
                    max_messages: rng.gen_range(1..=self.max_messages),
                };
            }
        }
        Some(mutated)
    }
}

/// Picks one constituent mutator uniformly at random per call.
pub struct CombinedMutator {
    mutators: Vec<Box<dyn Mutator>>,
    rng: ChaCha8Rng,
}

impl CombinedMutator {
    pub fn new(mutators: Vec<Box<dyn Mutator>>, seed: u64) -> Self {
        Self {
            mutators,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Mutator for CombinedMutator {
    fn mutate(&mut self, trace: &Schedule, events: &EventTrace) -> Option<Schedule> {
        if self.mutators.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..self.mutators.len());
        self.mutators[pick].mutate(trace, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node(from: ReplicaId, to: ReplicaId, max: usize) -> SchedulingChoice {
        SchedulingChoice::Node {
            from,
            to,
            max_messages: max,
        }
    }

    fn node_multiset(trace: &Schedule) -> BTreeMap<(ReplicaId, ReplicaId, usize), usize> {
        let mut counts = BTreeMap::new();
        for choice in trace {
            if let SchedulingChoice::Node {
                from,
                to,
                max_messages,
            } = *choice
            {
                *counts.entry((from, to, max_messages)).or_insert(0) += 1;
            }
        }
        counts
    }

    fn sample_trace() -> Schedule {
        vec![
            node(1, 2, 5),
            SchedulingChoice::StopNode { step: 2, node: 2 },
            node(2, 3, 1),
            node(3, 1, 4),
            SchedulingChoice::StartNode { step: 7, node: 2 },
            SchedulingChoice::ClientRequest { step: 3, request: 1 },
        ]
    }

    #[test]
    fn empty_mutator_never_mutates() {
        let mut mutator = EmptyMutator;
        assert!(mutator.mutate(&sample_trace(), &Vec::new()).is_none());
    }

    #[test]
    fn swap_node_preserves_payload_multiset() {
        let trace = sample_trace();
        let mut mutator = SwapNodeMutator::new(20, 42);
        for _ in 0..50 {
            let mutated = mutator.mutate(&trace, &Vec::new()).unwrap();
            assert_eq!(node_multiset(&trace), node_multiset(&mutated));
            assert_eq!(mutated.len(), trace.len());
        }
    }

    #[test]
    fn swap_node_needs_two_entries() {
        let trace = vec![node(1, 2, 5)];
        let mut mutator = SwapNodeMutator::new(5, 42);
        assert!(mutator.mutate(&trace, &Vec::new()).is_none());
    }

    #[test]
    fn swap_node_leaves_input_unmodified() {
        let trace = sample_trace();
        let copy = trace.clone();
        let mut mutator = SwapNodeMutator::new(20, 42);
        mutator.mutate(&trace, &Vec::new());
        assert_eq!(trace, copy);
    }

    #[test]
    fn swap_crash_reassigns_targets_in_range() {
        let trace = sample_trace();
        let mut mutator = SwapCrashNodeMutator::new(2, 3, 10, 42);
        for _ in 0..50 {
            let mutated = mutator.mutate(&trace, &Vec::new()).unwrap();
            let stop = mutated
                .iter()
                .find_map(|c| match c {
                    SchedulingChoice::StopNode { step, node } => Some((*step, *node)),
                    _ => None,
                })
                .unwrap();
            assert!((1..=3).contains(&stop.1));
            assert!(stop.0 < 10);

            // The restart keeps trailing the crash.
            if let Some((start_step, start_node)) = mutated.iter().find_map(|c| match c {
                SchedulingChoice::StartNode { step, node } => Some((*step, *node)),
                _ => None,
            }) {
                assert_eq!(start_node, stop.1);
                assert!(start_step >= stop.0);
            }
        }
    }

    #[test]
    fn swap_crash_without_stops_fails() {
        let trace = vec![node(1, 2, 5), node(2, 1, 5)];
        let mut mutator = SwapCrashNodeMutator::new(2, 3, 10, 42);
        assert!(mutator.mutate(&trace, &Vec::new()).is_none());
    }

    #[test]
    fn swap_max_messages_resamples_within_bounds() {
        let trace = sample_trace();
        let mut mutator = SwapMaxMessagesMutator::new(20, 5, 42);
        let mutated = mutator.mutate(&trace, &Vec::new()).unwrap();
        for choice in &mutated {
            if let SchedulingChoice::Node { max_messages, .. } = choice {
                assert!((1..=5).contains(max_messages));
            }
        }
        // Channels themselves are untouched.
        let channels: Vec<_> = mutated
            .iter()
            .filter_map(|c| match c {
                SchedulingChoice::Node { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        assert_eq!(channels, vec![(1, 2), (2, 3), (3, 1)]);
    }

    #[test]
    fn mutators_are_deterministic_per_seed() {
        let trace = sample_trace();
        let mut a = SwapNodeMutator::new(20, 7);
        let mut b = SwapNodeMutator::new(20, 7);
        for _ in 0..10 {
            assert_eq!(a.mutate(&trace, &Vec::new()), b.mutate(&trace, &Vec::new()));
        }
    }

    #[test]
    fn combined_mutator_delegates() {
        let trace = sample_trace();
        let mut combined = CombinedMutator::new(
            vec![
                Box::new(SwapNodeMutator::new(20, 1)),
                Box::new(SwapMaxMessagesMutator::new(20, 5, 2)),
                Box::new(SwapCrashNodeMutator::new(2, 3, 10, 3)),
            ],
            42,
        );
        let mut produced = 0;
        for _ in 0..30 {
            if combined.mutate(&trace, &Vec::new()).is_some() {
                produced += 1;
            }
        }
        // Every constituent applies to this trace.
        assert_eq!(produced, 30);
    }

    #[test]
    fn combined_mutator_empty_set_fails() {
        let mut combined = CombinedMutator::new(Vec::new(), 42);
        assert!(combined.mutate(&sample_trace(), &Vec::new()).is_none());
    }
}
