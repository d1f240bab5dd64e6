//! The per-step random decision oracle.
//!
//! When a mutated schedule does not pin a specific choice, the fuzzer asks
//! the strategy. [`RandomStrategy`] draws uniformly over the legal ranges
//! and is reseeded per iteration from `(run_seed, iteration)` so runs are
//! reproducible.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use raftfuzz_raft::ReplicaId;

/// Decision oracle consulted for every unpinned scheduling choice.
pub trait Strategy {
    /// A message channel: `(from, to, max_messages)` with
    /// `1 <= from, to <= N`, `from != to`, `1 <= max_messages <= config max`.
    fn pick_node(&mut self) -> (ReplicaId, ReplicaId, usize);
    fn pick_bool(&mut self) -> bool;
    fn pick_int(&mut self) -> i64;
    /// Rewind the oracle onto a fresh deterministic stream.
    fn reseed(&mut self, seed: u64);
}

/// Uniformly random strategy over a seedable PRNG.
pub struct RandomStrategy {
    replicas: u64,
    max_messages: usize,
    rng: ChaCha8Rng,
}

impl RandomStrategy {
    pub fn new(replicas: u64, max_messages: usize, seed: u64) -> Self {
        Self {
            replicas: replicas.max(1),
            max_messages: max_messages.max(1),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Strategy for RandomStrategy {
    fn pick_node(&mut self) -> (ReplicaId, ReplicaId, usize) {
        let from = self.rng.gen_range(1..=self.replicas);
        // Draw `to` from the remaining ids so `from != to` holds by
        // construction (degenerate single-replica clusters self-loop).
        let to = if self.replicas == 1 {
            from
        } else {
            let raw = self.rng.gen_range(1..self.replicas);
            if raw >= from {
                raw + 1
            } else {
                raw
            }
        };
        let max_messages = self.rng.gen_range(1..=self.max_messages);
        (from, to, max_messages)
    }

    fn pick_bool(&mut self) -> bool {
        self.rng.gen_bool(0.5)
    }

    fn pick_int(&mut self) -> i64 {
        self.rng.gen_range(0..i64::MAX)
    }

    fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_node_stays_in_range() {
        let mut strategy = RandomStrategy::new(3, 5, 42);
        for _ in 0..1000 {
            let (from, to, max) = strategy.pick_node();
            assert!((1..=3).contains(&from));
            assert!((1..=3).contains(&to));
            assert_ne!(from, to);
            assert!((1..=5).contains(&max));
        }
    }

    #[test]
    fn pick_node_covers_all_pairs() {
        let mut strategy = RandomStrategy::new(3, 5, 7);
        let mut pairs = std::collections::BTreeSet::new();
        for _ in 0..1000 {
            let (from, to, _) = strategy.pick_node();
            pairs.insert((from, to));
        }
        assert_eq!(pairs.len(), 6);
    }

    #[test]
    fn reseed_replays_the_same_stream() {
        let mut a = RandomStrategy::new(3, 5, 1);
        let mut b = RandomStrategy::new(3, 5, 2);
        b.reseed(1);
        for _ in 0..100 {
            assert_eq!(a.pick_node(), b.pick_node());
            assert_eq!(a.pick_bool(), b.pick_bool());
            assert_eq!(a.pick_int(), b.pick_int());
        }
    }

    #[test]
    fn pick_int_is_non_negative() {
        let mut strategy = RandomStrategy::new(3, 5, 9);
        for _ in 0..100 {
            assert!(strategy.pick_int() >= 0);
        }
    }
}
