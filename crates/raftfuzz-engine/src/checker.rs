//! End-of-iteration cluster invariant checks.

use crate::environment::RaftEnvironment;

/// A predicate over the finished iteration's cluster. `false` marks the
/// iteration as a buggy execution; it never aborts the run.
pub type Checker = Box<dyn Fn(&RaftEnvironment) -> bool>;

/// The committed logs of all replicas must be pairwise prefix-consistent:
/// no two replicas may commit different entries at the same index.
pub fn serializability_checker() -> Checker {
    Box::new(|env| {
        let committed = env.committed();
        let logs: Vec<_> = committed.values().collect();
        for (i, a) in logs.iter().enumerate() {
            for b in &logs[i + 1..] {
                let common = a.len().min(b.len());
                if a[..common] != b[..common] {
                    return false;
                }
            }
        }
        true
    })
}
