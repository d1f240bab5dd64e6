//! Runs several named (mutator, guider) configurations over the same
//! iteration budget and tabulates how each grows coverage over time.
//!
//! Configurations share one [`FuzzerConfig`]; each runs `runs` independent
//! runs (distinct run seeds, guider reset in between), executed
//! sequentially so the TLC server sees deterministic load. Per-iteration
//! coverage is averaged over the runs and written as one CSV per
//! configuration under the save path.

use std::fs;
use std::path::PathBuf;

use log::info;

use crate::checker::Checker;
use crate::fuzzer::{FuzzError, Fuzzer, FuzzerConfig};
use crate::guider::Guider;
use crate::mutator::Mutator;
use crate::strategy::RandomStrategy;

// Keeps the per-iteration seed ranges of consecutive runs disjoint.
const RUN_SEED_STRIDE: u64 = 1_000_003;

struct ComparisonEntry {
    name: String,
    fuzzer: Fuzzer,
}

/// The comparison harness.
pub struct Comparison {
    save_path: PathBuf,
    config: FuzzerConfig,
    runs: usize,
    entries: Vec<ComparisonEntry>,
}

impl Comparison {
    pub fn new(save_path: impl Into<PathBuf>, config: FuzzerConfig, runs: usize) -> Self {
        Self {
            save_path: save_path.into(),
            config,
            runs: runs.max(1),
            entries: Vec::new(),
        }
    }

    /// Register a named configuration. Everything but the mutator, guider
    /// and checker is shared; per-entry artifacts land under
    /// `{save}/{name}/`.
    pub fn add(
        &mut self,
        name: &str,
        mutator: Box<dyn Mutator>,
        guider: Box<dyn Guider>,
        checker: Option<Checker>,
    ) -> Result<(), FuzzError> {
        let mut config = self.config.clone();
        config.save_path = self.save_path.join(name);
        let strategy = Box::new(RandomStrategy::new(
            config.raft.replicas,
            config.max_messages,
            config.seed,
        ));
        let fuzzer = Fuzzer::new(config, strategy, guider, mutator, checker)?;
        self.entries.push(ComparisonEntry {
            name: name.to_string(),
            fuzzer,
        });
        Ok(())
    }

    /// Execute every configuration and write one averaged-coverage CSV per
    /// configuration.
    pub fn run(&mut self) -> Result<(), FuzzError> {
        fs::create_dir_all(&self.save_path).map_err(|e| FuzzError::Save {
            path: self.save_path.clone(),
            source: e,
        })?;

        for entry in &mut self.entries {
            let mut sums = vec![0f64; self.config.iterations];
            for run in 0..self.runs {
                let run_seed = self
                    .config
                    .seed
                    .wrapping_add(run as u64 * RUN_SEED_STRIDE);
                entry.fuzzer.reset(run_seed);
                let stats = entry.fuzzer.run()?;
                info!(
                    "{}: run {}/{} finished, coverage {}, buggy {}",
                    entry.name,
                    run + 1,
                    self.runs,
                    stats.coverage_series.last().copied().unwrap_or(0),
                    stats.buggy_executions,
                );
                for (i, coverage) in stats.coverage_series.iter().enumerate() {
                    sums[i] += *coverage as f64;
                }
            }

            let mut csv = String::from("iteration,coverage\n");
            for (iteration, sum) in sums.iter().enumerate() {
                csv.push_str(&format!(
                    "{},{:.2}\n",
                    iteration,
                    sum / self.runs as f64
                ));
            }
            let path = self.save_path.join(format!("{}.csv", entry.name));
            fs::write(&path, csv).map_err(|e| FuzzError::Save {
                path: path.clone(),
                source: e,
            })?;
            info!("{}: wrote {}", entry.name, path.display());
        }
        Ok(())
    }
}
