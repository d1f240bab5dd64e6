//! CLI for the raftfuzz engine.
//!
//! # Usage
//!
//! ```bash
//! # Run the fuzzing loop against a line-coverage endpoint
//! raftfuzz --host 127.0.0.1 --port 2023 fuzz
//!
//! # Compare guider/mutator configurations over a fixed budget
//! raftfuzz --episodes 1000 --runs 5 --save results compare
//! ```

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use raftfuzz_engine::checker::serializability_checker;
use raftfuzz_engine::compare::Comparison;
use raftfuzz_engine::environment::RaftEnvironmentConfig;
use raftfuzz_engine::fuzzer::{FuzzError, Fuzzer, FuzzerConfig};
use raftfuzz_engine::guider::{LineCoverageGuider, TlcStateGuider, TraceCoverageGuider};
use raftfuzz_engine::mutator::{
    CombinedMutator, EmptyMutator, Mutator, SwapCrashNodeMutator, SwapMaxMessagesMutator,
    SwapNodeMutator,
};
use raftfuzz_engine::strategy::RandomStrategy;

#[derive(Parser)]
#[command(name = "raftfuzz")]
#[command(about = "Coverage-guided fuzzing for a simulated Raft cluster")]
#[command(version)]
struct Cli {
    /// Number of episodes to run.
    #[arg(short, long, default_value_t = 10_000)]
    episodes: usize,

    /// Horizon (steps) of each episode.
    #[arg(long, default_value_t = 50)]
    horizon: usize,

    /// Save results under this path.
    #[arg(short, long, default_value = "results")]
    save: PathBuf,

    /// Number of replicas in the simulated cluster.
    #[arg(short, long, default_value_t = 3)]
    replicas: u64,

    /// Number of initial client requests to serve.
    #[arg(long, default_value_t = 1)]
    requests: u64,

    /// Number of runs to average over (compare mode).
    #[arg(long, default_value_t = 5)]
    runs: usize,

    /// Record every explored trace under the save path.
    #[arg(long)]
    record_traces: bool,

    /// Oracle server host (TLC / line coverage).
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Oracle server port.
    #[arg(long, default_value_t = 2023)]
    port: u16,

    /// Master seed for reproducible runs.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fuzzing loop.
    Fuzz,
    /// Run the guider/mutator comparison harness.
    Compare,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fuzz => cmd_fuzz(&cli),
        Commands::Compare => cmd_compare(&cli),
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn cmd_fuzz(cli: &Cli) -> Result<(), FuzzError> {
    let address = format!("{}:{}", cli.host, cli.port);
    let config = FuzzerConfig {
        iterations: cli.episodes,
        steps: cli.horizon,
        raft: RaftEnvironmentConfig {
            replicas: cli.replicas,
            election_tick: 20,
            heartbeat_tick: 2,
            ticks_per_step: 2,
        },
        mut_per_trace: 5,
        number_requests: cli.requests,
        crash_quota: 2,
        max_messages: 10,
        seed_population_size: 10,
        reseed_frequency: 2_000,
        seed: cli.seed,
        save_path: cli.save.clone(),
    };

    let record_dir = cli.record_traces.then(|| cli.save.join("traces"));
    let guider = LineCoverageGuider::new(&address, record_dir);
    let strategy = RandomStrategy::new(cli.replicas, config.max_messages, cli.seed);

    let mut fuzzer = Fuzzer::new(
        config,
        Box::new(strategy),
        Box::new(guider),
        Box::new(EmptyMutator),
        None,
    )?;
    let stats = fuzzer.run()?;

    println!("Episodes:           {}", cli.episodes);
    println!("Random executions:  {}", stats.random_executions);
    println!("Mutated executions: {}", stats.mutated_executions);
    println!("New states:         {}", stats.new_states);
    println!(
        "Final coverage:     {}",
        stats.coverage_series.last().copied().unwrap_or(0)
    );
    Ok(())
}

fn cmd_compare(cli: &Cli) -> Result<(), FuzzError> {
    let address = format!("{}:{}", cli.host, cli.port);
    let config = FuzzerConfig {
        iterations: cli.episodes,
        steps: cli.horizon,
        raft: RaftEnvironmentConfig {
            replicas: cli.replicas,
            // A higher election tick gives random schedules better chances
            // (fewer timeouts); ticks per step should stay well under it so
            // replicas are not starved.
            election_tick: 12,
            heartbeat_tick: 2,
            ticks_per_step: 3,
        },
        // Too many mutants per trace degenerates into very local search.
        mut_per_trace: 5,
        number_requests: cli.requests,
        crash_quota: 10,
        max_messages: 5,
        seed_population_size: 10,
        reseed_frequency: 2_000,
        seed: cli.seed,
        save_path: cli.save.clone(),
    };
    let horizon = cli.horizon;
    let replicas = cli.replicas;
    let max_messages = config.max_messages;
    let record_dir = |name: &str| {
        cli.record_traces
            .then(|| cli.save.join(name).join("traces"))
    };

    let combined = |seed: u64| -> Box<dyn Mutator> {
        Box::new(CombinedMutator::new(
            vec![
                Box::new(SwapCrashNodeMutator::new(2, replicas, horizon, seed)),
                Box::new(SwapNodeMutator::new(20, seed.wrapping_add(1))),
                Box::new(SwapMaxMessagesMutator::new(
                    20,
                    max_messages,
                    seed.wrapping_add(2),
                )),
            ],
            seed,
        ))
    };

    let mut comparison = Comparison::new(cli.save.clone(), config, cli.runs);
    comparison.add(
        "traceCov",
        combined(cli.seed),
        Box::new(TraceCoverageGuider::new(&address, record_dir("traceCov"))),
        Some(serializability_checker()),
    )?;
    comparison.add(
        "lineCov",
        combined(cli.seed.wrapping_add(10)),
        Box::new(LineCoverageGuider::new(&address, record_dir("lineCov"))),
        Some(serializability_checker()),
    )?;
    comparison.add(
        "tlcstate",
        combined(cli.seed.wrapping_add(20)),
        Box::new(TlcStateGuider::new(&address, record_dir("tlcstate"))),
        Some(serializability_checker()),
    )?;
    comparison.add(
        "random",
        Box::new(EmptyMutator),
        Box::new(TlcStateGuider::new(&address, record_dir("random"))),
        Some(serializability_checker()),
    )?;

    comparison.run()
}
