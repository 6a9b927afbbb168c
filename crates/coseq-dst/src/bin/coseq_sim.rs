//! Command-line runner for sequence simulations.
//!
//! # Usage
//!
//! ```bash
//! # Default preset, random seed
//! cargo run -p coseq-dst --features cli --bin coseq-sim
//!
//! # Replay a failure
//! DST_SEED=8123 cargo run -p coseq-dst --features cli --bin coseq-sim -- --iterations 1
//!
//! # Many lanes, cleanup-heavy faults, JSON report
//! cargo run -p coseq-dst --features cli --bin coseq-sim -- --thorough --lanes 16 --faults cleanup-heavy --json
//! ```

use std::process::ExitCode;

use clap::Parser;
use coseq_dst::{get_or_generate_seed, FaultConfig, Simulation, SimulationConfig};
use tracing_subscriber::EnvFilter;

/// Deterministic simulation of coroutine-backed sequences
#[derive(Parser, Debug)]
#[command(name = "coseq-sim")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Seed for the run (default: DST_SEED or random)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Iterations to run (default: DST_ITERATIONS or the preset)
    #[arg(short, long)]
    iterations: Option<u64>,

    /// Sequences interleaved per iteration
    #[arg(short, long)]
    lanes: Option<usize>,

    /// Fault preset: none, default, aggressive, cleanup-heavy
    #[arg(short, long)]
    faults: Option<String>,

    /// Small preset for smoke runs
    #[arg(long, conflicts_with = "thorough")]
    quick: bool,

    /// Large preset for soak runs
    #[arg(long)]
    thorough: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_config(cli: &Cli) -> Result<SimulationConfig, String> {
    let mut config = if cli.quick {
        SimulationConfig::quick()
    } else if cli.thorough {
        SimulationConfig::thorough()
    } else {
        SimulationConfig::from_env()
    };
    if let Some(iterations) = cli.iterations {
        config.iterations = iterations;
    }
    if let Some(lanes) = cli.lanes {
        config.lanes_count = lanes;
    }
    if let Some(name) = &cli.faults {
        config.faults = FaultConfig::from_name(name).ok_or_else(|| format!("unknown fault preset: {}", name))?;
    }
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("Error: {}", message);
            return ExitCode::FAILURE;
        }
    };
    let seed = cli.seed.unwrap_or_else(get_or_generate_seed);

    let simulation = match Simulation::new(seed, config) {
        Ok(simulation) => simulation,
        Err(error) => {
            eprintln!("Error: {}", error);
            return ExitCode::FAILURE;
        }
    };

    match simulation.run() {
        Ok(report) => {
            if cli.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(error) => {
                        eprintln!("Failed to encode report: {}", error);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!("{}", report);
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("{}", error);
            if let Some(seed) = error.seed() {
                eprintln!();
                eprintln!("Replay with: DST_SEED={} coseq-sim --iterations 1", seed);
            }
            ExitCode::FAILURE
        }
    }
}
