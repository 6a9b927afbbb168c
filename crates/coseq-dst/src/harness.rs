//! The simulation loop.
//!
//! Each iteration generates one script per lane, builds the sequences, and
//! lets the scheduler interleave drive operations across lanes until every
//! lane retires. Every operation lands in a [`SequenceHistory`] that is
//! checked against the protocol invariants at the end of the iteration.
//!
//! Lanes come in two flavours:
//! - oracle lanes call only `next`, and must observe exactly the yields and
//!   ending the script predicts
//! - fault lanes mix in `send`, early `return`, injected `throw` and
//!   deadlines, and are held to the invariants only

use std::fmt;

use coseq_core::invariants::{OpKind, SequenceHistory, SequencePropertyChecker};
use coseq_core::{PropertyChecker, SequenceState, Step, StepResult};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Deadline;
use crate::env::DstEnv;
use crate::fault::{ConsumerFault, FaultConfig, FaultStats};
use crate::random::DeterministicRng;
use crate::routine::{Ending, EffectCounters, Script, SimError, SimSequence};
use crate::scheduler::LANES_COUNT_MAX;

/// Operations a lane performs on a settled sequence before retiring.
const ABSORBED_OPS_COUNT: u32 = 2;

/// `return` calls a retiring lane may spend closing its sequence.
const CLOSE_ATTEMPTS_MAX: u32 = 1_024;

/// Share of lanes driven without consumer faults when faults are enabled.
const ORACLE_LANE_PROBABILITY: f64 = 0.25;

/// Chance that a fault lane resumes with `send` rather than `next`.
const SEND_PROBABILITY: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationConfig {
    pub iterations: u64,
    pub lanes_count: usize,
    /// Nesting depth of scopes, catches and delegations.
    pub script_depth_max: u32,
    /// Actions per block.
    pub script_length_max: u32,
    /// Operations a fault lane performs before it hangs up.
    pub ops_per_lane_max: u32,
    pub faults: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            iterations: 200,
            lanes_count: 4,
            script_depth_max: 3,
            script_length_max: 4,
            ops_per_lane_max: 32,
            faults: FaultConfig::default(),
        }
    }
}

impl SimulationConfig {
    #[must_use]
    pub fn quick() -> Self {
        Self {
            iterations: 20,
            lanes_count: 2,
            script_depth_max: 2,
            script_length_max: 3,
            ops_per_lane_max: 16,
            faults: FaultConfig::default(),
        }
    }

    #[must_use]
    pub fn thorough() -> Self {
        Self {
            iterations: 2_000,
            lanes_count: 8,
            script_depth_max: 4,
            script_length_max: 5,
            ops_per_lane_max: 64,
            faults: FaultConfig::aggressive(),
        }
    }

    /// Defaults, with `DST_ITERATIONS` overriding the iteration count.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("DST_ITERATIONS") {
            match raw.parse::<u64>() {
                Ok(iterations) if iterations > 0 => config.iterations = iterations,
                _ => warn!(value = %raw, "ignoring invalid DST_ITERATIONS"),
            }
        }
        config
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.iterations == 0 {
            return Err(SimulationError::InvalidConfig("iterations must be positive"));
        }
        if self.lanes_count == 0 || self.lanes_count > LANES_COUNT_MAX {
            return Err(SimulationError::InvalidConfig("lanes must be between 1 and 64"));
        }
        if self.script_length_max == 0 {
            return Err(SimulationError::InvalidConfig("script length must be positive"));
        }
        if self.ops_per_lane_max == 0 {
            return Err(SimulationError::InvalidConfig("ops per lane must be positive"));
        }
        if self.faults.early_return_probability + self.faults.throw_probability > 1.0 {
            return Err(SimulationError::InvalidConfig("consumer fault probabilities exceed 1.0"));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid simulation config: {0}")]
    InvalidConfig(&'static str),

    #[error("{property} violated in iteration {iteration} (DST_SEED={seed})\n{report}")]
    PropertyViolated {
        property: &'static str,
        seed: u64,
        iteration: u64,
        report: String,
    },

    #[error("lane {lane} diverged from its script in iteration {iteration} (DST_SEED={seed}): expected {expected}, observed {observed}")]
    OracleMismatch {
        seed: u64,
        iteration: u64,
        lane: usize,
        expected: String,
        observed: String,
    },

    #[error("lane {lane} ran {ran} of {registered} cleanup scopes in iteration {iteration} (DST_SEED={seed})")]
    CleanupLeak {
        seed: u64,
        iteration: u64,
        lane: usize,
        ran: u64,
        registered: u64,
    },

    #[error("lane {lane} did not settle after {attempts} close attempts in iteration {iteration} (DST_SEED={seed})")]
    Unsettled {
        seed: u64,
        iteration: u64,
        lane: usize,
        attempts: u32,
    },
}

impl SimulationError {
    /// Seed that replays the failing iteration.
    #[must_use]
    pub fn seed(&self) -> Option<u64> {
        match self {
            Self::InvalidConfig(_) => None,
            Self::PropertyViolated { seed, .. }
            | Self::OracleMismatch { seed, .. }
            | Self::CleanupLeak { seed, .. }
            | Self::Unsettled { seed, .. } => Some(*seed),
        }
    }
}

/// Totals over one or more iterations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub iterations_count: u64,
    pub lanes_count: u64,
    pub oracle_lanes_count: u64,
    pub operations_count: u64,
    pub yields_count: u64,
    pub completed_count: u64,
    pub errored_count: u64,
    pub cleanup_count: u64,
    pub properties_checked_count: u64,
    pub faults: FaultStats,
    /// Simulated time across all iterations.
    pub elapsed_ns: u64,
}

impl SimulationReport {
    pub fn merge(&mut self, other: &SimulationReport) {
        self.iterations_count += other.iterations_count;
        self.lanes_count += other.lanes_count;
        self.oracle_lanes_count += other.oracle_lanes_count;
        self.operations_count += other.operations_count;
        self.yields_count += other.yields_count;
        self.completed_count += other.completed_count;
        self.errored_count += other.errored_count;
        self.cleanup_count += other.cleanup_count;
        self.properties_checked_count += other.properties_checked_count;
        self.faults.merge(&other.faults);
        self.elapsed_ns += other.elapsed_ns;
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DST_SEED={}", self.seed)?;
        writeln!(
            f,
            "iterations={} lanes={} (oracle {}) operations={} yields={}",
            self.iterations_count, self.lanes_count, self.oracle_lanes_count, self.operations_count, self.yields_count
        )?;
        writeln!(
            f,
            "completed={} errored={} cleanup_runs={} properties_checked={}",
            self.completed_count, self.errored_count, self.cleanup_count, self.properties_checked_count
        )?;
        write!(
            f,
            "faults={} (throws {}, early returns {}, deadlines {}, cleanup raises {}) simulated={}ms",
            self.faults.total_count(),
            self.faults.throws_count,
            self.faults.early_returns_count,
            self.faults.deadlines_count,
            self.faults.cleanup_raises_count,
            self.elapsed_ns / 1_000_000
        )
    }
}

/// A consumer operation about to be performed.
#[derive(Debug, Clone, Copy)]
enum Drive {
    Next,
    Send(u32),
    Return(Option<u32>),
    Throw(SimError),
}

impl Drive {
    fn kind(self) -> OpKind {
        match self {
            Self::Next => OpKind::Next,
            Self::Send(_) => OpKind::Send,
            Self::Return(_) => OpKind::Return,
            Self::Throw(_) => OpKind::Throw,
        }
    }

    fn perform(self, sequence: &SimSequence<'_>) -> StepResult<u32, u32, SimError> {
        match self {
            Self::Next => sequence.next(),
            Self::Send(value) => sequence.send(value),
            Self::Return(value) => sequence.return_(value),
            Self::Throw(error) => sequence.throw(error),
        }
    }
}

struct Lane<'p> {
    index: usize,
    script: &'p Script,
    effects: &'p EffectCounters,
    sequence: Option<SimSequence<'p>>,
    oracle: bool,
    deadline: Option<Deadline>,
    ops_count: u32,
    absorbed_count: u32,
    yields: Vec<u32>,
    ending: Option<Ending>,
    final_state: SequenceState,
}

impl<'p> Lane<'p> {
    fn new(index: usize, script: &'p Script, effects: &'p EffectCounters, oracle: bool, deadline: Option<Deadline>) -> Self {
        Self {
            index,
            script,
            effects,
            sequence: Some(script.build(effects)),
            oracle,
            deadline,
            ops_count: 0,
            absorbed_count: 0,
            yields: Vec::new(),
            ending: None,
            final_state: SequenceState::Created,
        }
    }

    fn choose(&self, env: &mut DstEnv, state: SequenceState) -> Drive {
        if self.oracle {
            return Drive::Next;
        }
        if state.is_terminal() {
            return match env.rng().gen_range(0..4u32) {
                0 => Drive::Next,
                1 => Drive::Send(0),
                2 => Drive::Return(Some(0)),
                _ => Drive::Throw(SimError::Injected(0)),
            };
        }
        if self.deadline.is_some_and(|deadline| deadline.is_expired(env.clock())) {
            env.fault().record_deadline();
            return Drive::Return(None);
        }
        match env.fault().consumer_fault() {
            ConsumerFault::EarlyReturn => Drive::Return(Some(env.fault().gen_tag())),
            ConsumerFault::Throw => Drive::Throw(SimError::Injected(env.fault().gen_tag())),
            ConsumerFault::None if env.rng().gen_bool(SEND_PROBABILITY) => Drive::Send(env.rng().gen_range(0..100)),
            ConsumerFault::None => Drive::Next,
        }
    }

    fn apply(&mut self, drive: Drive, history: &mut SequenceHistory) -> Option<SequenceState> {
        let sequence = self.sequence.as_ref()?;
        let before = sequence.state();
        let result = drive.perform(sequence);
        let after = sequence.state();
        history.record_step(sequence.id().as_u64(), drive.kind(), before, &result, after, self.effects.snapshot());
        debug!(lane = self.index, sequence = %sequence.id(), op = %drive.kind(), from = %before, to = %after, "lane step");

        match &result {
            Ok(Step::Yield(value)) => self.yields.push(*value),
            _ if !before.is_terminal() && after.is_terminal() => self.ending = Ending::of(&result),
            _ => {}
        }
        if before.is_terminal() {
            self.absorbed_count += 1;
        }
        Some(after)
    }

    /// Perform one operation; `true` once the lane is ready to retire.
    fn step(&mut self, env: &mut DstEnv, history: &mut SequenceHistory, ops_max: u32) -> bool {
        let Some(state) = self.sequence.as_ref().map(|sequence| sequence.state()) else {
            return true;
        };
        let drive = self.choose(env, state);
        env.charge_step();
        self.ops_count += 1;
        let Some(after) = self.apply(drive, history) else {
            return true;
        };
        if after.is_terminal() {
            return self.absorbed_count >= ABSORBED_OPS_COUNT;
        }
        !self.oracle && self.ops_count >= ops_max
    }

    /// Close the sequence if the consumer hung up early, then drop it.
    fn retire(&mut self, history: &mut SequenceHistory, seed: u64, iteration: u64) -> Result<(), SimulationError> {
        let mut attempts = 0;
        while let Some(state) = self.sequence.as_ref().map(|sequence| sequence.state()) {
            if state.is_terminal() {
                self.final_state = state;
                self.sequence = None;
                break;
            }
            if attempts >= CLOSE_ATTEMPTS_MAX {
                return Err(SimulationError::Unsettled {
                    seed,
                    iteration,
                    lane: self.index,
                    attempts,
                });
            }
            attempts += 1;
            self.apply(Drive::Return(None), history);
        }
        Ok(())
    }

    fn verify(&self, seed: u64, iteration: u64) -> Result<(), SimulationError> {
        let effects = self.effects.snapshot();
        if !self.effects.is_balanced() {
            return Err(SimulationError::CleanupLeak {
                seed,
                iteration,
                lane: self.index,
                ran: effects.cleanup_count,
                registered: effects.cleanup_registered_count,
            });
        }
        if !self.oracle {
            return Ok(());
        }
        let expected = self.script.oracle();
        if expected.yields != self.yields || Some(expected.ending) != self.ending {
            let observed = match self.ending {
                Some(ending) => ending.to_string(),
                None => "no ending".to_string(),
            };
            return Err(SimulationError::OracleMismatch {
                seed,
                iteration,
                lane: self.index,
                expected: format!("{:?} then {}", expected.yields, expected.ending),
                observed: format!("{:?} then {}", self.yields, observed),
            });
        }
        Ok(())
    }
}

/// A seeded run of many iterations.
///
/// The first iteration uses the run's seed directly; later ones derive
/// their seeds from it. A failure names its iteration seed, so
/// `DST_SEED=<seed>` with one iteration replays it.
///
/// ```rust
/// use coseq_dst::{Simulation, SimulationConfig};
///
/// let simulation = Simulation::new(42, SimulationConfig::quick()).unwrap();
/// let report = simulation.run().unwrap();
/// assert_eq!(report.iterations_count, 20);
/// ```
pub struct Simulation {
    seed: u64,
    config: SimulationConfig,
}

impl Simulation {
    pub fn new(seed: u64, config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        Ok(Self { seed: seed.max(1), config })
    }

    /// Seed from `DST_SEED`, config from `DST_ITERATIONS`.
    pub fn from_env() -> Result<Self, SimulationError> {
        Self::new(crate::get_or_generate_seed(), SimulationConfig::from_env())
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn run(&self) -> Result<SimulationReport, SimulationError> {
        info!(seed = self.seed, iterations = self.config.iterations, lanes = self.config.lanes_count, "simulation started");

        let mut seeds = DeterministicRng::new(self.seed);
        let mut report = SimulationReport {
            seed: self.seed,
            ..SimulationReport::default()
        };
        for iteration in 0..self.config.iterations {
            let seed = if iteration == 0 { self.seed } else { seeds.gen_seed() };
            let outcome = self.run_iteration(iteration, seed);
            match outcome {
                Ok(iteration_report) => report.merge(&iteration_report),
                Err(error) => {
                    warn!(iteration, seed, %error, "simulation failed");
                    return Err(error);
                }
            }
        }

        info!(
            seed = self.seed,
            operations = report.operations_count,
            faults = report.faults.total_count(),
            "simulation passed"
        );
        Ok(report)
    }

    /// Run a single iteration from its own seed.
    pub fn run_iteration(&self, iteration: u64, seed: u64) -> Result<SimulationReport, SimulationError> {
        let config = &self.config;
        let mut env = DstEnv::new(seed, config.faults.clone(), config.lanes_count);

        let scripts: Vec<Script> = (0..config.lanes_count)
            .map(|lane| {
                let mut rng = env.script_rng(lane);
                Script::generate(&mut rng, env.fault(), config.script_depth_max, config.script_length_max)
            })
            .collect();
        let effects: Vec<EffectCounters> = scripts.iter().map(|_| EffectCounters::new()).collect();

        let faults_enabled = env.fault().is_enabled();
        let mut lanes: Vec<Lane<'_>> = Vec::with_capacity(scripts.len());
        for (index, (script, effects)) in scripts.iter().zip(&effects).enumerate() {
            let oracle = !faults_enabled || env.rng().gen_bool(ORACLE_LANE_PROBABILITY);
            let deadline = (!oracle && config.faults.deadline_ns > 0)
                .then(|| env.clock().deadline_after_ns(config.faults.deadline_ns));
            lanes.push(Lane::new(index, script, effects, oracle, deadline));
        }

        let mut history = SequenceHistory::new();
        while let Some(index) = env.scheduler().decide().lane() {
            let lane = &mut lanes[index];
            if lane.step(&mut env, &mut history, config.ops_per_lane_max) {
                env.scheduler().retire(index);
                lane.retire(&mut history, seed, iteration)?;
                lane.verify(seed, iteration)?;
            }
        }

        let checker = SequencePropertyChecker::new(&history).with_seed(seed);
        let summary = checker.summary();
        if let Some(failure) = summary.results.iter().find(|result| !result.holds) {
            return Err(SimulationError::PropertyViolated {
                property: failure.name,
                seed,
                iteration,
                report: summary.format_report(),
            });
        }

        let stats = env.stats();
        debug!(iteration, %stats, operations = history.operations_count(), "iteration passed");

        Ok(SimulationReport {
            seed,
            iterations_count: 1,
            lanes_count: lanes.len() as u64,
            oracle_lanes_count: lanes.iter().filter(|lane| lane.oracle).count() as u64,
            operations_count: history.operations_count() as u64,
            yields_count: lanes.iter().map(|lane| lane.yields.len() as u64).sum(),
            completed_count: lanes.iter().filter(|lane| lane.final_state == SequenceState::Completed).count() as u64,
            errored_count: lanes.iter().filter(|lane| lane.final_state == SequenceState::Errored).count() as u64,
            cleanup_count: effects.iter().map(|effects| effects.snapshot().cleanup_count).sum(),
            properties_checked_count: summary.total_count(),
            faults: stats.faults,
            elapsed_ns: stats.elapsed_ns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_run_passes() {
        let report = Simulation::new(42, SimulationConfig::quick()).unwrap().run().unwrap();
        assert_eq!(report.iterations_count, 20);
        assert_eq!(report.lanes_count, 40);
        assert_eq!(report.properties_checked_count, 100);
        assert!(report.operations_count > 0);
        assert_eq!(report.completed_count + report.errored_count, report.lanes_count);
    }

    #[test]
    fn test_without_faults_every_lane_is_oracle_checked() {
        let config = SimulationConfig {
            faults: FaultConfig::none(),
            ..SimulationConfig::quick()
        };
        let report = Simulation::new(7, config).unwrap().run().unwrap();
        assert_eq!(report.oracle_lanes_count, report.lanes_count);
        assert_eq!(report.faults.total_count(), 0);
        assert_eq!(report.elapsed_ns, 0);
    }

    #[test]
    fn test_aggressive_faults_hold_invariants() {
        let config = SimulationConfig {
            iterations: 100,
            faults: FaultConfig::aggressive(),
            ..SimulationConfig::default()
        };
        let report = Simulation::new(1234, config).unwrap().run().unwrap();
        assert!(report.faults.throws_count > 0);
        assert!(report.faults.early_returns_count > 0);
        assert!(report.errored_count > 0);
    }

    #[test]
    fn test_cleanup_heavy_faults_hold_invariants() {
        let config = SimulationConfig {
            iterations: 100,
            faults: FaultConfig::cleanup_heavy(),
            ..SimulationConfig::default()
        };
        let report = Simulation::new(99, config).unwrap().run().unwrap();
        assert!(report.faults.cleanup_raises_count > 0);
        assert!(report.cleanup_count > 0);
    }

    #[test]
    fn test_same_seed_same_report() {
        let run = || Simulation::new(555, SimulationConfig::quick()).unwrap().run().unwrap();
        assert_eq!(run(), run());
    }

    #[test]
    fn test_iteration_replays_from_its_seed() {
        let simulation = Simulation::new(31, SimulationConfig::quick()).unwrap();
        let first = simulation.run_iteration(0, 8_888).unwrap();
        let again = simulation.run_iteration(5, 8_888).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SimulationConfig {
            lanes_count: 0,
            ..SimulationConfig::quick()
        };
        let error = Simulation::new(1, config).err().unwrap();
        assert!(matches!(error, SimulationError::InvalidConfig(_)));
        assert_eq!(error.seed(), None);
    }

    #[test]
    fn test_report_display() {
        let report = Simulation::new(3, SimulationConfig::quick()).unwrap().run().unwrap();
        let text = report.to_string();
        assert!(text.starts_with("DST_SEED=3\n"));
        assert!(text.contains("iterations=20"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["iterations_count"], 20);
    }
}
