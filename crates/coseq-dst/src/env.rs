//! One simulation iteration's deterministic context.

use std::fmt;

use serde::Serialize;

use crate::clock::SimClock;
use crate::fault::{FaultConfig, FaultInjector, FaultStats};
use crate::random::{DeterministicRng, Stream};
use crate::scheduler::Scheduler;

/// Clock, randomness, faults and lane scheduling derived from one seed.
///
/// ```rust
/// use coseq_dst::{DstEnv, FaultConfig};
///
/// let mut env = DstEnv::new(12345, FaultConfig::default(), 3);
/// let lane = env.scheduler().decide().lane();
/// assert!(lane.is_some());
/// env.charge_step();
/// assert!(env.format_seed().starts_with("DST_SEED=12345"));
/// ```
pub struct DstEnv {
    seed: u64,
    clock: SimClock,
    rng: DeterministicRng,
    fault: FaultInjector,
    scheduler: Scheduler,
}

impl DstEnv {
    #[must_use]
    pub fn new(seed: u64, fault_config: FaultConfig, lanes_count: usize) -> Self {
        debug_assert!(seed != 0, "Seed should not be zero");
        debug_assert!(lanes_count > 0, "Must have at least one lane");

        let iteration = DeterministicRng::new(seed);
        let rng = iteration.stream(Stream::Consumer);
        let fault = FaultInjector::new(iteration.stream(Stream::Faults), fault_config);
        let scheduler = Scheduler::with_defaults(iteration.stream(Stream::Scheduler), lanes_count);

        Self {
            seed,
            clock: SimClock::new(),
            rng,
            fault,
            scheduler,
        }
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn rng(&mut self) -> &mut DeterministicRng {
        &mut self.rng
    }

    pub fn fault(&mut self) -> &mut FaultInjector {
        &mut self.fault
    }

    pub fn scheduler(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Generator for the script of `lane`.
    #[must_use]
    pub fn script_rng(&self, lane: usize) -> DeterministicRng {
        DeterministicRng::new(self.seed).stream(Stream::Script(lane))
    }

    /// Charge one drive operation's simulated cost to the clock.
    pub fn charge_step(&mut self) -> u64 {
        let delay_ns = self.fault.maybe_delay_ns().unwrap_or(0);
        self.clock.sleep_ns(delay_ns);
        delay_ns
    }

    #[must_use]
    pub fn format_seed(&self) -> String {
        format!("DST_SEED={}", self.seed)
    }

    #[must_use]
    pub fn stats(&self) -> DstStats {
        DstStats {
            seed: self.seed,
            elapsed_ns: self.clock.now_ns(),
            rng_draws_count: self.rng.draws_count(),
            faults: self.fault.stats(),
            decisions_count: self.scheduler.decisions_count(),
            switches_count: self.scheduler.switches_count(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DstStats {
    pub seed: u64,
    /// Simulated time spent.
    pub elapsed_ns: u64,
    pub rng_draws_count: u64,
    pub faults: FaultStats,
    pub decisions_count: u64,
    pub switches_count: u64,
}

impl fmt::Display for DstStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DST_SEED={} elapsed={}ms rng_draws={} faults={} lane_switches={}/{}",
            self.seed,
            self.elapsed_ns / 1_000_000,
            self.rng_draws_count,
            self.faults.total_count(),
            self.switches_count,
            self.decisions_count
        )
    }
}
