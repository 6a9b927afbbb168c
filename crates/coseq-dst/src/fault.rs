//! Deterministic fault injection for sequence simulations.
//!
//! Faults come from two sides:
//! - the routine: raises in the body, raises or extra yields inside cleanup
//! - the consumer: early `return`, injected `throw`, step delays that push a
//!   consumer past its deadline

use serde::Serialize;

use crate::random::DeterministicRng;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultConfig {
    /// Chance that a generated routine step raises.
    pub routine_raise_probability: f64,
    /// Chance that a generated cleanup action raises.
    pub cleanup_raise_probability: f64,
    /// Chance that a generated cleanup action yields.
    pub cleanup_yield_probability: f64,
    /// Chance that the consumer closes the sequence early.
    pub early_return_probability: f64,
    /// Chance that the consumer injects an error.
    pub throw_probability: f64,
    /// Chance that a step costs simulated time.
    pub delay_probability: f64,
    pub delay_ns_max: u64,
    /// Consumer time budget per sequence; zero disables deadlines.
    pub deadline_ns: u64,
    pub enabled: bool,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            routine_raise_probability: 0.05,
            cleanup_raise_probability: 0.05,
            cleanup_yield_probability: 0.1,
            early_return_probability: 0.05,
            throw_probability: 0.05,
            delay_probability: 0.1,
            delay_ns_max: 5_000_000,
            deadline_ns: 50_000_000,
            enabled: true,
        }
    }
}

impl FaultConfig {
    /// No faults; every lane can be checked against its script oracle.
    #[must_use]
    pub fn none() -> Self {
        Self {
            routine_raise_probability: 0.0,
            cleanup_raise_probability: 0.0,
            cleanup_yield_probability: 0.0,
            early_return_probability: 0.0,
            throw_probability: 0.0,
            delay_probability: 0.0,
            delay_ns_max: 0,
            deadline_ns: 0,
            enabled: false,
        }
    }

    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            routine_raise_probability: 0.15,
            cleanup_raise_probability: 0.15,
            cleanup_yield_probability: 0.2,
            early_return_probability: 0.15,
            throw_probability: 0.2,
            delay_probability: 0.3,
            delay_ns_max: 20_000_000,
            deadline_ns: 40_000_000,
            enabled: true,
        }
    }

    /// Cleanup that raises and yields often; stresses unwinding.
    #[must_use]
    pub fn cleanup_heavy() -> Self {
        Self {
            cleanup_raise_probability: 0.35,
            cleanup_yield_probability: 0.4,
            early_return_probability: 0.2,
            ..Self::default()
        }
    }

    /// Preset by name, as accepted on the command line.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::none()),
            "default" => Some(Self::default()),
            "aggressive" => Some(Self::aggressive()),
            "cleanup-heavy" | "cleanup_heavy" => Some(Self::cleanup_heavy()),
            _ => None,
        }
    }

    fn probabilities(&self) -> [f64; 6] {
        [
            self.routine_raise_probability,
            self.cleanup_raise_probability,
            self.cleanup_yield_probability,
            self.early_return_probability,
            self.throw_probability,
            self.delay_probability,
        ]
    }
}

/// What the consumer does instead of a plain `next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerFault {
    None,
    EarlyReturn,
    Throw,
}

/// Counts of injected faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultStats {
    pub routine_raises_count: u64,
    pub cleanup_raises_count: u64,
    pub cleanup_yields_count: u64,
    pub early_returns_count: u64,
    pub throws_count: u64,
    pub delays_count: u64,
    pub deadlines_count: u64,
}

impl FaultStats {
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.routine_raises_count
            + self.cleanup_raises_count
            + self.cleanup_yields_count
            + self.early_returns_count
            + self.throws_count
            + self.delays_count
            + self.deadlines_count
    }

    pub fn merge(&mut self, other: &FaultStats) {
        self.routine_raises_count += other.routine_raises_count;
        self.cleanup_raises_count += other.cleanup_raises_count;
        self.cleanup_yields_count += other.cleanup_yields_count;
        self.early_returns_count += other.early_returns_count;
        self.throws_count += other.throws_count;
        self.delays_count += other.delays_count;
        self.deadlines_count += other.deadlines_count;
    }
}

/// Seeded source of fault decisions.
pub struct FaultInjector {
    rng: DeterministicRng,
    config: FaultConfig,
    stats: FaultStats,
}

/// Fault count past which a run is misconfigured.
const FAULTS_COUNT_MAX: u64 = 10_000_000;

impl FaultInjector {
    #[must_use]
    pub fn new(rng: DeterministicRng, config: FaultConfig) -> Self {
        debug_assert!(
            config.probabilities().iter().all(|p| (0.0..=1.0).contains(p)),
            "Fault probabilities must be in [0.0, 1.0]"
        );
        debug_assert!(
            config.early_return_probability + config.throw_probability <= 1.0,
            "Consumer fault probabilities must not exceed 1.0 together"
        );

        Self {
            rng,
            config,
            stats: FaultStats::default(),
        }
    }

    fn roll(&mut self, probability: f64) -> bool {
        if !self.config.enabled {
            return false;
        }
        let hit = self.rng.gen_bool(probability);
        debug_assert!(self.stats.total_count() < FAULTS_COUNT_MAX, "Runaway fault injection");
        hit
    }

    pub fn routine_raises(&mut self) -> bool {
        let hit = self.roll(self.config.routine_raise_probability);
        self.stats.routine_raises_count += u64::from(hit);
        hit
    }

    pub fn cleanup_raises(&mut self) -> bool {
        let hit = self.roll(self.config.cleanup_raise_probability);
        self.stats.cleanup_raises_count += u64::from(hit);
        hit
    }

    pub fn cleanup_yields(&mut self) -> bool {
        let hit = self.roll(self.config.cleanup_yield_probability);
        self.stats.cleanup_yields_count += u64::from(hit);
        hit
    }

    /// Decide the consumer's next move with a single draw.
    pub fn consumer_fault(&mut self) -> ConsumerFault {
        let early_return = self.config.early_return_probability;
        let throw = self.config.throw_probability;
        if !self.config.enabled || early_return + throw <= 0.0 {
            return ConsumerFault::None;
        }
        let roll: f64 = self.rng.gen();
        if roll < early_return {
            self.stats.early_returns_count += 1;
            ConsumerFault::EarlyReturn
        } else if roll < early_return + throw {
            self.stats.throws_count += 1;
            ConsumerFault::Throw
        } else {
            ConsumerFault::None
        }
    }

    /// Simulated time charged to a step, if any.
    pub fn maybe_delay_ns(&mut self) -> Option<u64> {
        if self.config.delay_ns_max == 0 || !self.roll(self.config.delay_probability) {
            return None;
        }
        self.stats.delays_count += 1;
        Some(self.rng.gen_range(1..=self.config.delay_ns_max))
    }

    /// Note that a consumer ran out of time.
    pub fn record_deadline(&mut self) {
        self.stats.deadlines_count += 1;
    }

    /// Tag for an injected or raised error.
    pub fn gen_tag(&mut self) -> u32 {
        self.rng.gen_range(1..1_000)
    }

    #[must_use]
    pub fn stats(&self) -> FaultStats {
        self.stats
    }

    #[must_use]
    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_fires() {
        let mut fault = FaultInjector::new(DeterministicRng::new(1), FaultConfig::none());
        for _ in 0..500 {
            assert!(!fault.routine_raises());
            assert!(!fault.cleanup_raises());
            assert!(!fault.cleanup_yields());
            assert_eq!(fault.consumer_fault(), ConsumerFault::None);
            assert!(fault.maybe_delay_ns().is_none());
        }
        assert_eq!(fault.stats().total_count(), 0);
    }

    #[test]
    fn test_same_seed_same_faults() {
        let decisions = |seed| {
            let mut fault = FaultInjector::new(DeterministicRng::new(seed), FaultConfig::aggressive());
            (0..200)
                .map(|_| (fault.routine_raises(), fault.consumer_fault(), fault.maybe_delay_ns()))
                .collect::<Vec<_>>()
        };
        assert_eq!(decisions(77), decisions(77));
    }

    #[test]
    fn test_aggressive_fires_everything() {
        let mut fault = FaultInjector::new(DeterministicRng::new(3), FaultConfig::aggressive());
        for _ in 0..2_000 {
            fault.routine_raises();
            fault.cleanup_raises();
            fault.cleanup_yields();
            fault.consumer_fault();
            fault.maybe_delay_ns();
        }
        let stats = fault.stats();
        assert!(stats.routine_raises_count > 0);
        assert!(stats.cleanup_raises_count > 0);
        assert!(stats.cleanup_yields_count > 0);
        assert!(stats.early_returns_count > 0);
        assert!(stats.throws_count > 0);
        assert!(stats.delays_count > 0);
    }

    #[test]
    fn test_delay_within_bounds() {
        let config = FaultConfig {
            delay_probability: 1.0,
            delay_ns_max: 1_000,
            ..FaultConfig::default()
        };
        let mut fault = FaultInjector::new(DeterministicRng::new(8), config);
        for _ in 0..100 {
            let delay = fault.maybe_delay_ns().unwrap();
            assert!((1..=1_000).contains(&delay));
        }
    }

    #[test]
    fn test_disable_at_runtime() {
        let config = FaultConfig {
            throw_probability: 1.0,
            early_return_probability: 0.0,
            ..FaultConfig::default()
        };
        let mut fault = FaultInjector::new(DeterministicRng::new(4), config);
        assert_eq!(fault.consumer_fault(), ConsumerFault::Throw);
        fault.set_enabled(false);
        assert!(!fault.is_enabled());
        assert_eq!(fault.consumer_fault(), ConsumerFault::None);
    }

    #[test]
    fn test_presets_by_name() {
        assert_eq!(FaultConfig::from_name("none"), Some(FaultConfig::none()));
        assert_eq!(FaultConfig::from_name("cleanup-heavy"), Some(FaultConfig::cleanup_heavy()));
        assert!(FaultConfig::from_name("chaos").is_none());
    }

    #[test]
    fn test_merge_stats() {
        let mut total = FaultStats::default();
        let one = FaultStats {
            throws_count: 2,
            delays_count: 1,
            ..FaultStats::default()
        };
        total.merge(&one);
        total.merge(&one);
        assert_eq!(total.throws_count, 4);
        assert_eq!(total.total_count(), 6);
    }
}
