//! Deterministic interleaving of simulation lanes.
//!
//! A lane is one sequence together with its consumer. All lanes share a
//! thread; the scheduler decides which lane performs the next drive
//! operation, so independent sequences are exercised interleaved rather
//! than one after another.

use crate::random::DeterministicRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Keep driving the current lane.
    Continue(usize),
    /// Switch to another lane.
    SwitchTo(usize),
    /// Every lane has retired.
    Idle,
}

impl ScheduleDecision {
    /// Lane to drive next, if any.
    #[must_use]
    pub fn lane(self) -> Option<usize> {
        match self {
            Self::Continue(lane) | Self::SwitchTo(lane) => Some(lane),
            Self::Idle => None,
        }
    }
}

pub struct Scheduler {
    rng: DeterministicRng,
    /// Lanes that still have operations to perform, in creation order.
    active: Vec<usize>,
    current_lane: Option<usize>,
    switch_probability: f64,
    decisions_count: u64,
    switches_count: u64,
}

pub const LANES_COUNT_MAX: usize = 64;

const DECISIONS_COUNT_MAX: u64 = 10_000_000;

impl Scheduler {
    #[must_use]
    pub fn new(rng: DeterministicRng, lanes_count: usize, switch_probability: f64) -> Self {
        debug_assert!(lanes_count > 0, "Must have at least one lane");
        debug_assert!(
            lanes_count <= LANES_COUNT_MAX,
            "Too many lanes: {} > {}",
            lanes_count,
            LANES_COUNT_MAX
        );
        debug_assert!((0.0..=1.0).contains(&switch_probability), "Switch probability must be in [0.0, 1.0]");

        Self {
            rng,
            active: (0..lanes_count).collect(),
            current_lane: None,
            switch_probability,
            decisions_count: 0,
            switches_count: 0,
        }
    }

    /// Switch lanes on roughly a third of the decisions.
    #[must_use]
    pub fn with_defaults(rng: DeterministicRng, lanes_count: usize) -> Self {
        Self::new(rng, lanes_count, 0.3)
    }

    #[must_use]
    pub fn current_lane(&self) -> Option<usize> {
        self.current_lane
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn decisions_count(&self) -> u64 {
        self.decisions_count
    }

    #[must_use]
    pub fn switches_count(&self) -> u64 {
        self.switches_count
    }

    /// Pick the lane for the next operation.
    pub fn decide(&mut self) -> ScheduleDecision {
        self.decisions_count += 1;
        debug_assert!(self.decisions_count < DECISIONS_COUNT_MAX, "Runaway scheduling");

        if self.active.is_empty() {
            self.current_lane = None;
            return ScheduleDecision::Idle;
        }

        let current = self.current_lane.filter(|lane| self.active.contains(lane));
        match current {
            Some(lane) if self.active.len() == 1 || !self.rng.gen_bool(self.switch_probability) => {
                ScheduleDecision::Continue(lane)
            }
            _ => {
                let lane = self.pick_other_lane(current);
                self.current_lane = Some(lane);
                self.switches_count += 1;
                ScheduleDecision::SwitchTo(lane)
            }
        }
    }

    fn pick_other_lane(&mut self, current: Option<usize>) -> usize {
        debug_assert!(!self.active.is_empty());
        let candidates: Vec<usize> = self
            .active
            .iter()
            .copied()
            .filter(|&lane| Some(lane) != current || self.active.len() == 1)
            .collect();
        match self.rng.choose(&candidates) {
            Some(&lane) => lane,
            None => self.active[0],
        }
    }

    /// Remove a lane that has finished its operations.
    pub fn retire(&mut self, lane: usize) {
        debug_assert!(self.active.contains(&lane), "Lane {} is not active", lane);
        self.active.retain(|&active| active != lane);
        if self.current_lane == Some(lane) {
            self.current_lane = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_lane_continues() {
        let mut scheduler = Scheduler::with_defaults(DeterministicRng::new(1), 1);
        assert_eq!(scheduler.decide(), ScheduleDecision::SwitchTo(0));
        for _ in 0..50 {
            assert_eq!(scheduler.decide(), ScheduleDecision::Continue(0));
        }
        assert_eq!(scheduler.switches_count(), 1);
    }

    #[test]
    fn test_switches_between_lanes() {
        let mut scheduler = Scheduler::new(DeterministicRng::new(9), 4, 0.5);
        let mut seen = [false; 4];
        for _ in 0..200 {
            if let Some(lane) = scheduler.decide().lane() {
                seen[lane] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
        assert!(scheduler.switches_count() > 1);
    }

    #[test]
    fn test_switch_never_picks_current() {
        let mut scheduler = Scheduler::new(DeterministicRng::new(2), 3, 1.0);
        let mut previous = scheduler.decide().lane();
        for _ in 0..100 {
            let decision = scheduler.decide();
            assert!(matches!(decision, ScheduleDecision::SwitchTo(_)));
            assert_ne!(decision.lane(), previous);
            previous = decision.lane();
        }
    }

    #[test]
    fn test_retire_until_idle() {
        let mut scheduler = Scheduler::with_defaults(DeterministicRng::new(5), 3);
        while let Some(lane) = scheduler.decide().lane() {
            scheduler.retire(lane);
        }
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.decide(), ScheduleDecision::Idle);
        assert_eq!(scheduler.current_lane(), None);
    }

    #[test]
    fn test_deterministic_interleaving() {
        let run = |seed| {
            let mut scheduler = Scheduler::with_defaults(DeterministicRng::new(seed), 5);
            (0..100).map(|_| scheduler.decide()).collect::<Vec<_>>()
        };
        assert_eq!(run(31), run(31));
    }
}
