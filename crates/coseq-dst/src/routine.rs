//! Randomly generated routines.
//!
//! A [`Script`] is plain data describing what a routine does: yields,
//! raises, cleanup scopes, error-swallowing blocks and delegation to inner
//! sequences or iterables. [`Script::build`] turns it into a live
//! [`Sequence`] whose side effects are counted by [`EffectCounters`], and
//! [`Script::oracle`] computes what a consumer that only calls `next` must
//! observe.

use std::cell::Cell;
use std::fmt;

use coseq_core::invariants::EffectCounts;
use coseq_core::{from_iter, Co, Sequence, SequenceError, Step, StepResult, Unwind};
use futures::future::LocalBoxFuture;
use thiserror::Error;

use crate::fault::FaultInjector;
use crate::random::DeterministicRng;

/// Errors raised inside simulated routines or injected by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("routine raised #{0}")]
    Routine(u32),
    #[error("cleanup raised #{0}")]
    Cleanup(u32),
    #[error("consumer threw #{0}")]
    Injected(u32),
}

pub type SimCo = Co<u32, u32, SimError, u32>;
pub type SimSequence<'p> = Sequence<'p, u32, u32, SimError, u32>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Yield(u32),
    Raise(SimError),
    /// Run `body`, then `cleanup` however the body ends.
    Scope { body: Vec<Action>, cleanup: Vec<Action> },
    /// Run the actions and swallow any error they raise.
    Catch(Vec<Action>),
    /// Delegate to an inner sequence running these actions.
    Delegate(Vec<Action>),
    /// Delegate to a plain iterable.
    DelegateIter(Vec<u32>),
}

/// A routine's actions and the value it returns when they all complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub actions: Vec<Action>,
    pub returns: u32,
}

/// Relative odds of yield, scope, catch, delegate and iterable delegation.
const ACTION_WEIGHTS: [u32; 5] = [3, 1, 1, 1, 1];

struct Generator<'g> {
    rng: &'g mut DeterministicRng,
    fault: &'g mut FaultInjector,
    length_max: u32,
    value_next: u32,
}

impl Generator<'_> {
    fn value(&mut self) -> u32 {
        self.value_next += 1;
        self.value_next
    }

    fn actions(&mut self, depth: u32) -> Vec<Action> {
        let length = self.rng.gen_range(1..=self.length_max);
        let mut actions = Vec::with_capacity(length as usize);
        for _ in 0..length {
            if self.fault.routine_raises() {
                actions.push(Action::Raise(SimError::Routine(self.fault.gen_tag())));
                continue;
            }
            let kind = if depth == 0 { 0 } else { self.rng.pick_weighted(&ACTION_WEIGHTS) };
            let action = match kind {
                0 => Action::Yield(self.value()),
                1 => Action::Scope {
                    body: self.actions(depth - 1),
                    cleanup: self.cleanup(),
                },
                2 => Action::Catch(self.actions(depth - 1)),
                3 => Action::Delegate(self.actions(depth - 1)),
                _ => {
                    let count = self.rng.gen_range(0..=3u32);
                    Action::DelegateIter((0..count).map(|_| self.value()).collect())
                }
            };
            actions.push(action);
        }
        actions
    }

    fn cleanup(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        for _ in 0..self.rng.gen_range(0..=2u32) {
            if self.fault.cleanup_raises() {
                actions.push(Action::Raise(SimError::Cleanup(self.fault.gen_tag())));
            } else if self.fault.cleanup_yields() {
                actions.push(Action::Yield(self.value()));
            }
        }
        actions
    }
}

impl Script {
    /// A random script at most `depth_max` scopes deep, with at most
    /// `length_max` actions per block. Routine faults come from `fault`.
    pub fn generate(rng: &mut DeterministicRng, fault: &mut FaultInjector, depth_max: u32, length_max: u32) -> Self {
        debug_assert!(length_max > 0, "Blocks must allow at least one action");

        let depth = rng.gen_range(0..=depth_max);
        let returns = rng.gen_range(1_000..2_000u32);
        let mut generator = Generator {
            rng,
            fault,
            length_max,
            value_next: 0,
        };
        Self {
            actions: generator.actions(depth),
            returns,
        }
    }

    /// Start the routine as a sequence reporting into `effects`.
    pub fn build<'p>(&'p self, effects: &'p EffectCounters) -> SimSequence<'p> {
        let returns = self.returns;
        Sequence::new(move |co| async move {
            perform(&co, &self.actions, effects).await?;
            Ok(returns)
        })
    }

    /// What a consumer calling only `next` observes.
    #[must_use]
    pub fn oracle(&self) -> Oracle {
        let mut yields = Vec::new();
        let ending = match interpret(&self.actions, &mut yields) {
            Ok(()) => Ending::Returned(Some(self.returns)),
            Err(failure) => failure,
        };
        Oracle { yields, ending }
    }

    #[must_use]
    pub fn actions_count(&self) -> usize {
        fn count(actions: &[Action]) -> usize {
            actions
                .iter()
                .map(|action| match action {
                    Action::Scope { body, cleanup } => 1 + count(body) + count(cleanup),
                    Action::Catch(inner) | Action::Delegate(inner) => 1 + count(inner),
                    Action::Yield(_) | Action::Raise(_) | Action::DelegateIter(_) => 1,
                })
                .sum()
        }
        count(&self.actions)
    }
}

fn perform<'p>(co: &'p SimCo, actions: &'p [Action], effects: &'p EffectCounters) -> LocalBoxFuture<'p, Result<(), Unwind<u32, SimError>>> {
    Box::pin(async move {
        for action in actions {
            match action {
                Action::Yield(value) => {
                    effects.side_effect();
                    co.yield_(*value).await?;
                }
                Action::Raise(error) => {
                    effects.side_effect();
                    return Err(Unwind::from(*error));
                }
                Action::Scope { body, cleanup } => {
                    effects.register_cleanup();
                    co.finally(perform(co, body, effects), || async move {
                        effects.run_cleanup();
                        perform(co, cleanup, effects).await
                    })
                    .await?;
                }
                Action::Catch(inner) => match perform(co, inner, effects).await {
                    Ok(()) | Err(Unwind::Raise(_)) => {}
                    Err(unwind) => return Err(unwind),
                },
                Action::Delegate(inner) => {
                    let nested: SimSequence<'_> = Sequence::new(move |inner_co| async move {
                        perform(&inner_co, inner, effects).await?;
                        Ok(0)
                    });
                    co.delegate(nested).await?;
                }
                Action::DelegateIter(values) => {
                    co.delegate(from_iter(values.iter().copied())).await?;
                }
            }
        }
        Ok(())
    })
}

/// How a sequence settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    Returned(Option<u32>),
    Raised(SimError),
    /// A cleanup action raised; carries the innermost error.
    CleanupRaised(SimError),
    InvalidState,
}

impl Ending {
    /// The ending a settling step reports; `None` for a yield.
    #[must_use]
    pub fn of(result: &StepResult<u32, u32, SimError>) -> Option<Self> {
        match result {
            Ok(Step::Yield(_)) => None,
            Ok(Step::Done(value)) => Some(Self::Returned(*value)),
            Err(error) => Some(Self::of_error(error)),
        }
    }

    fn of_error(error: &SequenceError<SimError>) -> Self {
        match (error, error.raised()) {
            (SequenceError::Cleanup { .. }, Some(raised)) => Self::CleanupRaised(*raised),
            (SequenceError::Raised(raised), _) => Self::Raised(*raised),
            _ => Self::InvalidState,
        }
    }
}

impl fmt::Display for Ending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Returned(Some(value)) => write!(f, "returned {}", value),
            Self::Returned(None) => f.write_str("returned nothing"),
            Self::Raised(error) => write!(f, "raised ({})", error),
            Self::CleanupRaised(error) => write!(f, "cleanup error ({})", error),
            Self::InvalidState => f.write_str("invalid state"),
        }
    }
}

/// Expected observations for a `next`-only consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Oracle {
    pub yields: Vec<u32>,
    pub ending: Ending,
}

fn interpret(actions: &[Action], yields: &mut Vec<u32>) -> Result<(), Ending> {
    for action in actions {
        match action {
            Action::Yield(value) => yields.push(*value),
            Action::Raise(error) => return Err(Ending::Raised(*error)),
            Action::Scope { body, cleanup } => {
                let body_result = interpret(body, yields);
                match interpret(cleanup, yields) {
                    Ok(()) => body_result?,
                    Err(Ending::Raised(error) | Ending::CleanupRaised(error)) => {
                        return Err(Ending::CleanupRaised(error));
                    }
                    Err(other) => return Err(other),
                }
            }
            Action::Catch(inner) => {
                let _ = interpret(inner, yields);
            }
            Action::Delegate(inner) => interpret(inner, yields)?,
            Action::DelegateIter(values) => yields.extend(values),
        }
    }
    Ok(())
}

/// Counters a routine bumps as it runs.
#[derive(Debug, Default)]
pub struct EffectCounters {
    side_effect_count: Cell<u64>,
    cleanup_registered_count: Cell<u64>,
    cleanup_count: Cell<u64>,
}

impl EffectCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn side_effect(&self) {
        self.side_effect_count.set(self.side_effect_count.get() + 1);
    }

    fn register_cleanup(&self) {
        self.cleanup_registered_count.set(self.cleanup_registered_count.get() + 1);
    }

    fn run_cleanup(&self) {
        self.cleanup_count.set(self.cleanup_count.get() + 1);
        debug_assert!(
            self.cleanup_count.get() <= self.cleanup_registered_count.get(),
            "Cleanup ran more often than it was registered"
        );
    }

    #[must_use]
    pub fn snapshot(&self) -> EffectCounts {
        EffectCounts {
            side_effect_count: self.side_effect_count.get(),
            cleanup_registered_count: self.cleanup_registered_count.get(),
            cleanup_count: self.cleanup_count.get(),
        }
    }

    /// Every entered scope has run its cleanup.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.cleanup_count.get() == self.cleanup_registered_count.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultConfig;

    fn drain(sequence: &SimSequence<'_>) -> (Vec<u32>, Ending) {
        let mut yields = Vec::new();
        loop {
            let result = sequence.next();
            match Ending::of(&result) {
                None => yields.push(*result.unwrap().yielded().unwrap()),
                Some(ending) => return (yields, ending),
            }
        }
    }

    #[test]
    fn test_plain_script() {
        let script = Script {
            actions: vec![Action::Yield(1), Action::DelegateIter(vec![2, 3]), Action::Yield(4)],
            returns: 1_001,
        };
        let effects = EffectCounters::new();
        let (yields, ending) = drain(&script.build(&effects));
        assert_eq!(yields, vec![1, 2, 3, 4]);
        assert_eq!(ending, Ending::Returned(Some(1_001)));
        assert_eq!(script.oracle(), Oracle { yields, ending });
        assert_eq!(effects.snapshot().side_effect_count, 2);
    }

    #[test]
    fn test_cleanup_raise_supersedes() {
        let script = Script {
            actions: vec![Action::Scope {
                body: vec![Action::Yield(1), Action::Raise(SimError::Routine(7))],
                cleanup: vec![Action::Yield(2), Action::Raise(SimError::Cleanup(8))],
            }],
            returns: 1_500,
        };
        let effects = EffectCounters::new();
        let (yields, ending) = drain(&script.build(&effects));
        assert_eq!(yields, vec![1, 2]);
        assert_eq!(ending, Ending::CleanupRaised(SimError::Cleanup(8)));
        assert_eq!(script.oracle().ending, ending);
        assert!(effects.is_balanced());
    }

    #[test]
    fn test_catch_swallows_delegated_error() {
        let script = Script {
            actions: vec![
                Action::Catch(vec![Action::Delegate(vec![Action::Yield(1), Action::Raise(SimError::Routine(3))])]),
                Action::Yield(2),
            ],
            returns: 1_200,
        };
        let effects = EffectCounters::new();
        let (yields, ending) = drain(&script.build(&effects));
        assert_eq!(yields, vec![1, 2]);
        assert_eq!(ending, Ending::Returned(Some(1_200)));
        assert_eq!(script.oracle().yields, yields);
    }

    #[test]
    fn test_injected_throw_is_caught() {
        let script = Script {
            actions: vec![Action::Catch(vec![Action::Yield(1), Action::Yield(2)]), Action::Yield(3)],
            returns: 1_300,
        };
        let effects = EffectCounters::new();
        let sequence = script.build(&effects);
        assert_eq!(sequence.next().unwrap(), Step::Yield(1));
        assert_eq!(sequence.throw(SimError::Injected(5)).unwrap(), Step::Yield(3));
        assert_eq!(sequence.next().unwrap(), Step::Done(Some(1_300)));
    }

    #[test]
    fn test_early_return_runs_nested_cleanup() {
        let script = Script {
            actions: vec![Action::Scope {
                body: vec![Action::Delegate(vec![Action::Scope {
                    body: vec![Action::Yield(1), Action::Yield(2)],
                    cleanup: Vec::new(),
                }])],
                cleanup: Vec::new(),
            }],
            returns: 1_400,
        };
        let effects = EffectCounters::new();
        let sequence = script.build(&effects);
        sequence.next().unwrap();
        assert_eq!(effects.snapshot().cleanup_registered_count, 2);
        assert_eq!(sequence.return_(Some(9)).unwrap(), Step::Done(Some(9)));
        assert_eq!(effects.snapshot().cleanup_count, 2);
    }

    #[test]
    fn test_generated_scripts_match_oracle() {
        let mut rng = DeterministicRng::new(2024);
        let mut fault = FaultInjector::new(DeterministicRng::new(2025), FaultConfig::aggressive());
        for _ in 0..200 {
            let script = Script::generate(&mut rng, &mut fault, 3, 4);
            let effects = EffectCounters::new();
            let (yields, ending) = drain(&script.build(&effects));
            assert_eq!(script.oracle(), Oracle { yields, ending }, "{:?}", script);
            assert!(effects.is_balanced());
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        let generate = || {
            let mut rng = DeterministicRng::new(17);
            let mut fault = FaultInjector::new(DeterministicRng::new(18), FaultConfig::default());
            Script::generate(&mut rng, &mut fault, 3, 3)
        };
        let script = generate();
        assert_eq!(script, generate());
        assert!(script.actions_count() > 0);
    }
}
