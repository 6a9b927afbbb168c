//! Stateright model of the sequence lifecycle.
//!
//! The modelled routine is fixed:
//!
//! ```text
//! outer: finally {
//!     yield 10
//!     delegate inner: finally { yield 1; yield 2; return 0 } cleanup { [yield 91] }
//!     yield 20
//!     return 7
//! } cleanup { [yield 92] }
//! ```
//!
//! Cleanup yields are switched on with [`LifecycleModel::with_cleanup_yields`].
//! A consumer resume is split into `Resume` (the activation starts) and
//! `Settle` (the routine reaches its next pause point), so the checker can
//! also try a re-entrant resume while an activation is running.
//!
//! | Property | Kind | Description |
//! |----------|------|-------------|
//! | CleanupAtMostOnce | always | No scope's cleanup runs twice |
//! | InnerBeforeOuter | always | The delegated scope is cleaned up before the enclosing one |
//! | TerminalCleanupComplete | always | Once terminal, every entered scope has been cleaned up |
//! | TerminalAbsorbing | always | No routine effects after the sequence settled |
//! | SingleActivation | always | At most one activation runs at a time |
//! | ErroredReachable | sometimes | Some path ends in `Errored` |
//! | CleanupPauseReachable | sometimes | Some path parks inside cleanup (cleanup-yield models only) |

use coseq_core::SequenceState;
use stateright::{Model, Property};

/// Value the consumer passes to `return_`.
pub const RETURN_VALUE: u8 = 5;

/// Value the outer routine returns on completion.
pub const ROUTINE_RETURN: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Inner,
    Outer,
}

/// Consumer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelOp {
    Next,
    Return,
    Throw,
}

impl ModelOp {
    pub const ALL: [ModelOp; 3] = [ModelOp::Next, ModelOp::Return, ModelOp::Throw];
}

/// Why the routine is leaving a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unwinding {
    Normal,
    Return,
    /// An error; `cleanup_error` when cleanup raised it.
    Raise { cleanup_error: bool },
}

/// Where a suspended routine is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pause {
    Outer1,
    Inner(u8),
    InnerCleanup(Unwinding),
    Outer2,
    OuterCleanup(Unwinding),
}

impl Pause {
    #[must_use]
    pub fn value(self) -> u8 {
        match self {
            Self::Outer1 => 10,
            Self::Inner(k) => k,
            Self::InnerCleanup(_) => 91,
            Self::Outer2 => 20,
            Self::OuterCleanup(_) => 92,
        }
    }
}

/// What the consumer sees from one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Observation {
    Yield(u8),
    Done(Option<u8>),
    Raised,
    CleanupError,
    InvalidState,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LifecycleState {
    pub state: SequenceState,
    pub pause: Option<Pause>,
    /// Operation of the running activation.
    pub pending: Option<ModelOp>,
    pub active_count: u8,
    /// A re-entrant resume was already tried in this activation.
    pub reentry_tried: bool,
    pub inner_registered: bool,
    pub outer_registered: bool,
    pub cleanup_log: Vec<Scope>,
    pub effects_count: u8,
    /// Effects count when the sequence settled.
    pub settled_effects: Option<u8>,
    pub observations: Vec<Observation>,
}

impl LifecycleState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SequenceState::Created,
            pause: None,
            pending: None,
            active_count: 0,
            reentry_tried: false,
            inner_registered: false,
            outer_registered: false,
            cleanup_log: Vec::new(),
            effects_count: 0,
            settled_effects: None,
            observations: Vec::new(),
        }
    }

    fn cleanup_runs(&self, scope: Scope) -> usize {
        self.cleanup_log.iter().filter(|&&logged| logged == scope).count()
    }

    pub fn cleanup_at_most_once(&self) -> bool {
        self.cleanup_runs(Scope::Inner) <= 1 && self.cleanup_runs(Scope::Outer) <= 1
    }

    pub fn inner_before_outer(&self) -> bool {
        let inner = self.cleanup_log.iter().position(|&s| s == Scope::Inner);
        match self.cleanup_log.iter().position(|&s| s == Scope::Outer) {
            Some(outer) if self.inner_registered => inner.is_some_and(|inner| inner < outer),
            _ => true,
        }
    }

    pub fn terminal_cleanup_complete(&self) -> bool {
        if !self.state.is_terminal() {
            return true;
        }
        (!self.inner_registered || self.cleanup_runs(Scope::Inner) == 1)
            && (!self.outer_registered || self.cleanup_runs(Scope::Outer) == 1)
    }

    pub fn terminal_absorbing(&self) -> bool {
        self.settled_effects.map_or(true, |settled| settled == self.effects_count)
    }

    pub fn single_activation(&self) -> bool {
        self.active_count <= 1 && (self.state == SequenceState::Running) == (self.active_count == 1)
    }

    pub fn invariants_hold(&self) -> bool {
        self.cleanup_at_most_once()
            && self.inner_before_outer()
            && self.terminal_cleanup_complete()
            && self.terminal_absorbing()
            && self.single_activation()
    }

    fn park(&mut self, pause: Pause) -> Observation {
        self.effects_count += 1;
        self.pause = Some(pause);
        self.state = SequenceState::Suspended;
        Observation::Yield(pause.value())
    }

    fn settle(&mut self, state: SequenceState, observation: Observation) -> Observation {
        debug_assert!(state.is_terminal());
        self.pause = None;
        self.state = state;
        self.settled_effects = Some(self.effects_count);
        observation
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LifecycleAction {
    /// Consumer starts an activation.
    Resume(ModelOp),
    /// Consumer resumes again from inside the running activation.
    Reenter(ModelOp),
    /// The activation reaches its next pause point.
    Settle,
}

pub struct LifecycleModel {
    pub cleanup_yields: bool,
    pub ops_max: usize,
}

impl LifecycleModel {
    #[must_use]
    pub fn new(ops_max: usize) -> Self {
        debug_assert!(ops_max > 0, "Must allow at least one operation");
        debug_assert!(ops_max <= 10, "Model checking with long paths is slow");
        Self {
            cleanup_yields: false,
            ops_max,
        }
    }

    #[must_use]
    pub fn with_cleanup_yields(mut self) -> Self {
        self.cleanup_yields = true;
        self
    }

    /// Resume and settle in one go; used to replay a path of operations.
    pub fn apply(&self, state: &mut LifecycleState, op: ModelOp) -> Observation {
        let observation = self.resume(state, op);
        state.observations.push(observation);
        observation
    }

    /// Observations and final state for a path of operations.
    #[must_use]
    pub fn trace(&self, ops: &[ModelOp]) -> LifecycleState {
        let mut state = LifecycleState::new();
        for &op in ops {
            self.apply(&mut state, op);
        }
        state
    }

    fn resume(&self, s: &mut LifecycleState, op: ModelOp) -> Observation {
        match s.state {
            SequenceState::Completed | SequenceState::Errored => match op {
                ModelOp::Next => Observation::Done(None),
                ModelOp::Return => Observation::Done(Some(RETURN_VALUE)),
                ModelOp::Throw => Observation::Raised,
            },
            SequenceState::Created => match op {
                ModelOp::Next => {
                    s.outer_registered = true;
                    s.park(Pause::Outer1)
                }
                ModelOp::Return => s.settle(SequenceState::Completed, Observation::Done(Some(RETURN_VALUE))),
                ModelOp::Throw => s.settle(SequenceState::Errored, Observation::Raised),
            },
            SequenceState::Running => Observation::InvalidState,
            SequenceState::Suspended => match s.pause {
                Some(pause) => self.resume_at(s, pause, op),
                None => Observation::InvalidState,
            },
        }
    }

    fn resume_at(&self, s: &mut LifecycleState, pause: Pause, op: ModelOp) -> Observation {
        let raise = Unwinding::Raise { cleanup_error: false };
        let cleanup_raise = Unwinding::Raise { cleanup_error: true };
        match (pause, op) {
            (Pause::Outer1, ModelOp::Next) => {
                s.inner_registered = true;
                s.park(Pause::Inner(1))
            }
            (Pause::Inner(1), ModelOp::Next) => s.park(Pause::Inner(2)),
            (Pause::Inner(_), ModelOp::Next) => self.inner_cleanup(s, Unwinding::Normal),
            (Pause::Inner(_), ModelOp::Return) => self.inner_cleanup(s, Unwinding::Return),
            (Pause::Inner(_), ModelOp::Throw) => self.inner_cleanup(s, raise),
            // A `next` lets the inner finish; a close in flight is dropped.
            (Pause::InnerCleanup(mode), ModelOp::Next) => match mode {
                Unwinding::Raise { .. } => self.outer_cleanup(s, mode),
                Unwinding::Normal | Unwinding::Return => s.park(Pause::Outer2),
            },
            (Pause::InnerCleanup(_), ModelOp::Return) => self.outer_cleanup(s, Unwinding::Return),
            (Pause::InnerCleanup(_), ModelOp::Throw) => self.outer_cleanup(s, cleanup_raise),
            (Pause::Outer1 | Pause::Outer2, ModelOp::Return) => self.outer_cleanup(s, Unwinding::Return),
            (Pause::Outer1 | Pause::Outer2, ModelOp::Throw) => self.outer_cleanup(s, raise),
            (Pause::Outer2, ModelOp::Next) => self.outer_cleanup(s, Unwinding::Normal),
            (Pause::OuterCleanup(mode), ModelOp::Next) => self.finish(s, mode),
            (Pause::OuterCleanup(_), ModelOp::Return) => self.finish(s, Unwinding::Return),
            (Pause::OuterCleanup(_), ModelOp::Throw) => self.finish(s, cleanup_raise),
        }
    }

    fn inner_cleanup(&self, s: &mut LifecycleState, mode: Unwinding) -> Observation {
        s.cleanup_log.push(Scope::Inner);
        if self.cleanup_yields {
            return s.park(Pause::InnerCleanup(mode));
        }
        match mode {
            Unwinding::Normal => s.park(Pause::Outer2),
            Unwinding::Return | Unwinding::Raise { .. } => self.outer_cleanup(s, mode),
        }
    }

    fn outer_cleanup(&self, s: &mut LifecycleState, mode: Unwinding) -> Observation {
        s.cleanup_log.push(Scope::Outer);
        if self.cleanup_yields {
            return s.park(Pause::OuterCleanup(mode));
        }
        self.finish(s, mode)
    }

    fn finish(&self, s: &mut LifecycleState, mode: Unwinding) -> Observation {
        match mode {
            Unwinding::Normal => s.settle(SequenceState::Completed, Observation::Done(Some(ROUTINE_RETURN))),
            Unwinding::Return => s.settle(SequenceState::Completed, Observation::Done(Some(RETURN_VALUE))),
            Unwinding::Raise { cleanup_error: false } => s.settle(SequenceState::Errored, Observation::Raised),
            Unwinding::Raise { cleanup_error: true } => s.settle(SequenceState::Errored, Observation::CleanupError),
        }
    }
}

impl Model for LifecycleModel {
    type State = LifecycleState;
    type Action = LifecycleAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![LifecycleState::new()]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        if state.state == SequenceState::Running {
            actions.push(LifecycleAction::Settle);
            if !state.reentry_tried {
                actions.extend(ModelOp::ALL.iter().map(|&op| LifecycleAction::Reenter(op)));
            }
            return;
        }
        if state.observations.len() < self.ops_max {
            actions.extend(ModelOp::ALL.iter().map(|&op| LifecycleAction::Resume(op)));
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        match action {
            LifecycleAction::Resume(op) => {
                if next.state.is_terminal() {
                    // Terminal operations never start an activation.
                    self.apply(&mut next, op);
                    return Some(next);
                }
                next.pending = Some(op);
                next.active_count += 1;
                next.reentry_tried = false;
                next.state = SequenceState::Running;
            }
            LifecycleAction::Reenter(_) => {
                next.reentry_tried = true;
            }
            LifecycleAction::Settle => {
                let op = next.pending.take()?;
                next.active_count -= 1;
                next.state = match next.pause {
                    Some(_) => SequenceState::Suspended,
                    None => SequenceState::Created,
                };
                self.apply(&mut next, op);
            }
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("CleanupAtMostOnce", |_: &Self, state: &LifecycleState| state.cleanup_at_most_once()),
            Property::always("InnerBeforeOuter", |_: &Self, state: &LifecycleState| state.inner_before_outer()),
            Property::always("TerminalCleanupComplete", |_: &Self, state: &LifecycleState| {
                state.terminal_cleanup_complete()
            }),
            Property::always("TerminalAbsorbing", |_: &Self, state: &LifecycleState| state.terminal_absorbing()),
            Property::always("SingleActivation", |_: &Self, state: &LifecycleState| state.single_activation()),
            Property::sometimes("ErroredReachable", |_: &Self, state: &LifecycleState| {
                state.state == SequenceState::Errored
            }),
            Property::sometimes("CleanupPauseReachable", |model: &Self, state: &LifecycleState| {
                !model.cleanup_yields
                    || matches!(state.pause, Some(Pause::InnerCleanup(_) | Pause::OuterCleanup(_)))
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateright::Checker;

    #[test]
    fn test_initial_state() {
        let state = LifecycleState::new();
        assert_eq!(state.state, SequenceState::Created);
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_run_to_completion() {
        let model = LifecycleModel::new(8);
        let state = model.trace(&[ModelOp::Next; 6]);
        assert_eq!(
            state.observations,
            vec![
                Observation::Yield(10),
                Observation::Yield(1),
                Observation::Yield(2),
                Observation::Yield(20),
                Observation::Done(Some(ROUTINE_RETURN)),
                Observation::Done(None),
            ]
        );
        assert_eq!(state.cleanup_log, vec![Scope::Inner, Scope::Outer]);
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_return_inside_delegation_with_cleanup_yields() {
        let model = LifecycleModel::new(8).with_cleanup_yields();
        let state = model.trace(&[ModelOp::Next, ModelOp::Next, ModelOp::Return, ModelOp::Return, ModelOp::Next]);
        assert_eq!(
            state.observations,
            vec![
                Observation::Yield(10),
                Observation::Yield(1),
                Observation::Yield(91),
                Observation::Yield(92),
                Observation::Done(Some(RETURN_VALUE)),
            ]
        );
        assert_eq!(state.state, SequenceState::Completed);
    }

    #[test]
    fn test_next_after_interrupted_close_resumes_outer() {
        let model = LifecycleModel::new(8).with_cleanup_yields();
        let state = model.trace(&[ModelOp::Next, ModelOp::Next, ModelOp::Return, ModelOp::Next]);
        assert_eq!(state.observations.last(), Some(&Observation::Yield(20)));
        assert_eq!(state.state, SequenceState::Suspended);
    }

    #[test]
    fn test_throw_on_created_runs_no_cleanup() {
        let model = LifecycleModel::new(4);
        let state = model.trace(&[ModelOp::Throw, ModelOp::Next]);
        assert_eq!(state.observations, vec![Observation::Raised, Observation::Done(None)]);
        assert!(state.cleanup_log.is_empty());
    }

    #[test]
    fn test_model_checking_small() {
        LifecycleModel::new(5)
            .checker()
            .threads(1)
            .spawn_bfs()
            .join()
            .assert_properties();
    }

    #[test]
    fn test_model_checking_cleanup_yields() {
        LifecycleModel::new(6)
            .with_cleanup_yields()
            .checker()
            .threads(1)
            .spawn_bfs()
            .join()
            .assert_properties();
    }

    #[test]
    #[ignore] // Slower test, run with --ignored
    fn test_model_checking_long_paths() {
        LifecycleModel::new(9)
            .with_cleanup_yields()
            .checker()
            .threads(num_cpus::get())
            .spawn_bfs()
            .join()
            .assert_properties();
    }
}
