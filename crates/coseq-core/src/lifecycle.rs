//! State bookkeeping shared by the sync and async sequences.

use std::cell::{Cell, RefCell};

use tracing::{debug, trace};

use crate::error::SequenceError;
use crate::step::{SequenceId, SequenceState, Step, StepResult};
use crate::suspension::{Activation, Resumption, Suspension, Unwind};

/// How many `return_` rounds a dropped sequence spends closing itself.
///
/// Cleanup that keeps yielding past this is abandoned with a warning.
pub(crate) const CLOSE_ATTEMPTS_MAX: u32 = 16;

pub(crate) struct Lifecycle {
    id: SequenceId,
    state: Cell<SequenceState>,
}

/// Result of checking a drive operation against the current state.
pub(crate) enum Entry<Y, R, E, I> {
    /// The routine must be entered with this resumption.
    Enter(Resumption<I, R, E>),
    /// Settled without running user code.
    Settled(StepResult<Y, R, E>),
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            id: SequenceId::next(),
            state: Cell::new(SequenceState::Created),
        }
    }

    pub(crate) fn id(&self) -> SequenceId {
        self.id
    }

    pub(crate) fn state(&self) -> SequenceState {
        self.state.get()
    }

    pub(crate) fn transition(&self, to: SequenceState) {
        let from = self.state.replace(to);
        debug_assert!(from.can_transition_to(to), "Illegal transition {} -> {} on {}", from, to, self.id);
        trace!(sequence = %self.id, %from, %to, "transition");
    }

    pub(crate) fn invalid<E>(&self, reason: &'static str) -> SequenceError<E> {
        SequenceError::invalid_state(self.id, self.state(), reason)
    }

    /// Decide whether `resumption` enters the routine.
    ///
    /// Terminal sequences absorb everything; a `Created` sequence answers
    /// `return_` and `throw` without ever entering the routine.
    pub(crate) fn admit<Y, R, E, I>(
        &self,
        suspension: &RefCell<Suspension<'_, Y, R, E, I>>,
        resumption: Resumption<I, R, E>,
    ) -> Entry<Y, R, E, I> {
        match self.state() {
            SequenceState::Running => Entry::Settled(Err(self.invalid("re-entrant resume while an activation is running"))),
            SequenceState::Completed | SequenceState::Errored => Entry::Settled(match resumption {
                Resumption::Next(_) => Ok(Step::Done(None)),
                Resumption::Return(value) => Ok(Step::Done(value)),
                Resumption::Throw(error) => Err(SequenceError::Raised(error)),
            }),
            SequenceState::Created => match resumption {
                Resumption::Next(_) => Entry::Enter(Resumption::Next(None)),
                Resumption::Return(value) => {
                    debug!(sequence = %self.id, "return before start");
                    suspension.borrow_mut().discard();
                    self.transition(SequenceState::Completed);
                    Entry::Settled(Ok(Step::Done(value)))
                }
                Resumption::Throw(error) => {
                    debug!(sequence = %self.id, "throw before start");
                    suspension.borrow_mut().discard();
                    self.transition(SequenceState::Errored);
                    Entry::Settled(Err(SequenceError::Raised(error)))
                }
            },
            SequenceState::Suspended => {
                match &resumption {
                    Resumption::Return(_) => debug!(sequence = %self.id, "injecting return"),
                    Resumption::Throw(_) => debug!(sequence = %self.id, "injecting throw"),
                    Resumption::Next(_) => {}
                }
                Entry::Enter(resumption)
            }
        }
    }

    /// Record the end of an activation that yielded or finished.
    pub(crate) fn settle<Y, R, E>(&self, activation: Activation<Y, R, E>) -> StepResult<Y, R, E> {
        debug_assert_eq!(self.state(), SequenceState::Running, "Settling {} outside an activation", self.id);
        match activation {
            Activation::Yielded(value) => {
                self.transition(SequenceState::Suspended);
                Ok(Step::Yield(value))
            }
            Activation::Finished(Ok(value)) => {
                self.transition(SequenceState::Completed);
                Ok(Step::Done(Some(value)))
            }
            Activation::Finished(Err(Unwind::Return(value))) => {
                self.transition(SequenceState::Completed);
                Ok(Step::Done(value))
            }
            Activation::Finished(Err(Unwind::Raise(error))) => {
                self.transition(SequenceState::Errored);
                Err(error)
            }
            Activation::Awaiting => {
                self.transition(SequenceState::Errored);
                Err(self.invalid("routine awaited a future that is not a yield point"))
            }
        }
    }
}
