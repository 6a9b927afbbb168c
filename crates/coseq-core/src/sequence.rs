//! The synchronous sequence: a routine driven one step at a time.

use std::cell::RefCell;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::task::Context;

use futures::task::noop_waker_ref;
use tracing::warn;

use crate::lifecycle::{Entry, Lifecycle, CLOSE_ATTEMPTS_MAX};
use crate::step::{SequenceId, SequenceState, Step, StepResult};
use crate::suspension::{Activation, Co, Outcome, Resumption, Suspension};

/// A lazily evaluated sequence backed by a suspendable routine.
///
/// Type parameters: `Y` yielded values, `R` the return value, `E` the
/// routine's error type, `I` values passed in with [`Sequence::send`].
///
/// Every operation takes `&self` so a routine that captured a handle to its
/// own sequence gets an `InvalidState` error instead of a borrow panic.
///
/// # Example
///
/// ```
/// use coseq_core::{Sequence, Step};
///
/// let seq: Sequence<'_, u32, &str> = Sequence::new(|co| async move {
///     co.yield_(1).await?;
///     co.yield_(2).await?;
///     Ok("end")
/// });
///
/// assert_eq!(seq.next().unwrap(), Step::Yield(1));
/// assert_eq!(seq.next().unwrap(), Step::Yield(2));
/// assert_eq!(seq.next().unwrap(), Step::Done(Some("end")));
/// assert_eq!(seq.next().unwrap(), Step::Done(None));
/// ```
pub struct Sequence<'a, Y, R = (), E = Infallible, I = ()> {
    lifecycle: Lifecycle,
    suspension: RefCell<Suspension<'a, Y, R, E, I>>,
}

impl<'a, Y, R, E, I> Sequence<'a, Y, R, E, I> {
    /// Wrap `routine`. Nothing runs until the first [`next`](Self::next).
    pub fn new<F, Fut>(routine: F) -> Self
    where
        F: FnOnce(Co<Y, R, E, I>) -> Fut + 'a,
        Fut: Future<Output = Outcome<R, E>> + 'a,
    {
        let lifecycle = Lifecycle::new();
        let suspension = Suspension::new(lifecycle.id(), routine);
        Self {
            lifecycle,
            suspension: RefCell::new(suspension),
        }
    }

    #[must_use]
    pub fn id(&self) -> SequenceId {
        self.lifecycle.id()
    }

    #[must_use]
    pub fn state(&self) -> SequenceState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Resume without input.
    pub fn next(&self) -> StepResult<Y, R, E> {
        self.drive(Resumption::Next(None))
    }

    /// Resume, handing `input` to the pending yield point.
    ///
    /// The very first resume has no yield point to receive it, so the input
    /// is discarded.
    pub fn send(&self, input: I) -> StepResult<Y, R, E> {
        self.drive(Resumption::Next(Some(input)))
    }

    /// Ask the sequence to finish with `value`, running pending cleanup.
    ///
    /// Returns `Yield` if cleanup yields; the sequence then stays suspended.
    pub fn return_(&self, value: Option<R>) -> StepResult<Y, R, E> {
        self.drive(Resumption::Return(value))
    }

    /// Raise `error` at the pending yield point.
    pub fn throw(&self, error: E) -> StepResult<Y, R, E> {
        self.drive(Resumption::Throw(error))
    }

    fn drive(&self, resumption: Resumption<I, R, E>) -> StepResult<Y, R, E> {
        let resumption = match self.lifecycle.admit(&self.suspension, resumption) {
            Entry::Enter(resumption) => resumption,
            Entry::Settled(result) => return result,
        };

        self.lifecycle.transition(SequenceState::Running);
        let activation = {
            let mut suspension = self.suspension.borrow_mut();
            suspension.load(resumption);
            let mut cx = Context::from_waker(noop_waker_ref());
            let activation = suspension.poll_activation(&mut cx);
            if matches!(activation, Activation::Awaiting) {
                suspension.discard();
            }
            activation
        };
        self.lifecycle.settle(activation)
    }
}

impl<Y, R, E, I> Drop for Sequence<'_, Y, R, E, I> {
    fn drop(&mut self) {
        if self.state() != SequenceState::Suspended {
            return;
        }
        for _ in 0..CLOSE_ATTEMPTS_MAX {
            match self.return_(None) {
                Ok(Step::Done(_)) => return,
                Ok(Step::Yield(_)) => continue,
                Err(_) => {
                    warn!(sequence = %self.id(), "cleanup raised while dropping a suspended sequence");
                    return;
                }
            }
        }
        warn!(sequence = %self.id(), attempts = CLOSE_ATTEMPTS_MAX, "cleanup kept yielding; dropped without finishing");
    }
}

impl<Y, R, E, I> fmt::Debug for Sequence<'_, Y, R, E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
