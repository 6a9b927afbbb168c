//! Step results and sequence lifecycle states.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::SequenceError;

/// What every drive operation returns.
pub type StepResult<Y, R, E> = Result<Step<Y, R>, SequenceError<E>>;

/// Result of a single drive operation on a sequence.
///
/// `Yield` is the `{value, done: false}` shape; `Done` is `{value, done: true}`
/// where `None` stands for an absent (undefined) value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step<Y, R> {
    /// The routine paused at a yield point.
    Yield(Y),
    /// The sequence finished, with its return value if it produced one.
    Done(Option<R>),
}

impl<Y, R> Step<Y, R> {
    /// Whether this is a `done: true` step.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Step::Done(_))
    }

    /// The yielded value, if the routine paused.
    #[must_use]
    pub fn yielded(&self) -> Option<&Y> {
        match self {
            Step::Yield(value) => Some(value),
            Step::Done(_) => None,
        }
    }

    /// Consume the step, keeping only a yielded value.
    #[must_use]
    pub fn into_yielded(self) -> Option<Y> {
        match self {
            Step::Yield(value) => Some(value),
            Step::Done(_) => None,
        }
    }

    /// The return value of a finished step.
    #[must_use]
    pub fn returned(&self) -> Option<&R> {
        match self {
            Step::Done(value) => value.as_ref(),
            Step::Yield(_) => None,
        }
    }

    /// Transform the yielded value, leaving `Done` untouched.
    pub fn map_yield<U>(self, f: impl FnOnce(Y) -> U) -> Step<U, R> {
        match self {
            Step::Yield(value) => Step::Yield(f(value)),
            Step::Done(value) => Step::Done(value),
        }
    }
}

/// Lifecycle state of a sequence.
///
/// ```text
/// Created ──next──> Running ──yield──> Suspended ──next/throw/return──> Running
///    │                 │
///    │                 └──return/raise──> Completed | Errored
///    └──return──> Completed     └──throw──> Errored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SequenceState {
    /// Built but never driven; the routine has not been entered.
    Created,
    /// Parked at a yield point.
    Suspended,
    /// An activation is in progress.
    Running,
    /// Finished normally or through an injected return.
    Completed,
    /// Finished by an error that escaped the routine.
    Errored,
}

impl SequenceState {
    /// Terminal states absorb every later operation.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    /// Whether `next`/`throw`/`return` may enter the routine.
    #[must_use]
    pub const fn is_resumable(self) -> bool {
        matches!(self, Self::Created | Self::Suspended)
    }

    /// Whether a transition from `self` to `to` is part of the lifecycle.
    #[must_use]
    pub const fn can_transition_to(self, to: SequenceState) -> bool {
        match self {
            Self::Created => matches!(to, Self::Running | Self::Completed | Self::Errored),
            Self::Suspended => matches!(to, Self::Running),
            Self::Running => matches!(to, Self::Suspended | Self::Completed | Self::Errored),
            Self::Completed => matches!(to, Self::Completed),
            Self::Errored => matches!(to, Self::Errored),
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Suspended => "suspended",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Process-wide unique identity of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(u64);

static SEQUENCE_ID_NEXT: AtomicU64 = AtomicU64::new(1);

impl SequenceId {
    /// Allocate a fresh identity.
    #[must_use]
    pub fn next() -> Self {
        let raw = SEQUENCE_ID_NEXT.fetch_add(1, Ordering::Relaxed);
        debug_assert!(raw < u64::MAX, "Sequence id space exhausted");
        Self(raw)
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq#{}", self.0)
    }
}
