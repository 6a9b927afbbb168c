//! Error taxonomy for driving sequences.
//!
//! `Display` and `Error` are written by hand: the `Cleanup` variant nests
//! `SequenceError<E>` inside itself, and the only bound the impls need is on `E`.

use std::fmt;

use crate::step::{SequenceId, SequenceState};

/// Errors surfaced by `next`, `send`, `return_` and `throw`.
///
/// `E` is the routine's own error type. The engine never swallows an `E`:
/// it either reaches the caller as `Raised`, or it is chained under a
/// `Cleanup` error that superseded it.
#[derive(Debug)]
pub enum SequenceError<E> {
    /// A drive operation was attempted while an activation was in progress,
    /// or a routine broke the single-activation contract.
    InvalidState {
        id: SequenceId,
        state: SequenceState,
        reason: &'static str,
    },

    /// The routine raised, or let an injected error escape.
    Raised(E),

    /// A cleanup action raised while the sequence was terminating.
    ///
    /// The cleanup error wins; whatever it superseded stays reachable
    /// through [`SequenceError::superseded`].
    Cleanup {
        error: Box<SequenceError<E>>,
        superseded: Option<Box<SequenceError<E>>>,
    },
}

impl<E> SequenceError<E> {
    pub(crate) fn invalid_state(id: SequenceId, state: SequenceState, reason: &'static str) -> Self {
        debug_assert!(!reason.is_empty(), "Invalid state reason must not be empty");
        Self::InvalidState { id, state, reason }
    }

    /// Wrap an error raised by cleanup, chaining what it superseded.
    #[must_use]
    pub fn cleanup(error: SequenceError<E>, superseded: Option<SequenceError<E>>) -> Self {
        Self::Cleanup {
            error: Box::new(error),
            superseded: superseded.map(Box::new),
        }
    }

    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// The innermost routine error, looking through cleanup wrappers.
    #[must_use]
    pub fn raised(&self) -> Option<&E> {
        match self {
            Self::Raised(error) => Some(error),
            Self::Cleanup { error, .. } => error.raised(),
            Self::InvalidState { .. } => None,
        }
    }

    /// The error a cleanup failure replaced, if any.
    #[must_use]
    pub fn superseded(&self) -> Option<&SequenceError<E>> {
        match self {
            Self::Cleanup { superseded, .. } => superseded.as_deref(),
            _ => None,
        }
    }

    /// Consume the error, keeping the routine error only when it was raised directly.
    pub fn into_raised(self) -> Result<E, Self> {
        match self {
            Self::Raised(error) => Ok(error),
            other => Err(other),
        }
    }
}

impl<E: fmt::Display> fmt::Display for SequenceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState { id, state, reason } => write!(f, "{}: {} (state: {})", id, reason, state),
            Self::Raised(error) => write!(f, "routine raised: {}", error),
            Self::Cleanup { error, superseded } => {
                write!(f, "cleanup raised: {}", error)?;
                if let Some(superseded) = superseded {
                    write!(f, " (superseding: {})", superseded)?;
                }
                Ok(())
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for SequenceError<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raised_looks_through_cleanup() {
        let err: SequenceError<&str> =
            SequenceError::cleanup(SequenceError::Raised("close failed"), Some(SequenceError::Raised("boom")));

        assert_eq!(err.raised(), Some(&"close failed"));
        assert_eq!(err.superseded().and_then(SequenceError::raised), Some(&"boom"));
    }

    #[test]
    fn test_display() {
        let id = SequenceId::next();
        let err: SequenceError<&str> = SequenceError::invalid_state(id, SequenceState::Running, "re-entrant resume");
        let text = err.to_string();
        assert!(text.contains("re-entrant resume"));
        assert!(text.contains("running"));
        assert!(err.is_invalid_state());

        let raised: SequenceError<&str> = SequenceError::Raised("boom");
        assert_eq!(raised.to_string(), "routine raised: boom");
    }

    #[test]
    fn test_into_raised() {
        let raised: SequenceError<u8> = SequenceError::Raised(3);
        assert_eq!(raised.into_raised().ok(), Some(3));

        let wrapped: SequenceError<u8> = SequenceError::cleanup(SequenceError::Raised(1), None);
        assert!(wrapped.into_raised().is_err());
    }
}
