//! Resource-safe termination: cleanup that runs exactly once.
//!
//! `finally(body, cleanup)` awaits `body`, then runs `cleanup` on every exit:
//! normal completion, an injected `return_`, or a raised error. Nesting gives
//! innermost-first order for free, since an inner scope finishes before the
//! outer one sees the unwind.
//!
//! Cleanup closures capture what they need by reference; writing them as
//! `|| async move { .. }` over a `&Co` keeps the borrow outside the closure.
//!
//! Cleanup may yield. The consumer then sees a value instead of `done` and
//! has to call `return_` again; that second return surfaces inside cleanup
//! as `Unwind::Return` and completes the sequence with the second value.

use std::future::Future;

use tracing::debug;

use crate::error::SequenceError;
use crate::suspension::{Co, Unwind};

/// Run `body`, then `cleanup` once on whichever path `body` exits by.
///
/// An error raised by cleanup supersedes the pending outcome and is
/// reported as [`SequenceError::Cleanup`] with the superseded error chained.
/// A return unwinding out of cleanup replaces the pending outcome.
pub async fn finally<T, R, E, B, C, CF>(body: B, cleanup: C) -> Result<T, Unwind<R, E>>
where
    B: Future<Output = Result<T, Unwind<R, E>>>,
    C: FnOnce() -> CF,
    CF: Future<Output = Result<(), Unwind<R, E>>>,
{
    let outcome = body.await;
    match cleanup().await {
        Ok(()) => outcome,
        Err(Unwind::Raise(error)) => {
            let superseded = match outcome {
                Err(Unwind::Raise(pending)) => Some(pending),
                Ok(_) | Err(Unwind::Return(_)) => None,
            };
            Err(Unwind::Raise(SequenceError::cleanup(error, superseded)))
        }
        Err(Unwind::Return(value)) => {
            if matches!(outcome, Err(Unwind::Raise(_))) {
                debug!("return from cleanup replaced a pending error");
            }
            Err(Unwind::Return(value))
        }
    }
}

impl<Y, R, E, I> Co<Y, R, E, I> {
    /// [`finally`] with the unwind types fixed to this routine's.
    pub async fn finally<T, B, C, CF>(&self, body: B, cleanup: C) -> Result<T, Unwind<R, E>>
    where
        B: Future<Output = Result<T, Unwind<R, E>>>,
        C: FnOnce() -> CF,
        CF: Future<Output = Result<(), Unwind<R, E>>>,
    {
        finally(body, cleanup).await
    }
}
