//! The suspension primitive.
//!
//! A routine is an `async` block that receives a [`Co`] handle. Each
//! `co.yield_(value).await` parks the block: the value is left in a shared
//! airlock slot and the future returns `Pending`. The driver picks the value
//! out of the slot, and on the next resume puts a [`Resumption`] in the slot
//! before polling again, which the parked yield point hands back to the
//! routine.
//!
//! ```text
//!   driver                 airlock                 routine
//!   load(Next(i)) ──────>  Resumed(Next(i))  ────> yield_ returns Ok(Some(i))
//!   take_yielded() <─────  Yielded(v)        <──── yield_(v) parks
//! ```

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::{FutureExt, LocalBoxFuture};

use crate::error::SequenceError;
use crate::step::SequenceId;

/// What a routine body evaluates to.
pub type Outcome<R, E> = Result<R, Unwind<R, E>>;

/// Why a routine is leaving a yield point other than by being resumed.
///
/// Routines propagate it with `?`; a routine that catches it and keeps
/// yielding overrides the injected return or handles the injected error.
pub enum Unwind<R, E> {
    /// The consumer called `return_`. Unwinding runs pending cleanup.
    Return(Option<R>),
    /// An error is travelling outwards.
    Raise(SequenceError<E>),
}

impl<R, E> Unwind<R, E> {
    #[must_use]
    pub fn raise(error: SequenceError<E>) -> Self {
        Self::Raise(error)
    }

    #[must_use]
    pub fn is_return(&self) -> bool {
        matches!(self, Self::Return(_))
    }

    /// The routine error being raised, looking through cleanup wrappers.
    #[must_use]
    pub fn raised(&self) -> Option<&E> {
        match self {
            Self::Raise(error) => error.raised(),
            Self::Return(_) => None,
        }
    }

    pub fn into_error(self) -> Option<SequenceError<E>> {
        match self {
            Self::Raise(error) => Some(error),
            Self::Return(_) => None,
        }
    }
}

impl<R, E> From<E> for Unwind<R, E> {
    fn from(error: E) -> Self {
        Self::Raise(SequenceError::Raised(error))
    }
}

impl<R: fmt::Debug, E: fmt::Debug> fmt::Debug for Unwind<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Return(value) => f.debug_tuple("Return").field(value).finish(),
            Self::Raise(error) => f.debug_tuple("Raise").field(error).finish(),
        }
    }
}

/// Signal handed to a parked routine.
pub(crate) enum Resumption<I, R, E> {
    Next(Option<I>),
    Throw(E),
    Return(Option<R>),
}

impl<I, R, E> Resumption<I, R, E> {
    fn into_result(self) -> Result<Option<I>, Unwind<R, E>> {
        match self {
            Self::Next(input) => Ok(input),
            Self::Throw(error) => Err(Unwind::Raise(SequenceError::Raised(error))),
            Self::Return(value) => Err(Unwind::Return(value)),
        }
    }
}

enum Slot<Y, R, E, I> {
    Empty,
    Resumed(Resumption<I, R, E>),
    Yielded(Y),
}

struct Airlock<Y, R, E, I> {
    id: SequenceId,
    slot: RefCell<Slot<Y, R, E, I>>,
}

impl<Y, R, E, I> Airlock<Y, R, E, I> {
    fn put_yielded(&self, value: Y) {
        let previous = self.slot.replace(Slot::Yielded(value));
        debug_assert!(
            !matches!(previous, Slot::Yielded(_)),
            "Yield point reached while a yielded value was still unclaimed"
        );
    }

    fn take_yielded(&self) -> Option<Y> {
        match self.slot.replace(Slot::Empty) {
            Slot::Yielded(value) => Some(value),
            other => {
                self.slot.replace(other);
                None
            }
        }
    }

    fn take_resumption(&self) -> Option<Resumption<I, R, E>> {
        match self.slot.replace(Slot::Empty) {
            Slot::Resumed(resumption) => Some(resumption),
            other => {
                self.slot.replace(other);
                None
            }
        }
    }

    fn load(&self, resumption: Resumption<I, R, E>) {
        self.slot.replace(Slot::Resumed(resumption));
    }

    fn clear(&self) {
        self.slot.replace(Slot::Empty);
    }
}

/// Yield capability handed to a routine.
///
/// Cloning is cheap; every clone talks to the same sequence.
pub struct Co<Y, R = (), E = std::convert::Infallible, I = ()> {
    airlock: Rc<Airlock<Y, R, E, I>>,
}

impl<Y, R, E, I> Clone for Co<Y, R, E, I> {
    fn clone(&self) -> Self {
        Self {
            airlock: Rc::clone(&self.airlock),
        }
    }
}

impl<Y, R, E, I> Co<Y, R, E, I> {
    /// Identity of the sequence this handle yields into.
    #[must_use]
    pub fn id(&self) -> SequenceId {
        self.airlock.id
    }

    /// Hand `value` to the consumer and park until resumed.
    ///
    /// Resolves to the consumer's input (`None` for a bare `next()`), or to
    /// an [`Unwind`] when the consumer injected `return_` or `throw`.
    pub async fn yield_(&self, value: Y) -> Result<Option<I>, Unwind<R, E>> {
        self.suspend(value).await.into_result()
    }

    pub(crate) fn suspend(&self, value: Y) -> Suspend<'_, Y, R, E, I> {
        Suspend {
            airlock: &self.airlock,
            value: Some(value),
        }
    }
}

/// A single yield point.
///
/// First poll parks the value and returns `Pending`; a later poll completes
/// once the driver has loaded a resumption.
pub(crate) struct Suspend<'c, Y, R, E, I> {
    airlock: &'c Airlock<Y, R, E, I>,
    value: Option<Y>,
}

// Never pinned structurally: the yielded value is moved out, not borrowed.
impl<Y, R, E, I> Unpin for Suspend<'_, Y, R, E, I> {}

impl<Y, R, E, I> Future for Suspend<'_, Y, R, E, I> {
    type Output = Resumption<I, R, E>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(value) = this.value.take() {
            this.airlock.put_yielded(value);
            return Poll::Pending;
        }
        match this.airlock.take_resumption() {
            Some(resumption) => Poll::Ready(resumption),
            None => Poll::Pending,
        }
    }
}

type Routine<'a, Y, R, E, I> = Box<dyn FnOnce(Co<Y, R, E, I>) -> LocalBoxFuture<'a, Outcome<R, E>> + 'a>;

enum Body<'a, Y, R, E, I> {
    Created(Routine<'a, Y, R, E, I>),
    Parked(LocalBoxFuture<'a, Outcome<R, E>>),
    Finished,
}

/// What one poll of the routine produced.
pub(crate) enum Activation<Y, R, E> {
    Yielded(Y),
    Finished(Outcome<R, E>),
    /// Parked on a future that is not a yield point.
    Awaiting,
}

/// A routine together with its airlock.
pub(crate) struct Suspension<'a, Y, R, E, I> {
    airlock: Rc<Airlock<Y, R, E, I>>,
    body: Body<'a, Y, R, E, I>,
}

impl<'a, Y, R, E, I> Suspension<'a, Y, R, E, I> {
    /// Wrap a routine. Nothing runs, not even the closure, until first polled.
    pub(crate) fn new<F, Fut>(id: SequenceId, routine: F) -> Self
    where
        F: FnOnce(Co<Y, R, E, I>) -> Fut + 'a,
        Fut: Future<Output = Outcome<R, E>> + 'a,
    {
        let routine: Routine<'a, Y, R, E, I> = Box::new(move |co| routine(co).boxed_local());
        Self {
            airlock: Rc::new(Airlock {
                id,
                slot: RefCell::new(Slot::Empty),
            }),
            body: Body::Created(routine),
        }
    }

    pub(crate) fn load(&self, resumption: Resumption<I, R, E>) {
        self.airlock.load(resumption);
    }

    /// Run the routine until it yields, finishes, or parks elsewhere.
    pub(crate) fn poll_activation(&mut self, cx: &mut Context<'_>) -> Activation<Y, R, E> {
        if matches!(self.body, Body::Created(_)) {
            if let Body::Created(routine) = std::mem::replace(&mut self.body, Body::Finished) {
                let co = Co {
                    airlock: Rc::clone(&self.airlock),
                };
                self.body = Body::Parked(routine(co));
            }
        }

        let poll = match &mut self.body {
            Body::Parked(future) => future.as_mut().poll(cx),
            Body::Created(_) | Body::Finished => {
                debug_assert!(false, "Polled a routine that already finished");
                return Activation::Finished(Err(Unwind::Return(None)));
            }
        };

        match poll {
            Poll::Ready(outcome) => {
                self.discard();
                Activation::Finished(outcome)
            }
            Poll::Pending => match self.airlock.take_yielded() {
                Some(value) => Activation::Yielded(value),
                None => Activation::Awaiting,
            },
        }
    }

    /// Drop the routine without running any more of it.
    pub(crate) fn discard(&mut self) {
        self.body = Body::Finished;
        self.airlock.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;
    use std::cell::Cell;

    fn poll<Y, R, E, I>(suspension: &mut Suspension<'_, Y, R, E, I>) -> Activation<Y, R, E> {
        let mut cx = Context::from_waker(noop_waker_ref());
        suspension.poll_activation(&mut cx)
    }

    #[test]
    fn test_routine_closure_is_lazy() {
        let entered = Cell::new(false);
        let suspension: Suspension<'_, u32, (), (), ()> = Suspension::new(SequenceId::next(), |_co| {
            entered.set(true);
            async { Ok(()) }
        });
        assert!(!entered.get());
        drop(suspension);
        assert!(!entered.get());
    }

    #[test]
    fn test_yield_then_resume_with_input() {
        let mut suspension: Suspension<'_, u32, u32, (), u32> =
            Suspension::new(SequenceId::next(), |co| async move {
                let input = co.yield_(1).await?;
                Ok(input.unwrap_or(0) * 10)
            });

        suspension.load(Resumption::Next(None));
        assert!(matches!(poll(&mut suspension), Activation::Yielded(1)));

        suspension.load(Resumption::Next(Some(4)));
        assert!(matches!(poll(&mut suspension), Activation::Finished(Ok(40))));
    }

    #[test]
    fn test_injected_return_unwinds() {
        let mut suspension: Suspension<'_, u32, u32, (), ()> =
            Suspension::new(SequenceId::next(), |co| async move {
                co.yield_(1).await?;
                co.yield_(2).await?;
                Ok(0)
            });

        suspension.load(Resumption::Next(None));
        assert!(matches!(poll(&mut suspension), Activation::Yielded(1)));

        suspension.load(Resumption::Return(Some(9)));
        assert!(matches!(
            poll(&mut suspension),
            Activation::Finished(Err(Unwind::Return(Some(9))))
        ));
    }

    #[test]
    fn test_foreign_pending_is_awaiting() {
        let mut suspension: Suspension<'_, u32, (), (), ()> =
            Suspension::new(SequenceId::next(), |_co| async move {
                futures::future::pending::<()>().await;
                Ok(())
            });
        suspension.load(Resumption::Next(None));
        assert!(matches!(poll(&mut suspension), Activation::Awaiting));
    }

    #[test]
    fn test_unwind_from_error() {
        let unwind: Unwind<(), &str> = "boom".into();
        assert_eq!(unwind.raised(), Some(&"boom"));
        assert!(!unwind.is_return());
        assert!(Unwind::<u8, ()>::Return(Some(1)).is_return());
    }
}
