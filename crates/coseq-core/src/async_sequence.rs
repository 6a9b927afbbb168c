//! The asynchronous sequence.
//!
//! Routines may await arbitrary futures between yields. Each drive operation
//! returns a [`StepFuture`]; steps settle strictly in order because a second
//! operation started while one is in flight fails with `InvalidState`.
//!
//! Dropping an unsettled `StepFuture` abandons the activation. The routine
//! keeps its place, and the next operation first runs it to its next yield
//! point, discards that value, and then injects `return` so cleanup still
//! runs. A `throw` or `return_` issued after an abandonment is injected at
//! that same pause point instead.
//!
//! Dropping the sequence can only poll with a no-op waker. If the routine is
//! parked on a future that needs a runtime, such as a timer or a socket, drop
//! gives up and the routine's cleanup never runs. Consumers that abandon a
//! step should finish with [`AsyncSequence::close`] instead of dropping.

use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;
use futures::Stream;
use tracing::{debug, warn};

use crate::error::SequenceError;
use crate::lifecycle::{Entry, Lifecycle, CLOSE_ATTEMPTS_MAX};
use crate::step::{SequenceId, SequenceState, Step, StepResult};
use crate::suspension::{Activation, Co, Outcome, Resumption, Suspension};

/// An async sequence backed by a suspendable routine.
///
/// # Example
///
/// ```
/// use coseq_core::{AsyncSequence, Step};
///
/// # futures::executor::block_on(async {
/// let seq: AsyncSequence<'_, u32> = AsyncSequence::new(|co| async move {
///     co.yield_(1).await?;
///     Ok(())
/// });
/// assert_eq!(seq.next().await.unwrap(), Step::Yield(1));
/// assert_eq!(seq.next().await.unwrap(), Step::Done(Some(())));
/// # });
/// ```
pub struct AsyncSequence<'a, Y, R = (), E = Infallible, I = ()> {
    lifecycle: Lifecycle,
    suspension: RefCell<Suspension<'a, Y, R, E, I>>,
    abandoned: Cell<bool>,
}

/// Progress of a single drive operation.
pub(crate) enum Drive<R, E, I> {
    Admit(Resumption<I, R, E>),
    /// Run an abandoned activation to its next pause point, then inject.
    Drain(Resumption<I, R, E>),
    Poll,
    Settled,
}

impl<R, E, I> Drive<R, E, I> {
    fn is_in_flight(&self) -> bool {
        matches!(self, Self::Drain(_) | Self::Poll)
    }
}

impl<'a, Y, R, E, I> AsyncSequence<'a, Y, R, E, I> {
    /// Wrap `routine`. Nothing runs until the first step is polled.
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
            abandoned: Cell::new(false),
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

    /// Whether a step future was dropped before it settled.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.get()
    }

    pub fn next(&self) -> StepFuture<'_, 'a, Y, R, E, I> {
        self.step(Resumption::Next(None))
    }

    pub fn send(&self, input: I) -> StepFuture<'_, 'a, Y, R, E, I> {
        self.step(Resumption::Next(Some(input)))
    }

    pub fn return_(&self, value: Option<R>) -> StepFuture<'_, 'a, Y, R, E, I> {
        self.step(Resumption::Return(value))
    }

    pub fn throw(&self, error: E) -> StepFuture<'_, 'a, Y, R, E, I> {
        self.step(Resumption::Throw(error))
    }

    fn step(&self, resumption: Resumption<I, R, E>) -> StepFuture<'_, 'a, Y, R, E, I> {
        StepFuture {
            sequence: self,
            drive: Drive::Admit(resumption),
        }
    }

    /// Drive until done, calling `body` for each value.
    ///
    /// A `Break` closes the sequence with `return_` before returning.
    pub async fn for_each<F>(&self, mut body: F) -> Result<Option<R>, SequenceError<E>>
    where
        F: FnMut(Y) -> ControlFlow<()>,
    {
        loop {
            match self.next().await? {
                Step::Yield(value) => {
                    if body(value).is_break() {
                        self.return_(None).await?;
                        return Ok(None);
                    }
                }
                Step::Done(returned) => return Ok(returned),
            }
        }
    }

    /// Close the sequence, awaiting whatever its cleanup awaits.
    ///
    /// Injects `return_(None)` until the routine finishes, discarding values
    /// yielded by cleanup. An abandoned activation is first run to its next
    /// yield point. Returns the routine's final return value.
    pub async fn close(self) -> Result<Option<R>, SequenceError<E>> {
        for _ in 0..CLOSE_ATTEMPTS_MAX {
            match self.return_(None).await? {
                Step::Yield(_) => debug!(sequence = %self.id(), "cleanup yielded while closing"),
                Step::Done(returned) => return Ok(returned),
            }
        }
        warn!(sequence = %self.id(), attempts = CLOSE_ATTEMPTS_MAX, "cleanup kept yielding; closed without finishing");
        Err(self.lifecycle.invalid("cleanup kept yielding while closing"))
    }

    /// Drain every yielded value.
    pub async fn collect(&self) -> Result<Vec<Y>, SequenceError<E>> {
        let mut values = Vec::new();
        while let Step::Yield(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }

    /// View the sequence as a stream of yielded values.
    pub fn into_stream(self) -> SequenceStream<'a, Y, R, E, I> {
        SequenceStream {
            sequence: self,
            drive: None,
        }
    }

    fn poll_drive(&self, drive: &mut Drive<R, E, I>, cx: &mut Context<'_>) -> Poll<StepResult<Y, R, E>> {
        loop {
            match std::mem::replace(drive, Drive::Settled) {
                Drive::Admit(resumption) => {
                    if self.abandoned.replace(false) {
                        debug_assert_eq!(self.state(), SequenceState::Running, "Abandoned flag outside an activation");
                        debug!(sequence = %self.id(), "resuming abandoned activation");
                        *drive = Drive::Drain(match resumption {
                            Resumption::Next(_) => Resumption::Return(None),
                            other => other,
                        });
                        continue;
                    }
                    match self.lifecycle.admit(&self.suspension, resumption) {
                        Entry::Settled(result) => return Poll::Ready(result),
                        Entry::Enter(resumption) => {
                            self.lifecycle.transition(SequenceState::Running);
                            self.suspension.borrow().load(resumption);
                            *drive = Drive::Poll;
                        }
                    }
                }
                Drive::Drain(resumption) => {
                    let activation = self.suspension.borrow_mut().poll_activation(cx);
                    match activation {
                        Activation::Awaiting => {
                            *drive = Drive::Drain(resumption);
                            return Poll::Pending;
                        }
                        Activation::Yielded(_) => {
                            self.suspension.borrow().load(resumption);
                            *drive = Drive::Poll;
                        }
                        finished => {
                            let settled = self.lifecycle.settle(finished);
                            return Poll::Ready(match (settled, resumption) {
                                // Finished before the throw could land; a terminal sequence re-raises.
                                (Ok(_), Resumption::Throw(error)) => Err(SequenceError::Raised(error)),
                                (settled, _) => settled,
                            });
                        }
                    }
                }
                Drive::Poll => {
                    let activation = self.suspension.borrow_mut().poll_activation(cx);
                    if matches!(activation, Activation::Awaiting) {
                        *drive = Drive::Poll;
                        return Poll::Pending;
                    }
                    return Poll::Ready(self.lifecycle.settle(activation));
                }
                Drive::Settled => return Poll::Ready(Err(self.lifecycle.invalid("step polled after it settled"))),
            }
        }
    }

    fn mark_abandoned(&self) {
        debug!(sequence = %self.id(), "step dropped before it settled");
        self.abandoned.set(true);
    }
}

impl<Y, R, E, I> Drop for AsyncSequence<'_, Y, R, E, I> {
    fn drop(&mut self) {
        let closable = match self.state() {
            SequenceState::Suspended => true,
            SequenceState::Running => self.abandoned.get(),
            _ => false,
        };
        if !closable {
            return;
        }

        let mut cx = Context::from_waker(noop_waker_ref());
        let mut drive = Drive::Admit(Resumption::Return(None));
        for _ in 0..CLOSE_ATTEMPTS_MAX {
            match self.poll_drive(&mut drive, &mut cx) {
                Poll::Ready(Ok(Step::Done(_))) => return,
                Poll::Ready(Ok(Step::Yield(_))) => drive = Drive::Admit(Resumption::Return(None)),
                Poll::Ready(Err(_)) => {
                    warn!(sequence = %self.id(), "cleanup raised while dropping an async sequence");
                    return;
                }
                Poll::Pending => {
                    warn!(sequence = %self.id(), "cleanup awaited while dropping; dropped without finishing");
                    return;
                }
            }
        }
        warn!(sequence = %self.id(), attempts = CLOSE_ATTEMPTS_MAX, "cleanup kept yielding; dropped without finishing");
    }
}

impl<Y, R, E, I> fmt::Debug for AsyncSequence<'_, Y, R, E, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSequence")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("abandoned", &self.abandoned.get())
            .finish_non_exhaustive()
    }
}

/// One pending drive operation on an [`AsyncSequence`].
#[must_use = "futures do nothing unless polled"]
pub struct StepFuture<'s, 'a, Y, R, E, I> {
    sequence: &'s AsyncSequence<'a, Y, R, E, I>,
    drive: Drive<R, E, I>,
}

// The routine lives behind a box in the sequence; nothing here is pinned.
impl<Y, R, E, I> Unpin for StepFuture<'_, '_, Y, R, E, I> {}

impl<Y, R, E, I> Future for StepFuture<'_, '_, Y, R, E, I> {
    type Output = StepResult<Y, R, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.sequence.poll_drive(&mut this.drive, cx)
    }
}

impl<Y, R, E, I> Drop for StepFuture<'_, '_, Y, R, E, I> {
    fn drop(&mut self) {
        if self.drive.is_in_flight() {
            self.sequence.mark_abandoned();
        }
    }
}

/// An [`AsyncSequence`] as a [`Stream`] of yielded values.
///
/// The stream ends at `Done`; an error is delivered once and then the
/// stream ends, since the sequence is terminal.
pub struct SequenceStream<'a, Y, R = (), E = Infallible, I = ()> {
    sequence: AsyncSequence<'a, Y, R, E, I>,
    drive: Option<Drive<R, E, I>>,
}

impl<Y, R, E, I> Unpin for SequenceStream<'_, Y, R, E, I> {}

impl<'a, Y, R, E, I> SequenceStream<'a, Y, R, E, I> {
    #[must_use]
    pub fn sequence(&self) -> &AsyncSequence<'a, Y, R, E, I> {
        &self.sequence
    }
}

impl<Y, R, E, I> Stream for SequenceStream<'_, Y, R, E, I> {
    type Item = Result<Y, SequenceError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.drive.is_none() {
            if this.sequence.is_terminal() {
                return Poll::Ready(None);
            }
            this.drive = Some(Drive::Admit(Resumption::Next(None)));
        }
        let Some(drive) = this.drive.as_mut() else {
            return Poll::Ready(None);
        };

        let result = match this.sequence.poll_drive(drive, cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.drive = None;
        Poll::Ready(match result {
            Ok(Step::Yield(value)) => Some(Ok(value)),
            Ok(Step::Done(_)) => None,
            Err(error) => Some(Err(error)),
        })
    }
}

impl<Y, R, E, I> Drop for SequenceStream<'_, Y, R, E, I> {
    fn drop(&mut self) {
        if self.drive.as_ref().is_some_and(Drive::is_in_flight) {
            self.sequence.mark_abandoned();
        }
    }
}
