//! Delegation: a routine handing its consumer to an inner producer.
//!
//! While delegating, every resumption the outer sequence receives is
//! forwarded to the inner producer and every inner yield surfaces as the
//! outer's own step. The inner's return value becomes the value of the
//! delegation expression.
//!
//! An injected `return_` closes the inner producer first. If the inner
//! finishes, the outer unwinds with the original return value; if inner
//! cleanup yields, that value surfaces and delegation carries on. The
//! `_with_return` variants hand the consumer's value to the inner producer;
//! the plain ones close it with `None`, since its return type may differ.

use tracing::debug;

use crate::async_sequence::AsyncSequence;
use crate::error::SequenceError;
use crate::protocol::Protocol;
use crate::step::{Step, StepResult};
use crate::suspension::{Co, Resumption, Unwind};

impl<Y, R, E, I> Co<Y, R, E, I> {
    /// Delegate to a synchronous producer until it finishes.
    ///
    /// The producer's return type is independent of this routine's, so an
    /// injected `return_` closes it with `return_(None)`. Use
    /// [`delegate_with_return`](Self::delegate_with_return) to pass the
    /// consumer's value on.
    pub async fn delegate<P>(&self, inner: P) -> Result<Option<P::Return>, Unwind<R, E>>
    where
        P: Protocol<Yield = Y, Error = E, Input = I>,
    {
        self.delegate_sync(inner, |_| None).await
    }

    /// Delegate to a producer sharing this routine's return type.
    ///
    /// An injected `return_(value)` closes the producer with
    /// `return_(value)`, so its cleanup sees the consumer's value.
    pub async fn delegate_with_return<P>(&self, inner: P) -> Result<Option<R>, Unwind<R, E>>
    where
        P: Protocol<Yield = Y, Return = R, Error = E, Input = I>,
        R: Clone,
    {
        self.delegate_sync(inner, Option::clone).await
    }

    /// Delegate to an async sequence until it finishes.
    ///
    /// Closes the inner sequence with `return_(None)` on an injected return.
    pub async fn delegate_async<R2>(&self, inner: AsyncSequence<'_, Y, R2, E, I>) -> Result<Option<R2>, Unwind<R, E>> {
        self.delegate_async_inner(inner, |_| None).await
    }

    /// [`delegate_async`](Self::delegate_async), forwarding the consumer's
    /// return value to the inner sequence.
    pub async fn delegate_async_with_return(&self, inner: AsyncSequence<'_, Y, R, E, I>) -> Result<Option<R>, Unwind<R, E>>
    where
        R: Clone,
    {
        self.delegate_async_inner(inner, Option::clone).await
    }

    async fn delegate_sync<P, F>(&self, mut inner: P, forward: F) -> Result<Option<P::Return>, Unwind<R, E>>
    where
        P: Protocol<Yield = Y, Error = E, Input = I>,
        F: Fn(&Option<R>) -> Option<P::Return>,
    {
        let mut step = inner.resume(None);
        let mut closing: Option<Option<R>> = None;
        loop {
            let value = match step {
                Ok(Step::Yield(value)) => value,
                Ok(Step::Done(returned)) => return finish(closing, returned),
                Err(error) => return Err(Unwind::Raise(error)),
            };

            step = match self.suspend(value).await {
                Resumption::Next(input) => {
                    closing = None;
                    inner.resume(input)
                }
                Resumption::Return(value) => {
                    debug!(sequence = %self.id(), "closing delegate on return");
                    let forwarded = forward(&value);
                    closing = Some(value);
                    inner.return_(forwarded)
                }
                Resumption::Throw(error) => {
                    closing = None;
                    match inner.throw(error) {
                        Ok(step) => step,
                        Err(error) => {
                            debug!(sequence = %self.id(), "delegate cannot take a throw; closing it");
                            return Err(raise_after_close(inner.return_(None), error));
                        }
                    }
                }
            };
        }
    }

    async fn delegate_async_inner<R2, F>(&self, inner: AsyncSequence<'_, Y, R2, E, I>, forward: F) -> Result<Option<R2>, Unwind<R, E>>
    where
        F: Fn(&Option<R>) -> Option<R2>,
    {
        let mut step = inner.next().await;
        let mut closing: Option<Option<R>> = None;
        loop {
            let value = match step {
                Ok(Step::Yield(value)) => value,
                Ok(Step::Done(returned)) => return finish(closing, returned),
                Err(error) => return Err(Unwind::Raise(error)),
            };

            step = match self.suspend(value).await {
                Resumption::Next(Some(input)) => {
                    closing = None;
                    inner.send(input).await
                }
                Resumption::Next(None) => {
                    closing = None;
                    inner.next().await
                }
                Resumption::Return(value) => {
                    debug!(sequence = %self.id(), delegate = %inner.id(), "closing delegate on return");
                    let forwarded = forward(&value);
                    closing = Some(value);
                    inner.return_(forwarded).await
                }
                Resumption::Throw(error) => {
                    closing = None;
                    inner.throw(error).await
                }
            };
        }
    }
}

fn finish<T, R, E>(closing: Option<Option<R>>, returned: Option<T>) -> Result<Option<T>, Unwind<R, E>> {
    match closing {
        Some(value) => Err(Unwind::Return(value)),
        None => Ok(returned),
    }
}

/// The error to raise after closing a producer that could not take a throw.
///
/// A failing close supersedes the thrown error, which stays chained.
fn raise_after_close<Y, T, R, E>(closed: StepResult<Y, T, E>, error: E) -> Unwind<R, E> {
    match closed {
        Ok(_) => Unwind::Raise(SequenceError::Raised(error)),
        Err(close_error) => Unwind::Raise(SequenceError::cleanup(close_error, Some(SequenceError::Raised(error)))),
    }
}

#[cfg(test)]
mod tests {
    use crate::async_sequence::AsyncSequence;
    use crate::protocol::from_iter;
    use crate::sequence::Sequence;
    use crate::step::{SequenceState, Step};
    use crate::suspension::Unwind;
    use std::cell::{Cell, RefCell};

    #[test]
    fn test_delegate_to_iterable() {
        let seq: Sequence<'_, u32, u32> = Sequence::new(|co| async move {
            co.yield_(0).await?;
            let returned = co.delegate(from_iter([1, 2, 3])).await?;
            assert_eq!(returned, None);
            co.yield_(4).await?;
            Ok(5)
        });
        let mut steps = Vec::new();
        loop {
            let step = seq.next().unwrap();
            let done = step.is_done();
            steps.push(step);
            if done {
                break;
            }
        }
        assert_eq!(
            steps,
            vec![
                Step::Yield(0),
                Step::Yield(1),
                Step::Yield(2),
                Step::Yield(3),
                Step::Yield(4),
                Step::Done(Some(5))
            ]
        );
    }

    #[test]
    fn test_inner_return_value_is_expression_value() {
        let seq: Sequence<'_, &str, String> = Sequence::new(|co| async move {
            let inner: Sequence<'_, &str, u32> = Sequence::new(|co| async move {
                co.yield_("inner").await?;
                Ok(42)
            });
            let returned = co.delegate(inner).await?;
            Ok(format!("inner returned {:?}", returned))
        });
        assert_eq!(seq.next().unwrap(), Step::Yield("inner"));
        assert_eq!(seq.next().unwrap(), Step::Done(Some(String::from("inner returned Some(42)"))));
    }

    #[test]
    fn test_forwarded_input_reaches_inner() {
        let seq: Sequence<'_, u32, (), std::convert::Infallible, u32> = Sequence::new(|co| async move {
            let inner: Sequence<'_, u32, (), std::convert::Infallible, u32> = Sequence::new(|co| async move {
                let got = co.yield_(1).await?;
                co.yield_(got.unwrap_or(0) + 1).await?;
                Ok(())
            });
            co.delegate(inner).await?;
            Ok(())
        });
        assert_eq!(seq.send(99).unwrap(), Step::Yield(1));
        assert_eq!(seq.send(10).unwrap(), Step::Yield(11));
        assert_eq!(seq.next().unwrap(), Step::Done(Some(())));
    }

    #[test]
    fn test_return_closes_inner_first() {
        let order = RefCell::new(Vec::new());
        let seq: Sequence<'_, u32, &str> = Sequence::new(|co| {
            let order = &order;
            async move {
                let inner: Sequence<'_, u32> = Sequence::new(|co| async move {
                    let outcome = co.yield_(1).await;
                    order.borrow_mut().push("inner");
                    outcome?;
                    Ok(())
                });
                let outcome = co.delegate(inner).await;
                order.borrow_mut().push("outer");
                outcome?;
                Ok("unreachable")
            }
        });
        assert_eq!(seq.next().unwrap(), Step::Yield(1));
        assert_eq!(seq.return_(Some("closed")).unwrap(), Step::Done(Some("closed")));
        assert_eq!(*order.borrow(), vec!["inner", "outer"]);
        assert_eq!(seq.state(), SequenceState::Completed);
    }

    fn observing_inner<'a>(seen: &'a Cell<Option<Option<u32>>>) -> Sequence<'a, u32, u32> {
        Sequence::new(move |co| async move {
            match co.yield_(1).await {
                Err(Unwind::Return(value)) => {
                    seen.set(Some(value));
                    Err(Unwind::Return(value))
                }
                other => {
                    other?;
                    Ok(0)
                }
            }
        })
    }

    #[test]
    fn test_return_value_reaches_inner() {
        let seen = Cell::new(None);
        let seq: Sequence<'_, u32, u32> = Sequence::new(|co| {
            let seen = &seen;
            async move {
                co.delegate_with_return(observing_inner(seen)).await?;
                Ok(0)
            }
        });
        assert_eq!(seq.next().unwrap(), Step::Yield(1));
        assert_eq!(seq.return_(Some(9)).unwrap(), Step::Done(Some(9)));
        assert_eq!(seen.get(), Some(Some(9)));
    }

    #[test]
    fn test_plain_delegate_closes_inner_with_none() {
        let seen = Cell::new(None);
        let seq: Sequence<'_, u32, u32> = Sequence::new(|co| {
            let seen = &seen;
            async move {
                co.delegate(observing_inner(seen)).await?;
                Ok(0)
            }
        });
        seq.next().unwrap();
        assert_eq!(seq.return_(Some(9)).unwrap(), Step::Done(Some(9)));
        assert_eq!(seen.get(), Some(None));
    }

    #[test]
    fn test_return_value_reaches_async_inner() {
        let seen = Cell::new(None);
        let seq: AsyncSequence<'_, u32, u32> = AsyncSequence::new(|co| {
            let seen = &seen;
            async move {
                let inner: AsyncSequence<'_, u32, u32> = AsyncSequence::new(move |co| async move {
                    match co.yield_(1).await {
                        Err(Unwind::Return(value)) => {
                            seen.set(Some(value));
                            Err(Unwind::Return(value))
                        }
                        other => {
                            other?;
                            Ok(0)
                        }
                    }
                });
                co.delegate_async_with_return(inner).await?;
                Ok(0)
            }
        });
        futures::executor::block_on(async {
            assert_eq!(seq.next().await.unwrap(), Step::Yield(1));
            assert_eq!(seq.return_(Some(4)).await.unwrap(), Step::Done(Some(4)));
        });
        assert_eq!(seen.get(), Some(Some(4)));
    }

    #[test]
    fn test_throw_without_capability_closes_inner() {
        let seq: Sequence<'_, u32, (), &str> = Sequence::new(|co| async move {
            match co.delegate(from_iter([1, 2])).await {
                Err(unwind) if unwind.raised() == Some(&"stop") => {
                    co.yield_(100).await?;
                    Ok(())
                }
                Err(unwind) => Err(unwind),
                Ok(_) => Ok(()),
            }
        });
        assert_eq!(seq.next().unwrap(), Step::Yield(1));
        assert_eq!(seq.throw("stop").unwrap(), Step::Yield(100));
        assert_eq!(seq.next().unwrap(), Step::Done(Some(())));
    }

    #[test]
    fn test_throw_handled_by_inner() {
        let seq: Sequence<'_, &str, (), &str> = Sequence::new(|co| async move {
            let inner: Sequence<'_, &str, (), &str> = Sequence::new(|co| async move {
                if let Err(unwind) = co.yield_("inner").await {
                    if unwind.is_return() {
                        return Err(unwind);
                    }
                    co.yield_("inner caught").await?;
                }
                Ok(())
            });
            co.delegate(inner).await?;
            co.yield_("outer").await?;
            Ok(())
        });
        assert_eq!(seq.next().unwrap(), Step::Yield("inner"));
        assert_eq!(seq.throw("boom").unwrap(), Step::Yield("inner caught"));
        assert_eq!(seq.next().unwrap(), Step::Yield("outer"));
    }

    #[test]
    fn test_unhandled_inner_error_reaches_outer() {
        let seq: Sequence<'_, u32, (), &str> = Sequence::new(|co| async move {
            let inner: Sequence<'_, u32, (), &str> = Sequence::new(|co| async move {
                co.yield_(1).await?;
                Ok(())
            });
            match co.delegate(inner).await {
                Err(Unwind::Raise(error)) => {
                    co.yield_(if error.raised() == Some(&"x") { 7 } else { 0 }).await?;
                    Ok(())
                }
                other => other.map(|_| ()),
            }
        });
        assert_eq!(seq.next().unwrap(), Step::Yield(1));
        assert_eq!(seq.throw("x").unwrap(), Step::Yield(7));
    }
}
