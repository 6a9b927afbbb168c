//! Consumers for synchronous producers: a for-each driver and std iterators.
//!
//! The methods on [`Sequence`] cover routines; [`consume`] and [`produced`]
//! drive any [`Protocol`] producer the same way, including its `return_` on
//! early exit.

use std::ops::ControlFlow;

use tracing::warn;

use crate::error::SequenceError;
use crate::protocol::Protocol;
use crate::sequence::Sequence;
use crate::step::{SequenceState, Step};

impl<'a, Y, R, E, I> Sequence<'a, Y, R, E, I> {
    /// Call `body` for each value until the sequence is done.
    ///
    /// A `Break` closes the sequence with `return_` so its cleanup runs,
    /// and the driver reports no return value.
    pub fn for_each<F>(&self, mut body: F) -> Result<Option<R>, SequenceError<E>>
    where
        F: FnMut(Y) -> ControlFlow<()>,
    {
        loop {
            match self.next()? {
                Step::Yield(value) => {
                    if body(value).is_break() {
                        self.return_(None)?;
                        return Ok(None);
                    }
                }
                Step::Done(returned) => return Ok(returned),
            }
        }
    }

    /// Borrowing iterator over yielded values.
    ///
    /// Dropping it before exhaustion closes the sequence, like `break` in a
    /// `for` loop.
    pub fn iter(&self) -> SequenceIter<'_, 'a, Y, R, E, I> {
        SequenceIter {
            sequence: self,
            finished: false,
        }
    }
}

/// Iterator returned by [`Sequence::iter`].
pub struct SequenceIter<'s, 'a, Y, R, E, I> {
    sequence: &'s Sequence<'a, Y, R, E, I>,
    finished: bool,
}

fn advance<Y, R, E, I>(sequence: &Sequence<'_, Y, R, E, I>, finished: &mut bool) -> Option<Result<Y, SequenceError<E>>> {
    if *finished {
        return None;
    }
    match sequence.next() {
        Ok(Step::Yield(value)) => Some(Ok(value)),
        Ok(Step::Done(_)) => {
            *finished = true;
            None
        }
        Err(error) => {
            *finished = true;
            Some(Err(error))
        }
    }
}

impl<Y, R, E, I> Iterator for SequenceIter<'_, '_, Y, R, E, I> {
    type Item = Result<Y, SequenceError<E>>;

    fn next(&mut self) -> Option<Self::Item> {
        advance(self.sequence, &mut self.finished)
    }
}

impl<Y, R, E, I> Drop for SequenceIter<'_, '_, Y, R, E, I> {
    fn drop(&mut self) {
        if self.finished || self.sequence.state() != SequenceState::Suspended {
            return;
        }
        if self.sequence.return_(None).is_err() {
            warn!(sequence = %self.sequence.id(), "cleanup raised while closing an abandoned iterator");
        }
    }
}

/// Owning iterator; the sequence closes itself when dropped.
pub struct IntoIter<'a, Y, R, E, I> {
    sequence: Sequence<'a, Y, R, E, I>,
    finished: bool,
}

impl<'a, Y, R, E, I> IntoIterator for Sequence<'a, Y, R, E, I> {
    type Item = Result<Y, SequenceError<E>>;
    type IntoIter = IntoIter<'a, Y, R, E, I>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            sequence: self,
            finished: false,
        }
    }
}

impl<Y, R, E, I> Iterator for IntoIter<'_, Y, R, E, I> {
    type Item = Result<Y, SequenceError<E>>;

    fn next(&mut self) -> Option<Self::Item> {
        advance(&self.sequence, &mut self.finished)
    }
}

impl<'s, 'a, Y, R, E, I> IntoIterator for &'s Sequence<'a, Y, R, E, I> {
    type Item = Result<Y, SequenceError<E>>;
    type IntoIter = SequenceIter<'s, 'a, Y, R, E, I>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Drive `producer` until done, calling `body` for each value.
///
/// A `Break` calls the producer's `return_(None)` so its cleanup runs, and
/// the driver reports no return value.
#[allow(clippy::type_complexity)]
pub fn consume<P, F>(producer: &mut P, mut body: F) -> Result<Option<P::Return>, SequenceError<P::Error>>
where
    P: Protocol,
    F: FnMut(P::Yield) -> ControlFlow<()>,
{
    loop {
        match producer.resume(None)? {
            Step::Yield(value) => {
                if body(value).is_break() {
                    producer.return_(None)?;
                    return Ok(None);
                }
            }
            Step::Done(returned) => return Ok(returned),
        }
    }
}

/// Iterate the values of any producer.
///
/// Dropping the iterator after it has started but before the producer
/// finished calls the producer's `return_(None)`.
pub fn produced<P: Protocol>(producer: &mut P) -> Produced<'_, P> {
    Produced {
        producer,
        started: false,
        finished: false,
    }
}

/// Iterator returned by [`produced`].
pub struct Produced<'p, P: Protocol> {
    producer: &'p mut P,
    started: bool,
    finished: bool,
}

impl<P: Protocol> Iterator for Produced<'_, P> {
    type Item = Result<P::Yield, SequenceError<P::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.started = true;
        match self.producer.resume(None) {
            Ok(Step::Yield(value)) => Some(Ok(value)),
            Ok(Step::Done(_)) => {
                self.finished = true;
                None
            }
            Err(error) => {
                self.finished = true;
                Some(Err(error))
            }
        }
    }
}

impl<P: Protocol> Drop for Produced<'_, P> {
    fn drop(&mut self) {
        if !self.started || self.finished {
            return;
        }
        if self.producer.return_(None).is_err() {
            warn!("cleanup raised while closing an abandoned producer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::convert::Infallible;

    fn counting<'a>(closed: &'a Cell<bool>) -> Sequence<'a, u32, &'static str> {
        Sequence::new(move |co| async move {
            let outcome = async {
                for n in 1..=5 {
                    co.yield_(n).await?;
                }
                Ok::<_, crate::Unwind<&str, Infallible>>("all")
            }
            .await;
            closed.set(true);
            outcome
        })
    }

    #[test]
    fn test_for_each_runs_to_done() {
        let closed = Cell::new(false);
        let seq = counting(&closed);
        let mut sum = 0;
        let returned = seq
            .for_each(|n| {
                sum += n;
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(sum, 15);
        assert_eq!(returned, Some("all"));
        assert!(closed.get());
    }

    #[test]
    fn test_for_each_break_calls_return() {
        let closed = Cell::new(false);
        let seq = counting(&closed);
        let returned = seq
            .for_each(|n| if n == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) })
            .unwrap();
        assert_eq!(returned, None);
        assert!(closed.get());
        assert_eq!(seq.state(), SequenceState::Completed);
    }

    #[test]
    fn test_break_out_of_for_loop_closes() {
        let closed = Cell::new(false);
        let seq = counting(&closed);
        for item in &seq {
            if item.unwrap() == 3 {
                break;
            }
        }
        assert!(closed.get());
        assert!(seq.is_terminal());
    }

    #[test]
    fn test_into_iter_collects() {
        let closed = Cell::new(false);
        let values: Result<Vec<u32>, _> = counting(&closed).into_iter().collect();
        assert_eq!(values.unwrap(), vec![1, 2, 3, 4, 5]);
        assert!(closed.get());
    }

    /// Counts up to `limit`, recording every `return_` it receives.
    struct Ticker {
        next: u32,
        limit: u32,
        return_count: u32,
    }

    impl Ticker {
        fn new(limit: u32) -> Self {
            Self {
                next: 0,
                limit,
                return_count: 0,
            }
        }
    }

    impl Protocol for Ticker {
        type Yield = u32;
        type Return = u32;
        type Error = Infallible;
        type Input = ();

        fn resume(&mut self, _input: Option<()>) -> crate::StepResult<u32, u32, Infallible> {
            if self.next == self.limit {
                return Ok(Step::Done(Some(self.next)));
            }
            self.next += 1;
            Ok(Step::Yield(self.next))
        }

        fn return_(&mut self, value: Option<u32>) -> crate::StepResult<u32, u32, Infallible> {
            self.return_count += 1;
            self.next = self.limit;
            Ok(Step::Done(value))
        }
    }

    #[test]
    fn test_consume_break_calls_producer_return() {
        let mut ticker = Ticker::new(10);
        let mut seen = Vec::new();
        let returned = consume(&mut ticker, |n| {
            seen.push(n);
            if n == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
        assert_eq!(returned, None);
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(ticker.return_count, 1);
    }

    #[test]
    fn test_consume_to_done_skips_return() {
        let mut ticker = Ticker::new(4);
        let returned = consume(&mut ticker, |_| ControlFlow::Continue(())).unwrap();
        assert_eq!(returned, Some(4));
        assert_eq!(ticker.return_count, 0);
    }

    #[test]
    fn test_produced_drop_calls_producer_return() {
        let mut ticker = Ticker::new(10);
        for n in produced(&mut ticker) {
            if n.unwrap() == 2 {
                break;
            }
        }
        assert_eq!(ticker.return_count, 1);

        let mut untouched = Ticker::new(10);
        drop(produced(&mut untouched));
        assert_eq!(untouched.return_count, 0);

        let mut exhausted = Ticker::new(3);
        let values: Vec<u32> = produced(&mut exhausted).map(Result::unwrap).collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(exhausted.return_count, 0);
    }

    #[test]
    fn test_produced_drives_sequence() {
        let closed = Cell::new(false);
        let mut seq = counting(&closed);
        let first: Vec<u32> = produced(&mut seq).take(2).map(Result::unwrap).collect();
        assert_eq!(first, vec![1, 2]);
        assert!(closed.get());
        assert_eq!(seq.state(), SequenceState::Completed);
    }

    #[test]
    fn test_iterator_yields_error_once() {
        let seq: Sequence<'_, u32, (), &str> = Sequence::new(|co| async move {
            co.yield_(1).await?;
            let failed: Result<(), &str> = Err("bad");
            failed?;
            Ok(())
        });
        let items: Vec<_> = seq.iter().collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(SequenceError::Raised("bad"))));
    }
}
