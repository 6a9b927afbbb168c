//! The producer protocol: anything a routine can delegate to.

use std::convert::Infallible;
use std::marker::PhantomData;

use crate::sequence::Sequence;
use crate::step::{Step, StepResult};

/// A producer driven with `resume` / `return_` / `throw`.
///
/// Only `resume` is required. The defaults model a producer without the
/// optional capabilities: `return_` finishes immediately and `throw` hands
/// the error back, which tells a delegating routine to close the producer
/// and raise the error itself.
pub trait Protocol {
    type Yield;
    type Return;
    type Error;
    type Input;

    fn resume(&mut self, input: Option<Self::Input>) -> StepResult<Self::Yield, Self::Return, Self::Error>;

    fn return_(&mut self, value: Option<Self::Return>) -> StepResult<Self::Yield, Self::Return, Self::Error> {
        Ok(Step::Done(value))
    }

    /// `Err(error)` means the producer has no throw capability.
    #[allow(clippy::type_complexity)]
    fn throw(&mut self, error: Self::Error) -> Result<StepResult<Self::Yield, Self::Return, Self::Error>, Self::Error> {
        Err(error)
    }
}

impl<Y, R, E, I> Protocol for Sequence<'_, Y, R, E, I> {
    type Yield = Y;
    type Return = R;
    type Error = E;
    type Input = I;

    fn resume(&mut self, input: Option<I>) -> StepResult<Y, R, E> {
        match input {
            Some(input) => Sequence::send(self, input),
            None => Sequence::next(self),
        }
    }

    fn return_(&mut self, value: Option<R>) -> StepResult<Y, R, E> {
        Sequence::return_(self, value)
    }

    fn throw(&mut self, error: E) -> Result<StepResult<Y, R, E>, E> {
        Ok(Sequence::throw(self, error))
    }
}

/// Any iterator seen through the producer protocol.
///
/// Input is ignored, there is no return value, and there is no throw
/// capability. `return_` drops the iterator.
pub struct IterSource<T, E = Infallible, I = ()> {
    iter: Option<T>,
    _marker: PhantomData<fn(I) -> E>,
}

/// Adapt an iterable so a routine can delegate to it.
pub fn from_iter<T, E, I>(items: T) -> IterSource<T::IntoIter, E, I>
where
    T: IntoIterator,
{
    IterSource {
        iter: Some(items.into_iter()),
        _marker: PhantomData,
    }
}

impl<T, E, I> IterSource<T, E, I> {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.iter.is_none()
    }
}

impl<T: Iterator, E, I> Protocol for IterSource<T, E, I> {
    type Yield = T::Item;
    type Return = ();
    type Error = E;
    type Input = I;

    fn resume(&mut self, _input: Option<I>) -> StepResult<T::Item, (), E> {
        match self.iter.as_mut().and_then(Iterator::next) {
            Some(value) => Ok(Step::Yield(value)),
            None => {
                self.iter = None;
                Ok(Step::Done(None))
            }
        }
    }

    fn return_(&mut self, value: Option<()>) -> StepResult<T::Item, (), E> {
        self.iter = None;
        Ok(Step::Done(value))
    }
}
