//! coseq-core: a coroutine-backed lazy sequence engine.
//!
//! A *routine* is an `async` block that yields values through a [`Co`]
//! handle. Wrapping it in a [`Sequence`] (or an [`AsyncSequence`]) gives a
//! consumer the iterator protocol: `next`/`send`, `return_` and `throw`,
//! each answering with a [`Step`].
//!
//! ```
//! use coseq_core::{Sequence, Step};
//!
//! let fib: Sequence<'_, u64> = Sequence::new(|co| async move {
//!     let (mut a, mut b) = (0, 1);
//!     loop {
//!         co.yield_(a).await?;
//!         (a, b) = (b, a + b);
//!     }
//! });
//!
//! let first: Vec<u64> = fib.iter().take(6).map(Result::unwrap).collect();
//! assert_eq!(first, vec![0, 1, 1, 2, 3, 5]);
//! ```
//!
//! Around the engine sit the pieces that verify it: recorded histories and
//! the protocol [`invariants`], checked through [`PropertyChecker`].

pub mod async_sequence;
pub mod cleanup;
pub mod counterexample;
pub mod delegate;
pub mod drive;
pub mod error;
pub mod invariants;
mod lifecycle;
pub mod property;
pub mod protocol;
pub mod sequence;
pub mod step;
pub mod suspension;

pub use async_sequence::{AsyncSequence, SequenceStream, StepFuture};
pub use cleanup::finally;
pub use counterexample::{Counterexample, StateSnapshot};
pub use drive::{consume, produced, IntoIter, Produced, SequenceIter};
pub use error::SequenceError;
pub use property::{PropertyChecker, PropertyResult, PropertySummary};
pub use protocol::{from_iter, IterSource, Protocol};
pub use sequence::Sequence;
pub use step::{SequenceId, SequenceState, Step, StepResult};
pub use suspension::{Co, Outcome, Unwind};
