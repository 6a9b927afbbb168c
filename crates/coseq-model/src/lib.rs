//! # coseq-model
//!
//! A stateright model of one sequence that delegates to an inner sequence,
//! each routine wrapped in a cleanup scope. Model checking explores every
//! interleaving of consumer operations (including a re-entrant resume while
//! an activation runs) and checks the lifecycle invariants. The
//! [`refinement`] module replays the model's operation paths on the real
//! engine and compares what a consumer observes.

pub mod lifecycle;
pub mod refinement;

pub use lifecycle::{LifecycleAction, LifecycleModel, LifecycleState, ModelOp, Observation, Pause, Scope, Unwinding};
pub use refinement::{check_refinement, replay, Divergence, Trace};
