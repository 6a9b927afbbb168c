//! Refinement check: the engine behaves like the model.
//!
//! Every path of consumer operations up to a length is applied both to the
//! model and to a real [`Sequence`] running the same routine; the
//! observations, cleanup order and final state must agree.

use std::cell::RefCell;
use std::fmt;

use coseq_core::{Sequence, SequenceError, SequenceState, Step, StepResult};

use crate::lifecycle::{LifecycleModel, ModelOp, Observation, Scope, RETURN_VALUE, ROUTINE_RETURN};

const THROWN: &str = "thrown";

/// What a consumer observed along one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub observations: Vec<Observation>,
    pub cleanup_log: Vec<Scope>,
    pub state: SequenceState,
}

/// A path on which the engine and the model disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub ops: Vec<ModelOp>,
    pub model: Trace,
    pub engine: Trace,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ops: {:?}", self.ops)?;
        writeln!(f, "model:  {:?}", self.model)?;
        write!(f, "engine: {:?}", self.engine)
    }
}

fn observe(result: &StepResult<u8, u8, &'static str>) -> Observation {
    match result {
        Ok(Step::Yield(value)) => Observation::Yield(*value),
        Ok(Step::Done(value)) => Observation::Done(*value),
        Err(SequenceError::Raised(_)) => Observation::Raised,
        Err(SequenceError::Cleanup { .. }) => Observation::CleanupError,
        Err(SequenceError::InvalidState { .. }) => Observation::InvalidState,
    }
}

/// The modelled routine as a real sequence.
fn modelled_routine<'a>(log: &'a RefCell<Vec<Scope>>, cleanup_yields: bool) -> Sequence<'a, u8, u8, &'static str> {
    Sequence::new(move |co| async move {
        let co = &co;
        co.finally(
            async {
                co.yield_(10).await?;
                let inner: Sequence<'_, u8, u8, &'static str> = Sequence::new(move |inner_co| async move {
                    let inner_co = &inner_co;
                    inner_co
                        .finally(
                            async {
                                inner_co.yield_(1).await?;
                                inner_co.yield_(2).await?;
                                Ok(0)
                            },
                            || async move {
                                log.borrow_mut().push(Scope::Inner);
                                if cleanup_yields {
                                    inner_co.yield_(91).await?;
                                }
                                Ok(())
                            },
                        )
                        .await
                });
                co.delegate(inner).await?;
                co.yield_(20).await?;
                Ok(ROUTINE_RETURN)
            },
            || async move {
                log.borrow_mut().push(Scope::Outer);
                if cleanup_yields {
                    co.yield_(92).await?;
                }
                Ok(())
            },
        )
        .await
    })
}

/// Apply `ops` to the engine.
#[must_use]
pub fn replay(cleanup_yields: bool, ops: &[ModelOp]) -> Trace {
    let log = RefCell::new(Vec::new());
    let sequence = modelled_routine(&log, cleanup_yields);
    let observations = ops
        .iter()
        .map(|op| {
            let result = match op {
                ModelOp::Next => sequence.next(),
                ModelOp::Return => sequence.return_(Some(RETURN_VALUE)),
                ModelOp::Throw => sequence.throw(THROWN),
            };
            observe(&result)
        })
        .collect();
    let state = sequence.state();
    let cleanup_log = log.borrow().clone();
    drop(sequence);
    Trace {
        observations,
        cleanup_log,
        state,
    }
}

fn model_trace(model: &LifecycleModel, ops: &[ModelOp]) -> Trace {
    let state = model.trace(ops);
    Trace {
        observations: state.observations,
        cleanup_log: state.cleanup_log,
        state: state.state,
    }
}

/// Compare model and engine on every path of exactly `length` operations.
///
/// Returns the number of paths checked.
pub fn check_refinement(model: &LifecycleModel, length: usize) -> Result<usize, Box<Divergence>> {
    debug_assert!(length <= 10, "Path count grows as 3^length");

    let mut paths_count = 0;
    let mut ops = vec![ModelOp::Next; length];
    let total = 3usize.pow(length as u32);
    for index in 0..total {
        let mut rest = index;
        for op in ops.iter_mut() {
            *op = ModelOp::ALL[rest % 3];
            rest /= 3;
        }
        let expected = model_trace(model, &ops);
        let engine = replay(model.cleanup_yields, &ops);
        if engine != expected {
            return Err(Box::new(Divergence {
                ops: ops.clone(),
                model: expected,
                engine,
            }));
        }
        paths_count += 1;
    }
    Ok(paths_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_matches_full_run() {
        let trace = replay(false, &[ModelOp::Next; 5]);
        assert_eq!(
            trace.observations,
            vec![
                Observation::Yield(10),
                Observation::Yield(1),
                Observation::Yield(2),
                Observation::Yield(20),
                Observation::Done(Some(ROUTINE_RETURN)),
            ]
        );
        assert_eq!(trace.cleanup_log, vec![Scope::Inner, Scope::Outer]);
        assert_eq!(trace.state, SequenceState::Completed);
    }

    #[test]
    fn test_dropping_suspended_sequence_cleans_up() {
        let log = RefCell::new(Vec::new());
        {
            let sequence = modelled_routine(&log, false);
            sequence.next().unwrap();
            sequence.next().unwrap();
            assert!(log.borrow().is_empty());
        }
        assert_eq!(*log.borrow(), vec![Scope::Inner, Scope::Outer]);
    }

    #[test]
    fn test_refinement_without_cleanup_yields() {
        let model = LifecycleModel::new(6);
        let checked = check_refinement(&model, 6).unwrap_or_else(|divergence| panic!("{}", divergence));
        assert_eq!(checked, 729);
    }

    #[test]
    fn test_refinement_with_cleanup_yields() {
        let model = LifecycleModel::new(7).with_cleanup_yields();
        let checked = check_refinement(&model, 7).unwrap_or_else(|divergence| panic!("{}", divergence));
        assert_eq!(checked, 2_187);
    }
}
