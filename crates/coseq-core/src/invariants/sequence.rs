//! Protocol invariants checked over a recorded operation history.
//!
//! | Property | Scope | Description |
//! |----------|-------|-------------|
//! | LegalTransitions | lifecycle | Each operation moves along an observable lifecycle edge and its outcome matches the state it leaves behind |
//! | TerminalAbsorbing | lifecycle | After Completed/Errored every operation is absorbed: no state change, no side effects, `done` or re-raise |
//! | CleanupRunsOnce | cleanup | Cleanup never runs more often than it was registered, and has run for every registered scope once terminal |
//! | SingleActivation | activation | `InvalidState` only comes from a re-entrant drive or a foreign await |
//! | StrictOrdering | ordering | Steps increase, and per-sequence states and side-effect counts chain from one operation to the next |

use std::collections::HashMap;
use std::fmt;

use crate::counterexample::{Counterexample, StateSnapshot};
use crate::error::SequenceError;
use crate::property::{PropertyChecker, PropertyResult};
use crate::step::{SequenceState, Step, StepResult};

/// Kind of drive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Next,
    Send,
    Return,
    Throw,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Next => "next",
            Self::Send => "send",
            Self::Return => "return",
            Self::Throw => "throw",
        })
    }
}

/// Shape of a drive operation's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Yield,
    Done,
    Raised,
    Cleanup,
    InvalidState,
}

impl OutcomeKind {
    #[must_use]
    pub fn of<Y, R, E>(result: &StepResult<Y, R, E>) -> Self {
        match result {
            Ok(Step::Yield(_)) => Self::Yield,
            Ok(Step::Done(_)) => Self::Done,
            Err(SequenceError::Raised(_)) => Self::Raised,
            Err(SequenceError::Cleanup { .. }) => Self::Cleanup,
            Err(SequenceError::InvalidState { .. }) => Self::InvalidState,
        }
    }

    fn is_error(self) -> bool {
        matches!(self, Self::Raised | Self::Cleanup | Self::InvalidState)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Yield => "yield",
            Self::Done => "done",
            Self::Raised => "raised",
            Self::Cleanup => "cleanup-error",
            Self::InvalidState => "invalid-state",
        })
    }
}

/// One recorded drive operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOperation {
    /// Raw [`SequenceId`](crate::SequenceId) of the driven sequence.
    pub sequence: u64,
    pub op: OpKind,
    pub outcome: OutcomeKind,
    pub state_before: SequenceState,
    pub state_after: SequenceState,
    /// Routine side effects observed after the operation.
    pub side_effect_count: u64,
    /// Cleanup scopes the routine had entered after the operation.
    pub cleanup_registered_count: u64,
    /// Cleanup actions that had run after the operation.
    pub cleanup_count: u64,
    /// Global step number, strictly increasing.
    pub step: u64,
}

/// Effect counters sampled after an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectCounts {
    pub side_effect_count: u64,
    pub cleanup_registered_count: u64,
    pub cleanup_count: u64,
}

/// Operations in the order they were performed.
#[derive(Debug, Clone, Default)]
pub struct SequenceHistory {
    pub operations: Vec<SequenceOperation>,
}

impl SequenceHistory {
    #[must_use]
    pub fn new() -> Self {
        Self { operations: Vec::new() }
    }

    /// Next step number to record.
    #[must_use]
    pub fn step_next(&self) -> u64 {
        self.operations.last().map_or(1, |op| op.step + 1)
    }

    pub fn record(&mut self, operation: SequenceOperation) {
        debug_assert!(operation.step > 0, "Step must be positive");
        self.operations.push(operation);
    }

    /// Record a finished drive operation from its result.
    pub fn record_step<Y, R, E>(
        &mut self,
        sequence: u64,
        op: OpKind,
        state_before: SequenceState,
        result: &StepResult<Y, R, E>,
        state_after: SequenceState,
        effects: EffectCounts,
    ) {
        let step = self.step_next();
        self.record(SequenceOperation {
            sequence,
            op,
            outcome: OutcomeKind::of(result),
            state_before,
            state_after,
            side_effect_count: effects.side_effect_count,
            cleanup_registered_count: effects.cleanup_registered_count,
            cleanup_count: effects.cleanup_count,
            step,
        });
    }

    #[must_use]
    pub fn operations_count(&self) -> usize {
        self.operations.len()
    }

    fn by_sequence(&self) -> HashMap<u64, Vec<&SequenceOperation>> {
        let mut grouped: HashMap<u64, Vec<&SequenceOperation>> = HashMap::new();
        for op in &self.operations {
            grouped.entry(op.sequence).or_default().push(op);
        }
        grouped
    }
}

/// Access to a recorded history.
pub trait SequenceProperties {
    fn history(&self) -> &SequenceHistory;
}

impl SequenceProperties for SequenceHistory {
    fn history(&self) -> &SequenceHistory {
        self
    }
}

fn snapshot(op: &SequenceOperation) -> StateSnapshot {
    StateSnapshot {
        step: op.step,
        description: format!("seq#{} {} -> {}", op.sequence, op.op, op.outcome),
        variables: vec![
            ("state".to_string(), format!("{} -> {}", op.state_before, op.state_after)),
            ("side_effects".to_string(), op.side_effect_count.to_string()),
            (
                "cleanup".to_string(),
                format!("{}/{}", op.cleanup_count, op.cleanup_registered_count),
            ),
        ],
    }
}

/// Whether an operation may move a sequence from `from` to `to`.
///
/// `Running` never shows up between operations; it is only observed by a
/// re-entrant drive made from inside the routine.
fn observable_edge(from: SequenceState, to: SequenceState) -> bool {
    use SequenceState::*;
    match from {
        Created => matches!(to, Suspended | Completed | Errored),
        Suspended => matches!(to, Suspended | Completed | Errored),
        Running => to == Running,
        Completed | Errored => to == from,
    }
}

/// Whether `outcome` agrees with the state it leaves behind.
fn outcome_matches_state(op: &SequenceOperation) -> bool {
    use SequenceState::*;
    match op.outcome {
        OutcomeKind::Yield => op.state_after == Suspended,
        OutcomeKind::Done => op.state_after == Completed || (op.state_before.is_terminal() && op.state_after == op.state_before),
        OutcomeKind::Raised | OutcomeKind::Cleanup => op.state_after.is_terminal(),
        OutcomeKind::InvalidState => op.state_after == Running || op.state_after == Errored,
    }
}

/// Checks the protocol invariants against a recorded history.
pub struct SequencePropertyChecker<'a, T: SequenceProperties> {
    subject: &'a T,
    dst_seed: Option<u64>,
}

impl<'a, T: SequenceProperties> SequencePropertyChecker<'a, T> {
    #[must_use]
    pub fn new(subject: &'a T) -> Self {
        Self { subject, dst_seed: None }
    }

    /// Attach the seed that reproduces the history.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        debug_assert!(seed != 0, "DST seed should not be zero");
        self.dst_seed = Some(seed);
        self
    }

    fn counterexample(&self, ops: &[&SequenceOperation]) -> Counterexample {
        let mut ce = match self.dst_seed {
            Some(seed) => Counterexample::with_seed(seed),
            None => Counterexample::new(),
        };
        for op in ops {
            ce.add_state(snapshot(op));
        }
        ce
    }

    fn check_legal_transitions(&self) -> PropertyResult {
        for op in &self.subject.history().operations {
            if !observable_edge(op.state_before, op.state_after) {
                return PropertyResult::fail(
                    "LegalTransitions",
                    "lifecycle",
                    format!("{} moved seq#{} {} -> {}", op.op, op.sequence, op.state_before, op.state_after),
                    Some(self.counterexample(&[op])),
                );
            }
            if !outcome_matches_state(op) {
                return PropertyResult::fail(
                    "LegalTransitions",
                    "lifecycle",
                    format!("{} on seq#{} left it {} after a {} outcome", op.op, op.sequence, op.state_after, op.outcome),
                    Some(self.counterexample(&[op])),
                );
            }
        }
        PropertyResult::pass("LegalTransitions", "lifecycle")
    }

    fn check_terminal_absorbing(&self) -> PropertyResult {
        for ops in self.subject.history().by_sequence().values() {
            let Some(first_terminal) = ops.iter().position(|op| op.state_after.is_terminal()) else {
                continue;
            };
            let settled = ops[first_terminal];
            for &op in &ops[first_terminal + 1..] {
                let absorbed = op.state_before == settled.state_after
                    && op.state_after == settled.state_after
                    && op.side_effect_count == settled.side_effect_count
                    && op.cleanup_count == settled.cleanup_count
                    && match op.op {
                        OpKind::Next | OpKind::Send | OpKind::Return => op.outcome == OutcomeKind::Done,
                        OpKind::Throw => op.outcome == OutcomeKind::Raised,
                    };
                if !absorbed {
                    return PropertyResult::fail(
                        "TerminalAbsorbing",
                        "lifecycle",
                        format!(
                            "{} on terminal seq#{} produced {} ({} -> {})",
                            op.op, op.sequence, op.outcome, op.state_before, op.state_after
                        ),
                        Some(self.counterexample(&[settled, op])),
                    );
                }
            }
        }
        PropertyResult::pass("TerminalAbsorbing", "lifecycle")
    }

    fn check_cleanup_runs_once(&self) -> PropertyResult {
        for op in &self.subject.history().operations {
            if op.cleanup_count > op.cleanup_registered_count {
                return PropertyResult::fail(
                    "CleanupRunsOnce",
                    "cleanup",
                    format!(
                        "seq#{} ran cleanup {} times for {} registered scopes",
                        op.sequence, op.cleanup_count, op.cleanup_registered_count
                    ),
                    Some(self.counterexample(&[op])),
                );
            }
            let cleanup_error_in_flight = op.outcome == OutcomeKind::Cleanup;
            if op.state_after.is_terminal() && op.cleanup_count != op.cleanup_registered_count && !cleanup_error_in_flight {
                return PropertyResult::fail(
                    "CleanupRunsOnce",
                    "cleanup",
                    format!(
                        "seq#{} is {} with {} of {} cleanup scopes run",
                        op.sequence, op.state_after, op.cleanup_count, op.cleanup_registered_count
                    ),
                    Some(self.counterexample(&[op])),
                );
            }
        }
        PropertyResult::pass("CleanupRunsOnce", "cleanup")
    }

    fn check_single_activation(&self) -> PropertyResult {
        for op in &self.subject.history().operations {
            let from_running = op.state_before == SequenceState::Running;
            let legal = match op.outcome {
                OutcomeKind::InvalidState => {
                    (from_running && op.state_after == SequenceState::Running) || op.state_after == SequenceState::Errored
                }
                _ => !from_running,
            };
            if !legal {
                return PropertyResult::fail(
                    "SingleActivation",
                    "activation",
                    format!("{} on seq#{} from {} produced {}", op.op, op.sequence, op.state_before, op.outcome),
                    Some(self.counterexample(&[op])),
                );
            }
        }
        PropertyResult::pass("SingleActivation", "activation")
    }

    fn check_strict_ordering(&self) -> PropertyResult {
        let history = self.subject.history();
        for pair in history.operations.windows(2) {
            if pair[1].step <= pair[0].step {
                return PropertyResult::fail(
                    "StrictOrdering",
                    "ordering",
                    format!("step {} recorded after step {}", pair[1].step, pair[0].step),
                    Some(self.counterexample(&[&pair[0], &pair[1]])),
                );
            }
        }
        for ops in history.by_sequence().values() {
            for pair in ops.windows(2) {
                let (prev, op) = (pair[0], pair[1]);
                let chained = op.state_before == prev.state_after
                    && op.side_effect_count >= prev.side_effect_count
                    && op.cleanup_count >= prev.cleanup_count;
                if !chained {
                    return PropertyResult::fail(
                        "StrictOrdering",
                        "ordering",
                        format!("seq#{} step {} does not follow step {}", op.sequence, op.step, prev.step),
                        Some(self.counterexample(&[prev, op])),
                    );
                }
                if prev.outcome.is_error() && prev.outcome != OutcomeKind::InvalidState && !prev.state_after.is_terminal() {
                    return PropertyResult::fail(
                        "StrictOrdering",
                        "ordering",
                        format!("seq#{} kept running after an escaped error at step {}", op.sequence, prev.step),
                        Some(self.counterexample(&[prev, op])),
                    );
                }
            }
        }
        PropertyResult::pass("StrictOrdering", "ordering")
    }
}

impl<T: SequenceProperties> PropertyChecker for SequencePropertyChecker<'_, T> {
    fn check_all(&self) -> Vec<PropertyResult> {
        vec![
            self.check_legal_transitions(),
            self.check_terminal_absorbing(),
            self.check_cleanup_runs_once(),
            self.check_single_activation(),
            self.check_strict_ordering(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Sequence;
    use std::cell::Cell;

    fn op(
        step: u64,
        op: OpKind,
        outcome: OutcomeKind,
        state_before: SequenceState,
        state_after: SequenceState,
        cleanup: (u64, u64),
    ) -> SequenceOperation {
        SequenceOperation {
            sequence: 1,
            op,
            outcome,
            state_before,
            state_after,
            side_effect_count: 0,
            cleanup_count: cleanup.0,
            cleanup_registered_count: cleanup.1,
            step,
        }
    }

    #[test]
    fn test_recorded_engine_run_passes_all() {
        let side_effect_count = Cell::new(0u64);
        let cleanup_count = Cell::new(0u64);
        let registered_count = Cell::new(0u64);
        let seq: Sequence<'_, u32, (), &str> = Sequence::new(|co| {
            let (side_effect_count, cleanup_count, registered_count) = (&side_effect_count, &cleanup_count, &registered_count);
            async move {
                registered_count.set(1);
                let outcome = async {
                    for n in 0..3 {
                        side_effect_count.set(side_effect_count.get() + 1);
                        co.yield_(n).await?;
                    }
                    Ok::<(), crate::Unwind<(), &str>>(())
                }
                .await;
                cleanup_count.set(cleanup_count.get() + 1);
                outcome
            }
        });

        let mut history = SequenceHistory::new();
        let effects = || EffectCounts {
            side_effect_count: side_effect_count.get(),
            cleanup_registered_count: registered_count.get(),
            cleanup_count: cleanup_count.get(),
        };
        let id = seq.id().as_u64();
        for kind in [OpKind::Next, OpKind::Next, OpKind::Return, OpKind::Next, OpKind::Throw] {
            let before = seq.state();
            let result = match kind {
                OpKind::Next | OpKind::Send => seq.next(),
                OpKind::Return => seq.return_(None),
                OpKind::Throw => seq.throw("late"),
            };
            history.record_step(id, kind, before, &result, seq.state(), effects());
        }

        let checker = SequencePropertyChecker::new(&history).with_seed(11);
        let summary = checker.summary();
        assert!(checker.all_hold(), "{}", summary.format_report());
        assert_eq!(summary.passed_count, 5);
    }

    #[test]
    fn test_terminal_side_effect_detected() {
        let mut history = SequenceHistory::new();
        history.record(op(1, OpKind::Next, OutcomeKind::Done, SequenceState::Created, SequenceState::Completed, (0, 0)));
        let mut leaked = op(2, OpKind::Next, OutcomeKind::Done, SequenceState::Completed, SequenceState::Completed, (0, 0));
        leaked.side_effect_count = 1;
        history.record(leaked);

        let failure = SequencePropertyChecker::new(&history).verify_all().unwrap_err();
        assert_eq!(failure.name, "TerminalAbsorbing");
        assert!(failure.counterexample.is_some());
    }

    #[test]
    fn test_double_cleanup_detected() {
        let mut history = SequenceHistory::new();
        history.record(op(1, OpKind::Next, OutcomeKind::Yield, SequenceState::Created, SequenceState::Suspended, (0, 1)));
        history.record(op(2, OpKind::Return, OutcomeKind::Done, SequenceState::Suspended, SequenceState::Completed, (2, 1)));

        let results = SequencePropertyChecker::new(&history).check_all();
        let cleanup = results.iter().find(|r| r.name == "CleanupRunsOnce").unwrap();
        assert!(!cleanup.holds);
        assert!(cleanup.violation.as_ref().unwrap().contains("2 times"));
    }

    #[test]
    fn test_illegal_edge_detected() {
        let mut history = SequenceHistory::new();
        history.record(op(1, OpKind::Next, OutcomeKind::Yield, SequenceState::Completed, SequenceState::Suspended, (0, 0)));
        let failure = SequencePropertyChecker::new(&history).verify_all().unwrap_err();
        assert_eq!(failure.name, "LegalTransitions");
    }

    #[test]
    fn test_reentrant_invalid_state_is_legal() {
        let mut history = SequenceHistory::new();
        history.record(op(
            1,
            OpKind::Next,
            OutcomeKind::InvalidState,
            SequenceState::Running,
            SequenceState::Running,
            (0, 0),
        ));
        assert!(SequencePropertyChecker::new(&history).all_hold());
    }
}
