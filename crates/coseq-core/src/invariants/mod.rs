//! Protocol invariants for sequences, checked against recorded histories.

pub mod sequence;

pub use sequence::{
    OpKind, OutcomeKind, EffectCounts, SequenceHistory, SequenceOperation, SequenceProperties, SequencePropertyChecker,
};
