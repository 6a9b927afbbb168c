//! Counterexamples: the recorded steps that lead to a property violation.

use std::fmt;

/// One recorded step with the variables worth showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub step: u64,
    pub description: String,
    pub variables: Vec<(String, String)>,
}

/// Steps leading to a violation, plus the seed that reproduces them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counterexample {
    pub dst_seed: Option<u64>,
    pub states: Vec<StateSnapshot>,
}

impl Counterexample {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A counterexample that can be replayed with `DST_SEED=<seed>`.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            dst_seed: Some(seed),
            states: Vec::new(),
        }
    }

    pub fn add_state(&mut self, state: StateSnapshot) {
        debug_assert!(
            self.states.last().map_or(true, |last| last.step <= state.step),
            "Counterexample steps must not go backwards"
        );
        self.states.push(state);
    }

    #[must_use]
    pub fn states_count(&self) -> usize {
        self.states.len()
    }

    /// Draw the steps as a vertical trace.
    #[must_use]
    pub fn render_diagram(&self) -> String {
        let mut out = String::new();
        if let Some(seed) = self.dst_seed {
            out.push_str(&format!("reproduce with DST_SEED={}\n", seed));
        }
        for (index, state) in self.states.iter().enumerate() {
            if index > 0 {
                out.push_str("    |\n    v\n");
            }
            out.push_str(&format!("[{:>3}] {}\n", state.step, state.description));
            for (name, value) in &state.variables {
                out.push_str(&format!("      {} = {}\n", name, value));
            }
        }
        out
    }
}

impl fmt::Display for Counterexample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_diagram())
    }
}
