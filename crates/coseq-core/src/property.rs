//! Property verification over recorded sequence histories.
//!
//! Each property names the protocol rule it checks and the area of the
//! engine it guards (`lifecycle`, `cleanup`, `activation`, `ordering`).

use crate::counterexample::Counterexample;

/// Result of checking a single property.
#[derive(Debug, Clone)]
pub struct PropertyResult {
    /// Property name, e.g. "TerminalAbsorbing".
    pub name: &'static str,

    /// Engine area the property guards.
    pub scope: &'static str,

    pub holds: bool,

    /// What went wrong, when the property does not hold.
    pub violation: Option<String>,

    /// Recorded steps leading to the violation.
    pub counterexample: Option<Counterexample>,
}

impl PropertyResult {
    #[must_use]
    pub fn pass(name: &'static str, scope: &'static str) -> Self {
        debug_assert!(!name.is_empty(), "Property name must not be empty");
        debug_assert!(!scope.is_empty(), "Property scope must not be empty");

        Self {
            name,
            scope,
            holds: true,
            violation: None,
            counterexample: None,
        }
    }

    #[must_use]
    pub fn fail(
        name: &'static str,
        scope: &'static str,
        violation: String,
        counterexample: Option<Counterexample>,
    ) -> Self {
        debug_assert!(!name.is_empty(), "Property name must not be empty");
        debug_assert!(!scope.is_empty(), "Property scope must not be empty");
        debug_assert!(!violation.is_empty(), "Violation description must not be empty");

        Self {
            name,
            scope,
            holds: false,
            violation: Some(violation),
            counterexample,
        }
    }

    /// Single-line status for logs and reports.
    #[must_use]
    pub fn format_status(&self) -> String {
        if self.holds {
            format!("[PASS] {} ({})", self.name, self.scope)
        } else {
            format!(
                "[FAIL] {} ({}): {}",
                self.name,
                self.scope,
                self.violation.as_deref().unwrap_or("unknown")
            )
        }
    }
}

/// A source of property results.
pub trait PropertyChecker {
    /// Check every property; passing ones are included.
    fn check_all(&self) -> Vec<PropertyResult>;

    /// Fail fast on the first violated property.
    fn verify_all(&self) -> Result<(), PropertyResult> {
        match self.check_all().into_iter().find(|r| !r.holds) {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn all_hold(&self) -> bool {
        self.check_all().iter().all(|r| r.holds)
    }

    fn summary(&self) -> PropertySummary {
        let results = self.check_all();
        let passed_count = results.iter().filter(|r| r.holds).count() as u64;
        let failed_count = results.len() as u64 - passed_count;

        PropertySummary {
            passed_count,
            failed_count,
            results,
        }
    }
}

/// Aggregated results of one checker run.
#[derive(Debug, Clone)]
pub struct PropertySummary {
    pub passed_count: u64,
    pub failed_count: u64,
    pub results: Vec<PropertyResult>,
}

impl PropertySummary {
    #[must_use]
    pub fn total_count(&self) -> u64 {
        debug_assert_eq!(self.passed_count + self.failed_count, self.results.len() as u64);
        self.results.len() as u64
    }

    /// Multi-line report, with the first counterexample drawn out.
    #[must_use]
    pub fn format_report(&self) -> String {
        let mut report = format!("Property check: {}/{} passed\n", self.passed_count, self.total_count());

        for result in &self.results {
            report.push_str(&result.format_status());
            report.push('\n');
        }

        let counterexample = self
            .results
            .iter()
            .filter(|r| !r.holds)
            .find_map(|r| r.counterexample.as_ref());
        if let Some(ce) = counterexample {
            report.push_str("\nCounterexample:\n");
            report.push_str(&ce.render_diagram());
        }

        report
    }
}
