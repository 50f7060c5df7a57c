// Failure budget for test steps: a non-zero exit is tolerated while the number
// of reported test failures stays under the budget.

use anyhow::{Context, Result};
use regex::Regex;

use crate::definition::FailureBudgetSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    /// The process exited 0.
    Passed,
    /// Non-zero exit with `failures` under the budget.
    Tolerated { failures: u32 },
    /// The budget was reached; the run was stopped early or failed too often.
    Exceeded { failures: u32 },
    /// Non-zero exit without any recognised test failure (collection error,
    /// crash, missing tool).
    Unrecognised,
}

#[derive(Debug, Clone)]
pub struct FailureBudget {
    max_failures: u32,
    pattern: Regex,
}

impl FailureBudget {
    pub fn new(max_failures: u32, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("Invalid failure pattern '{pattern}'"))?;
        Ok(Self {
            max_failures,
            pattern,
        })
    }

    pub fn from_spec(spec: &FailureBudgetSpec) -> Result<Self> {
        Self::new(spec.max_failures, &spec.pattern)
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// True when an output line reports one failed test.
    pub fn is_failure_line(&self, line: &str) -> bool {
        self.pattern.is_match(line.trim_start())
    }

    /// Judge an exit code given the failures counted while the step ran.
    pub fn assess(&self, exit_code: i32, failures: u32) -> BudgetVerdict {
        if exit_code == 0 {
            return BudgetVerdict::Passed;
        }
        match failures {
            0 => BudgetVerdict::Unrecognised,
            n if n >= self.max_failures => BudgetVerdict::Exceeded { failures: n },
            n => BudgetVerdict::Tolerated { failures: n },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_common::constants::DEFAULT_FAILURE_PATTERN;

    fn pytest_output(failures: usize) -> Vec<String> {
        let mut lines = vec![
            "============================= test session starts ==============================".to_string(),
            "collected 40 items".to_string(),
            "=========================== short test summary info ============================".to_string(),
        ];
        for i in 0..failures {
            lines.push(format!("FAILED tests/test_api.py::test_case_{i} - AssertionError"));
        }
        lines.push(format!("======================== {failures} failed, 34 passed in 1.20s ========================"));
        lines
    }

    fn budget() -> FailureBudget {
        FailureBudget::new(5, DEFAULT_FAILURE_PATTERN).unwrap()
    }

    fn count(budget: &FailureBudget, lines: &[String]) -> u32 {
        lines.iter().filter(|l| budget.is_failure_line(l)).count() as u32
    }

    #[test]
    fn clean_exit_passes() {
        let budget = budget();
        let out = pytest_output(0);
        assert_eq!(budget.assess(0, count(&budget, &out)), BudgetVerdict::Passed);
    }

    #[test]
    fn failures_under_budget_are_tolerated() {
        let budget = budget();
        let out = pytest_output(3);
        assert_eq!(
            budget.assess(1, count(&budget, &out)),
            BudgetVerdict::Tolerated { failures: 3 }
        );
    }

    #[test]
    fn six_failures_exceed_a_budget_of_five() {
        let budget = budget();
        let out = pytest_output(6);
        assert_eq!(
            budget.assess(1, count(&budget, &out)),
            BudgetVerdict::Exceeded { failures: 6 }
        );
    }

    #[test]
    fn reaching_the_budget_is_fatal() {
        let budget = budget();
        let out = pytest_output(5);
        assert_eq!(
            budget.assess(1, count(&budget, &out)),
            BudgetVerdict::Exceeded { failures: 5 }
        );
    }

    #[test]
    fn nonzero_exit_without_failures_is_unrecognised() {
        let budget = budget();
        let out = vec!["ERROR: file or directory not found: tests/".to_string()];
        assert_eq!(budget.assess(4, count(&budget, &out)), BudgetVerdict::Unrecognised);
    }

    #[test]
    fn custom_pattern() {
        let budget = FailureBudget::new(3, r"^not ok \d+").unwrap();
        let out: Vec<String> = ["ok 1", "not ok 2 - boom", "  not ok 3 - bang", "ok 4"]
            .iter()
            .map(|l| l.to_string())
            .collect();
        assert_eq!(count(&budget, &out), 2);
        assert!(FailureBudget::new(3, "(").is_err());
    }
}
