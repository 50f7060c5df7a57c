// Step/job results and how they fold into pipeline exit codes.

use crate::constants::exit_code;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of a step, a job instance, or the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Succeeded,
    /// Passed, but something was tolerated (continue-on-error, failure budget).
    SucceededWithIssues,
    Failed,
    Canceled,
    Skipped,
}

impl TaskResult {
    /// `true` for results that do not fail the pipeline.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            TaskResult::Succeeded | TaskResult::SucceededWithIssues | TaskResult::Skipped
        )
    }

    /// Severity used when merging; higher wins. `Skipped` is neutral.
    fn rank(self) -> u8 {
        match self {
            TaskResult::Skipped => 0,
            TaskResult::Succeeded => 1,
            TaskResult::SucceededWithIssues => 2,
            TaskResult::Failed => 3,
            TaskResult::Canceled => 4,
        }
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskResult::Succeeded => write!(f, "Succeeded"),
            TaskResult::SucceededWithIssues => write!(f, "SucceededWithIssues"),
            TaskResult::Failed => write!(f, "Failed"),
            TaskResult::Canceled => write!(f, "Canceled"),
            TaskResult::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Task result utilities.
pub struct TaskResultUtil;

impl TaskResultUtil {
    /// Merge two results, keeping the worst one.
    ///
    /// Precedence (worst to best): `Canceled`, `Failed`, `SucceededWithIssues`,
    /// `Succeeded`, `Skipped`. A `Skipped` result never masks anything else.
    pub fn merge_task_results(current: Option<TaskResult>, coming: TaskResult) -> TaskResult {
        match current {
            None => coming,
            Some(current) if coming.rank() > current.rank() => coming,
            Some(current) => current,
        }
    }

    /// Fold many results into one. An empty iterator yields `Skipped`.
    pub fn merge_all<I: IntoIterator<Item = TaskResult>>(results: I) -> TaskResult {
        results
            .into_iter()
            .fold(None, |acc, r| Some(Self::merge_task_results(acc, r)))
            .unwrap_or(TaskResult::Skipped)
    }

    /// Translate a final pipeline result into the process exit code.
    pub fn translate_to_exit_code(result: TaskResult) -> i32 {
        match result {
            TaskResult::Succeeded | TaskResult::SucceededWithIssues | TaskResult::Skipped => {
                exit_code::SUCCESS
            }
            TaskResult::Failed => exit_code::FAILURE,
            TaskResult::Canceled => exit_code::INTERRUPTED,
        }
    }
}
