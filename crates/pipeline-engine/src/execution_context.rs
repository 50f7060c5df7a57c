// StepContext: per-step state while a handler runs. Collects masked output,
// the exit code and the step's result.

use pipeline_common::constants::MAX_DIAGNOSTIC_LINES;
use pipeline_common::{SecretMasker, TaskResult};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::failure_budget::FailureBudget;

pub struct StepContext {
    job_key: String,
    step_id: String,
    display_name: String,
    secret_masker: Arc<SecretMasker>,
    cancel_token: CancellationToken,

    /// The last `MAX_DIAGNOSTIC_LINES` lines written for this step, masked.
    tail: VecDeque<String>,
    /// Counts failed tests in process output as it arrives.
    failure_budget: Option<FailureBudget>,
    reported_failures: u32,

    exit_code: Option<i32>,
    result: Option<TaskResult>,
    result_message: Option<String>,
    is_completed: bool,
}

impl StepContext {
    pub fn new(
        job_key: impl Into<String>,
        step_id: impl Into<String>,
        display_name: impl Into<String>,
        secret_masker: Arc<SecretMasker>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            job_key: job_key.into(),
            step_id: step_id.into(),
            display_name: display_name.into(),
            secret_masker,
            cancel_token,
            tail: VecDeque::with_capacity(MAX_DIAGNOSTIC_LINES),
            failure_budget: None,
            reported_failures: 0,
            exit_code: None,
            result: None,
            result_message: None,
            is_completed: false,
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Count process output lines that report a failed test.
    pub fn track_failures(&mut self, budget: FailureBudget) {
        self.failure_budget = Some(budget);
    }

    pub fn failure_budget(&self) -> Option<&FailureBudget> {
        self.failure_budget.as_ref()
    }

    pub fn reported_failures(&self) -> u32 {
        self.reported_failures
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    /// Record one line of child process output.
    pub fn write(&mut self, line: &str) {
        let masked = self.secret_masker.mask_secrets(line);
        tracing::info!(target: "step", job = %self.job_key, step = %self.step_id, "{}", masked);
        if self
            .failure_budget
            .as_ref()
            .is_some_and(|budget| budget.is_failure_line(line))
        {
            self.reported_failures = self.reported_failures.saturating_add(1);
        }
        self.push(masked);
    }

    pub fn info(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::info!(job = %self.job_key, step = %self.step_id, "{}", masked);
        self.push(masked);
    }

    pub fn debug(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::debug!(job = %self.job_key, step = %self.step_id, "{}", masked);
    }

    pub fn warning(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::warn!(job = %self.job_key, step = %self.step_id, "{}", masked);
        self.push(format!("[warning] {masked}"));
    }

    pub fn error(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::error!(job = %self.job_key, step = %self.step_id, "{}", masked);
        self.push(format!("[error] {masked}"));
    }

    fn push(&mut self, line: String) {
        if self.tail.len() == MAX_DIAGNOSTIC_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    /// The tail of the log kept for a failed step.
    pub fn diagnostics(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Result
    // -----------------------------------------------------------------------

    pub fn set_exit_code(&mut self, exit_code: i32) {
        self.exit_code = Some(exit_code);
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn result(&self) -> Option<TaskResult> {
        self.result
    }

    pub fn result_message(&self) -> Option<&str> {
        self.result_message.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// Set the step's result. Only the first call counts.
    pub fn complete(&mut self, result: TaskResult, message: Option<&str>) {
        if self.is_completed {
            tracing::debug!(
                step = %self.step_id,
                "Ignoring second completion ({}) of step '{}'",
                result,
                self.display_name
            );
            return;
        }

        self.result = Some(result);
        self.result_message = message.map(|m| self.secret_masker.mask_secrets(m));
        self.is_completed = true;

        let summary = format!(
            "Finishing: {} (Result: {}{})",
            self.display_name,
            result,
            self.result_message
                .as_deref()
                .map(|m| format!(", Message: {m}"))
                .unwrap_or_default()
        );
        if result.is_success() {
            tracing::info!(job = %self.job_key, step = %self.step_id, "{}", summary);
        } else {
            tracing::error!(job = %self.job_key, step = %self.step_id, "{}", summary);
        }
    }
}
