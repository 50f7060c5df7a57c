// StepsRunner: executes a job's steps in order, evaluating conditions,
// enforcing timeouts and failure budgets, and merging step conclusions into
// the job result.

use chrono::Utc;
use pipeline_common::{SecretMasker, TaskResult, TaskResultUtil, TraceSetting, Tracing};
use pipeline_sdk::TraceWriter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::definition::{FailurePolicy, StepAction, StepDefinition};
use crate::execution_context::StepContext;
use crate::expressions::Condition;
use crate::failure_budget::{BudgetVerdict, FailureBudget};
use crate::handlers::{HandlerData, HandlerFactory};
use crate::job_runner::{elapsed_ms, Diagnostics, JobResult, JobState, PreparedJob, StepRecord};

pub struct StepsRunner {
    secret_masker: Arc<SecretMasker>,
    trace: Tracing,
}

impl StepsRunner {
    pub fn new(secret_masker: Arc<SecretMasker>) -> Self {
        let trace = Tracing::new("StepsRunner", Arc::clone(&secret_masker), TraceSetting::default());
        Self {
            secret_masker,
            trace,
        }
    }

    /// Run every step of `job` in declared order and return the job's result.
    pub async fn run(&self, job: &mut PreparedJob) -> JobResult {
        let mut result = JobResult::new(&job.instance, JobState::Running, TaskResult::Succeeded);
        let mut job_status: Option<TaskResult> = None;
        let steps = job.instance.steps.clone();

        for step in &steps {
            // Steps that still run after the job is cancelled get a token of
            // their own so they are not stopped on start.
            let step_token = if job.cancel_token.is_cancelled() {
                if !step.condition.evaluate(job_status, true) {
                    self.trace.info(&format!(
                        "Skipping step '{}' due to job cancellation.",
                        step.name
                    ));
                    result
                        .steps
                        .push(StepRecord::skipped(&step.id, &step.name, "Job was canceled"));
                    job_status = Some(TaskResultUtil::merge_task_results(
                        job_status,
                        TaskResult::Canceled,
                    ));
                    continue;
                }
                CancellationToken::new()
            } else if Self::should_run(step, job.failure_policy(), job_status) {
                job.cancel_token.child_token()
            } else {
                self.trace.info(&format!(
                    "Skipping step '{}' (condition evaluated to false).",
                    step.name
                ));
                result.steps.push(StepRecord::skipped(
                    &step.id,
                    &step.name,
                    "Condition evaluated to false",
                ));
                continue;
            };

            self.trace.info(&format!("Starting step: {}", step.name));
            let (record, context) = self.run_step(job, step, step_token).await;

            if record.conclusion == TaskResult::Failed && result.diagnostics.is_none() {
                result.diagnostics = Some(Diagnostics {
                    step: step.name.clone(),
                    lines: context.diagnostics(),
                });
            }

            self.trace.info(&format!(
                "Step '{}' completed with outcome={}, conclusion={}",
                step.name, record.outcome, record.conclusion
            ));
            job_status = Some(TaskResultUtil::merge_task_results(
                job_status,
                record.conclusion,
            ));
            result.steps.push(record);
        }

        let final_result = match job_status {
            None | Some(TaskResult::Skipped) => TaskResult::Succeeded,
            Some(r) => r,
        };
        result.result = final_result;
        result.state = JobState::from_result(final_result);
        result.finish();
        result
    }

    /// Whether a step runs given the job's status so far. Under the
    /// `continue` policy, default-condition steps keep running after a failure.
    fn should_run(
        step: &StepDefinition,
        policy: FailurePolicy,
        job_status: Option<TaskResult>,
    ) -> bool {
        if step.condition.evaluate(job_status, false) {
            return true;
        }
        policy == FailurePolicy::Continue
            && step.condition == Condition::Success
            && job_status == Some(TaskResult::Failed)
    }

    async fn run_step(
        &self,
        job: &mut PreparedJob,
        step: &StepDefinition,
        step_token: CancellationToken,
    ) -> (StepRecord, StepContext) {
        let started_at = Utc::now();
        let mut context = StepContext::new(
            job.instance.key.clone(),
            step.id.clone(),
            step.name.clone(),
            Arc::clone(&self.secret_masker),
            step_token.clone(),
        );

        let data = self.handler_data(job, step);
        let outcome = match step.failure_budget.as_ref().map(FailureBudget::from_spec) {
            Some(Err(err)) => {
                context.error(&format!("{err:#}"));
                context.complete(TaskResult::Failed, Some("Invalid failure budget"));
                TaskResult::Failed
            }
            budget => {
                if let Some(Ok(budget)) = budget {
                    context.track_failures(budget);
                }
                self.run_handler(step, &mut context, &data, &step_token).await
            }
        };

        if let Some(declaration) = &step.artifact {
            if outcome != TaskResult::Canceled {
                match job.artifacts.register(declaration, &data.working_directory) {
                    Ok(0) => context.warning(&format!(
                        "Artifact '{}' declared at '{}' was not produced.",
                        declaration.name, declaration.path
                    )),
                    Ok(count) => context.info(&format!(
                        "Registered artifact '{}' ({count} file(s)).",
                        declaration.name
                    )),
                    Err(err) => context.warning(&format!("{err:#}")),
                }
            }
        }

        let conclusion = if step.continue_on_error && outcome == TaskResult::Failed {
            context.info("Step failed but continue-on-error is enabled.");
            TaskResult::Succeeded
        } else {
            outcome
        };

        let finished_at = Utc::now();
        let record = StepRecord {
            id: step.id.clone(),
            name: step.name.clone(),
            outcome,
            conclusion,
            exit_code: context.exit_code(),
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            duration_ms: elapsed_ms(started_at, finished_at),
            message: context.result_message().map(str::to_string),
        };
        (record, context)
    }

    async fn run_handler(
        &self,
        step: &StepDefinition,
        context: &mut StepContext,
        data: &HandlerData,
        step_token: &CancellationToken,
    ) -> TaskResult {
        let handler = HandlerFactory::create(&step.action);
        let timeout = step.timeout_minutes.map(|m| Duration::from_secs(m * 60));

        let mut timed_out = false;
        let run_result = {
            let run = handler.run_async(&mut *context, data);
            tokio::pin!(run);
            match timeout {
                Some(limit) => tokio::select! {
                    r = &mut run => r,
                    _ = tokio::time::sleep(limit) => {
                        timed_out = true;
                        step_token.cancel();
                        run.await
                    }
                },
                None => run.await,
            }
        };

        if timed_out {
            context.error(&format!(
                "The step '{}' has exceeded the maximum execution time of {} minutes.",
                step.name,
                step.timeout_minutes.unwrap_or_default()
            ));
            context.complete(TaskResult::Failed, Some("Step timed out"));
            return TaskResult::Failed;
        }

        match run_result {
            Err(_) if step_token.is_cancelled() => {
                context.info("Step cancelled.");
                context.complete(TaskResult::Canceled, Some("Job was canceled"));
                TaskResult::Canceled
            }
            Err(err) => {
                context.error(&format!("Step failed: {err:#}"));
                context.complete(TaskResult::Failed, Some("Step failed to run"));
                TaskResult::Failed
            }
            Ok(()) => Self::assess_outcome(context),
        }
    }

    /// Outcome of a step whose handler returned normally. Steps with a
    /// failure budget are judged by the test failures counted in their output.
    fn assess_outcome(context: &mut StepContext) -> TaskResult {
        let handler_result = context.result().unwrap_or(TaskResult::Succeeded);
        let (Some(budget), Some(exit_code)) = (context.failure_budget(), context.exit_code()) else {
            return handler_result;
        };

        let max_failures = budget.max_failures();
        match budget.assess(exit_code, context.reported_failures()) {
            BudgetVerdict::Passed => TaskResult::Succeeded,
            BudgetVerdict::Tolerated { failures } => {
                context.warning(&format!(
                    "{failures} test failure(s), below the budget of {max_failures}."
                ));
                TaskResult::SucceededWithIssues
            }
            BudgetVerdict::Exceeded { failures } => {
                context.error(&format!(
                    "{failures} test failure(s) reached the budget of {max_failures}."
                ));
                TaskResult::Failed
            }
            BudgetVerdict::Unrecognised => {
                context.error(&format!(
                    "Exit code {exit_code} without any recognised test failure."
                ));
                TaskResult::Failed
            }
        }
    }

    fn handler_data(&self, job: &PreparedJob, step: &StepDefinition) -> HandlerData {
        let mut inputs = HashMap::new();
        match &step.action {
            StepAction::Run { script } => {
                inputs.insert("script".to_string(), job.environment.interpolate(script));
                inputs.insert(
                    "shell".to_string(),
                    step.shell.clone().unwrap_or_else(|| job.shell.clone()),
                );
            }
            StepAction::Gate(gate) => {
                inputs.insert("artifact".to_string(), gate.report.clone());
                inputs.insert("threshold".to_string(), gate.threshold.to_string());
                if let Some(path) = job.artifacts.first(&gate.report) {
                    inputs.insert("report".to_string(), path.display().to_string());
                }
            }
        }

        let working_directory = match &step.working_directory {
            Some(dir) => job.working_directory.join(job.environment.interpolate(dir)),
            None => job.working_directory.clone(),
        };

        HandlerData {
            inputs,
            environment: job.environment.for_step(step),
            removed_environment: job.environment.secret_names().to_vec(),
            working_directory,
            temp_directory: job.temp_directory.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::definition::WorkflowDefinition;
    use crate::environment::{JobEnvironment, SecretStore};
    use crate::matrix::MatrixExpander;
    use pipeline_sdk::trace::NullTraceWriter;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        job: PreparedJob,
        masker: Arc<SecretMasker>,
        _dir: tempfile::TempDir,
    }

    fn prepare(yaml: &str) -> Fixture {
        prepare_with(yaml, |names, masker| {
            SecretStore::from_lookup(
                names,
                |name| Some(format!("value-of-{name}")),
                masker,
                &NullTraceWriter,
            )
        })
    }

    fn prepare_with<F>(yaml: &str, load_secrets: F) -> Fixture
    where
        F: FnOnce(&[String], &SecretMasker) -> SecretStore,
    {
        let dir = tempfile::tempdir().unwrap();
        let wf = WorkflowDefinition::parse_yaml(yaml).unwrap();
        let instance = MatrixExpander::expand(&wf.jobs[0]).remove(0);
        let masker = Arc::new(SecretMasker::new());
        let secrets = load_secrets(&wf.secrets, &masker);
        let environment = JobEnvironment::new(&wf.env, &instance, &secrets, dir.path());
        let job = PreparedJob {
            instance,
            environment,
            working_directory: dir.path().to_path_buf(),
            temp_directory: dir.path().join("_temp"),
            shell: "sh".to_string(),
            cancel_token: CancellationToken::new(),
            artifacts: ArtifactStore::new(),
        };
        Fixture {
            job,
            masker,
            _dir: dir,
        }
    }

    async fn run(fixture: &mut Fixture) -> JobResult {
        StepsRunner::new(Arc::clone(&fixture.masker))
            .run(&mut fixture.job)
            .await
    }

    fn conclusions(result: &JobResult) -> BTreeMap<&str, TaskResult> {
        result
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.conclusion))
            .collect()
    }

    const PYTEST_JOB: &str = r#"
jobs:
  test:
    steps:
      - id: tests
        run: |
          i=1
          while [ $i -le $FAILURES ]; do
            echo "FAILED tests/test_app.py::test_$i - AssertionError"
            i=$((i + 1))
          done
          [ $FAILURES -eq 0 ]
        max-failures: 5
        env:
          FAILURES: "${{ env.FAILURES }}"
      - id: upload
        run: echo uploaded > uploaded.txt
"#;

    fn pytest_job(failures: u32) -> Fixture {
        let yaml = PYTEST_JOB.replace("${{ env.FAILURES }}", &failures.to_string());
        prepare(&yaml)
    }

    #[tokio::test]
    async fn steps_run_in_order_and_succeed() {
        let mut fixture = prepare(
            "jobs:\n  a:\n    steps:\n      - { id: one, run: echo one >> order.txt }\n      - { id: two, run: echo two >> order.txt }\n",
        );
        let result = run(&mut fixture).await;
        assert_eq!(result.result, TaskResult::Succeeded);
        assert_eq!(result.state, JobState::Succeeded);
        let order = std::fs::read_to_string(fixture.job.working_directory.join("order.txt")).unwrap();
        assert_eq!(order, "one\ntwo\n");
        assert!(result.diagnostics.is_none());
    }

    #[tokio::test]
    async fn six_test_failures_fail_the_job_and_halt() {
        let mut fixture = pytest_job(6);
        let result = run(&mut fixture).await;

        assert_eq!(result.result, TaskResult::Failed);
        assert_eq!(result.state, JobState::Failed);
        let steps = conclusions(&result);
        assert_eq!(steps["tests"], TaskResult::Failed);
        assert_eq!(steps["upload"], TaskResult::Skipped);
        assert!(!fixture.job.working_directory.join("uploaded.txt").exists());

        let diagnostics = result.diagnostics.unwrap();
        assert_eq!(diagnostics.step, "Run i=1");
        assert_eq!(
            diagnostics.lines.iter().filter(|l| l.starts_with("FAILED")).count(),
            6
        );
    }

    #[tokio::test]
    async fn failures_within_budget_are_tolerated() {
        let mut fixture = pytest_job(2);
        let result = run(&mut fixture).await;

        assert_eq!(result.result, TaskResult::SucceededWithIssues);
        assert!(result.succeeded());
        assert_eq!(result.step("tests").unwrap().exit_code, Some(1));
        assert_eq!(
            result.step("upload").unwrap().conclusion,
            TaskResult::Succeeded
        );
    }

    #[tokio::test]
    async fn fatal_step_without_budget_stops_the_job() {
        let mut fixture = prepare(
            r#"
jobs:
  lint:
    steps:
      - { id: install, run: "true" }
      - { id: lint, run: "echo './app.py:1:89: E501 line too long'; exit 1" }
      - { id: tests, run: "true" }
      - { id: report, run: "echo done", if: always() }
      - { id: notify, run: "echo failed", if: failure() }
"#,
        );
        let result = run(&mut fixture).await;
        let steps = conclusions(&result);
        assert_eq!(steps["install"], TaskResult::Succeeded);
        assert_eq!(steps["lint"], TaskResult::Failed);
        assert_eq!(steps["tests"], TaskResult::Skipped);
        assert_eq!(steps["report"], TaskResult::Succeeded);
        assert_eq!(steps["notify"], TaskResult::Succeeded);
        assert_eq!(result.result, TaskResult::Failed);
        assert!(result
            .diagnostics
            .unwrap()
            .lines
            .iter()
            .any(|l| l.contains("E501")));
    }

    #[tokio::test]
    async fn continue_policy_runs_remaining_steps_but_fails() {
        let mut fixture = prepare(
            "jobs:\n  a:\n    failure-policy: continue\n    steps:\n      - { id: bad, run: 'exit 2' }\n      - { id: next, run: 'true' }\n",
        );
        let result = run(&mut fixture).await;
        let steps = conclusions(&result);
        assert_eq!(steps["bad"], TaskResult::Failed);
        assert_eq!(steps["next"], TaskResult::Succeeded);
        assert_eq!(result.result, TaskResult::Failed);
    }

    #[tokio::test]
    async fn tolerant_scan_defers_to_the_gate() {
        let yaml = r#"
jobs:
  security:
    steps:
      - id: scan
        run: |
          echo '{"results": [{"issue_severity": "MEDIUM", "filename": "app.py", "test_id": "B104"}]}' > bandit-report.json
          exit 1
        continue-on-error: true
        artifact: { name: bandit-report, path: bandit-report.json }
      - id: gate
        gate: { report: bandit-report, threshold: HIGH }
"#;
        let mut fixture = prepare(yaml);
        let result = run(&mut fixture).await;
        let scan = result.step("scan").unwrap();
        assert_eq!(scan.outcome, TaskResult::Failed);
        assert_eq!(scan.conclusion, TaskResult::Succeeded);
        assert_eq!(result.step("gate").unwrap().conclusion, TaskResult::Succeeded);
        assert_eq!(result.result, TaskResult::Succeeded);

        let failing = yaml.replace("MEDIUM", "HIGH");
        let mut fixture = prepare(&failing);
        let result = run(&mut fixture).await;
        assert_eq!(result.step("gate").unwrap().conclusion, TaskResult::Failed);
        assert_eq!(result.result, TaskResult::Failed);
        assert_eq!(result.diagnostics.unwrap().step, "Gate bandit-report");
    }

    #[tokio::test]
    async fn gate_fails_when_report_was_not_produced() {
        let mut fixture = prepare(
            r#"
jobs:
  security:
    steps:
      - id: scan
        run: "exit 2"
        continue-on-error: true
        artifact: { name: bandit-report, path: bandit-report.json }
      - id: gate
        gate: { report: bandit-report }
"#,
        );
        let result = run(&mut fixture).await;
        assert_eq!(result.step("gate").unwrap().conclusion, TaskResult::Failed);
        assert_eq!(result.result, TaskResult::Failed);
    }

    #[tokio::test]
    async fn secrets_reach_steps_only_by_reference_and_are_masked() {
        let mut fixture = prepare(
            r#"
secrets: [CODECOV_TOKEN]
jobs:
  upload:
    steps:
      - id: upload
        run: echo "token=$TOKEN implicit=${CODECOV_TOKEN:-unset}"; exit 1
        env:
          TOKEN: ${{ secrets.CODECOV_TOKEN }}
"#,
        );
        let result = run(&mut fixture).await;
        let lines = result.diagnostics.unwrap().lines;
        assert!(lines.iter().any(|l| l == "token=*** implicit=unset"));
        assert!(!lines.iter().any(|l| l.contains("value-of-CODECOV_TOKEN")));
    }

    #[tokio::test]
    async fn secrets_read_from_the_process_environment_are_not_inherited() {
        std::env::set_var("PIPELINE_TEST_INHERITED_SECRET", "inherited-secret-value");
        let mut fixture = prepare_with(
            r#"
secrets: [PIPELINE_TEST_INHERITED_SECRET]
jobs:
  deploy:
    steps:
      - id: implicit
        run: echo "implicit=${PIPELINE_TEST_INHERITED_SECRET:-unset}" > implicit.txt
      - id: explicit
        run: echo "explicit=$PIPELINE_TEST_INHERITED_SECRET" > explicit.txt
        env:
          PIPELINE_TEST_INHERITED_SECRET: ${{ secrets.PIPELINE_TEST_INHERITED_SECRET }}
"#,
            |names, masker| SecretStore::from_env(names, masker, &NullTraceWriter),
        );
        let result = run(&mut fixture).await;
        assert_eq!(result.result, TaskResult::Succeeded);

        let dir = &fixture.job.working_directory;
        let implicit = std::fs::read_to_string(dir.join("implicit.txt")).unwrap();
        assert_eq!(implicit, "implicit=unset\n");
        let explicit = std::fs::read_to_string(dir.join("explicit.txt")).unwrap();
        assert_eq!(explicit, "explicit=inherited-secret-value\n");
    }

    #[tokio::test]
    async fn cancelled_condition_runs_after_cancellation() {
        let mut fixture = prepare(
            r#"
jobs:
  a:
    steps:
      - { id: long, run: 'sleep 30' }
      - { id: cleanup, run: 'echo cleaned > cleanup.txt', if: cancelled() }
      - { id: report, run: 'echo reported > report.txt', if: always() }
      - { id: after, run: 'true' }
"#,
        );
        let token = fixture.job.cancel_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });

        let result = run(&mut fixture).await;
        let steps = conclusions(&result);
        assert_eq!(steps["long"], TaskResult::Canceled);
        assert_eq!(steps["cleanup"], TaskResult::Succeeded);
        assert_eq!(steps["report"], TaskResult::Succeeded);
        assert_eq!(steps["after"], TaskResult::Skipped);
        assert_eq!(result.result, TaskResult::Canceled);

        let dir = &fixture.job.working_directory;
        assert!(dir.join("cleanup.txt").exists());
        assert!(dir.join("report.txt").exists());
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_steps() {
        let mut fixture = prepare(
            "jobs:\n  a:\n    steps:\n      - { id: long, run: 'sleep 30' }\n      - { id: after, run: 'true' }\n",
        );
        let token = fixture.job.cancel_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });

        let result = run(&mut fixture).await;
        let steps = conclusions(&result);
        assert_eq!(steps["long"], TaskResult::Canceled);
        assert_eq!(steps["after"], TaskResult::Skipped);
        assert_eq!(result.result, TaskResult::Canceled);
        assert_eq!(result.state, JobState::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_fails_the_step() {
        let mut fixture = prepare(
            "jobs:\n  a:\n    steps:\n      - { id: slow, run: 'sleep 120', timeout-minutes: 1 }\n      - { id: next, run: 'true' }\n",
        );
        let result = run(&mut fixture).await;
        let slow = result.step("slow").unwrap();
        assert_eq!(slow.conclusion, TaskResult::Failed);
        assert_eq!(slow.message.as_deref(), Some("Step timed out"));
        assert_eq!(result.step("next").unwrap().conclusion, TaskResult::Skipped);
        assert_eq!(result.result, TaskResult::Failed);
    }

    #[tokio::test]
    async fn working_directory_and_shell_override() {
        let mut fixture = prepare(
            "jobs:\n  a:\n    steps:\n      - { id: pwd, run: 'pwd > ../where.txt', working-directory: sub, shell: bash }\n",
        );
        std::fs::create_dir(fixture.job.working_directory.join("sub")).unwrap();
        let result = run(&mut fixture).await;
        assert_eq!(result.result, TaskResult::Succeeded);
        let where_ = std::fs::read_to_string(fixture.job.working_directory.join("where.txt")).unwrap();
        assert!(where_.trim_end().ends_with("sub"));
    }
}
