// PipelineRunner: expands the workflow into job instances, runs them
// concurrently and aggregates their results into one PipelineSummary.

use anyhow::Result;
use chrono::{DateTime, Utc};
use pipeline_common::constants::exit_code;
use pipeline_common::{HostContext, PipelineSettings, TaskResult, TaskResultUtil};
use pipeline_sdk::{StringUtil, TraceWriter};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::definition::WorkflowDefinition;
use crate::environment::SecretStore;
use crate::job_runner::{elapsed_ms, JobResult, JobRunner, JobState};
use crate::matrix::{InstancePlan, JobInstance, MatrixExpander};

/// Lines of a failed job's diagnostics repeated in the rendered summary.
const SUMMARY_DIAGNOSTIC_LINES: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub run_id: Uuid,
    pub workflow: String,
    pub event: String,
    pub branch: String,
    pub triggered: bool,
    pub interrupted: bool,
    pub result: TaskResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// One entry per job instance, in expansion order.
    pub jobs: Vec<JobResult>,
}

impl PipelineSummary {
    /// Success iff every job instance succeeded.
    pub fn succeeded(&self) -> bool {
        self.jobs.iter().all(JobResult::succeeded)
    }

    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            exit_code::INTERRUPTED
        } else {
            TaskResultUtil::translate_to_exit_code(self.result)
        }
    }

    pub fn job(&self, key: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.key == key)
    }

    /// Human readable report: one line per job, then the captured output of
    /// each failed job.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} ({} on {}): {}",
            self.workflow, self.event, self.branch, self.result
        );
        if !self.triggered {
            let _ = writeln!(out, "  not triggered; all jobs skipped");
        }

        let width = self.jobs.iter().map(|j| j.display_name.len()).max().unwrap_or(0);
        for job in &self.jobs {
            let _ = writeln!(
                out,
                "  {:<6} {:<width$}  {:>8.1}s",
                status_label(job.state),
                job.display_name,
                job.duration_ms as f64 / 1000.0,
            );
        }

        for job in self.jobs.iter().filter(|j| j.state == JobState::Failed) {
            if let Some(diagnostics) = &job.diagnostics {
                let _ = writeln!(out, "\n--- {} / {} ---", job.display_name, diagnostics.step);
                let skip = diagnostics.lines.len().saturating_sub(SUMMARY_DIAGNOSTIC_LINES);
                for line in &diagnostics.lines[skip..] {
                    let _ = writeln!(out, "  {}", StringUtil::truncate(line, 240));
                }
            }
        }
        out
    }
}

fn status_label(state: JobState) -> &'static str {
    match state {
        JobState::Succeeded => "PASS",
        JobState::Failed => "FAIL",
        JobState::Skipped => "SKIP",
        JobState::Canceled => "CANCEL",
        JobState::Pending | JobState::Running => "?",
    }
}

pub struct PipelineRunner {
    host_context: Arc<HostContext>,
    settings: Arc<PipelineSettings>,
    workflow: Arc<WorkflowDefinition>,
}

impl PipelineRunner {
    pub fn new(
        host_context: Arc<HostContext>,
        settings: PipelineSettings,
        workflow: WorkflowDefinition,
    ) -> Self {
        Self {
            host_context,
            settings: Arc::new(settings),
            workflow: Arc::new(workflow),
        }
    }

    /// Job instances selected by the job filter, in run order.
    pub fn plan(&self) -> Result<Vec<JobInstance>> {
        for id in &self.settings.job_filter {
            anyhow::ensure!(
                self.workflow.job(id).is_some(),
                "job '{id}' is not defined in workflow '{}'",
                self.workflow.name
            );
        }
        Ok(MatrixExpander::expand_all(
            self.workflow
                .jobs
                .iter()
                .filter(|job| self.settings.includes_job(&job.id)),
        ))
    }

    /// Run every planned job instance. Jobs run concurrently up to
    /// `max_parallel`; a failing job never cancels its siblings.
    pub async fn run_async(&self) -> Result<PipelineSummary> {
        let trace = self.host_context.get_trace("PipelineRunner");
        let instances = self.plan()?;
        let started_at = Utc::now();

        for name in self.workflow.undeclared_secrets() {
            trace.warning(&format!(
                "Secret '{name}' is referenced but not declared under 'secrets'; it resolves to an empty string."
            ));
        }
        trace.verbose_object(&instances.iter().map(InstancePlan::from).collect::<Vec<_>>());

        let triggered = self
            .workflow
            .triggers
            .matches(&self.settings.event, &self.settings.branch);

        let jobs = if triggered {
            trace.info(&format!(
                "Running {} job instance(s) of '{}' with max-parallel {}",
                instances.len(),
                self.workflow.name,
                self.settings.max_parallel
            ));
            self.run_instances(instances).await
        } else {
            trace.info(&format!(
                "Event '{}' on branch '{}' does not trigger '{}'; skipping all jobs.",
                self.settings.event, self.settings.branch, self.workflow.name
            ));
            instances.iter().map(JobResult::skipped).collect()
        };

        let finished_at = Utc::now();
        let summary = PipelineSummary {
            run_id: Uuid::new_v4(),
            workflow: self.workflow.name.clone(),
            event: self.settings.event.clone(),
            branch: self.settings.branch.clone(),
            triggered,
            interrupted: self.host_context.shutdown_reason().is_some(),
            result: TaskResultUtil::merge_all(jobs.iter().map(|j| j.result)),
            started_at,
            finished_at,
            duration_ms: elapsed_ms(started_at, finished_at),
            jobs,
        };
        trace.info(&format!(
            "Pipeline finished: {} (exit code {})",
            summary.result,
            summary.exit_code()
        ));
        Ok(summary)
    }

    async fn run_instances(&self, instances: Vec<JobInstance>) -> Vec<JobResult> {
        let secrets = Arc::new(SecretStore::from_env(
            &self.workflow.secrets,
            &self.host_context.secret_masker,
            &self.host_context.get_trace("SecretStore"),
        ));
        let job_runner = Arc::new(JobRunner::new(
            Arc::clone(&self.host_context),
            Arc::clone(&self.settings),
            Arc::new(self.workflow.env.clone()),
            secrets,
            self.workflow.shell.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let shutdown = self.host_context.shutdown_token();

        let mut handles = Vec::with_capacity(instances.len());
        for instance in instances {
            let runner = Arc::clone(&job_runner);
            let semaphore = Arc::clone(&semaphore);
            let token = shutdown.child_token();
            let fallback = instance.clone();
            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return JobResult::canceled(&instance),
                };
                runner.run_async(instance, token).await
            });
            handles.push((fallback, handle));
        }

        let trace = self.host_context.get_trace("PipelineRunner");
        let mut results = Vec::with_capacity(handles.len());
        for (instance, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(err) => {
                    let err = anyhow::anyhow!("job task for '{}' failed: {err}", instance.key);
                    trace.error_chain(&err);
                    results.push(JobResult::infrastructure_failure(&instance, &err));
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const WORKFLOW: &str = r#"
name: CI
on:
  push:
    branches: [main]
jobs:
  test:
    strategy:
      matrix:
        python-version: ["3.8", "3.9", "3.10", "3.11"]
    steps:
      - run: echo "testing on ${{ matrix.python-version }}"
  database:
    steps:
      - name: Provision database
        run: echo "cannot open test.db"; exit 1
  security:
    steps:
      - run: |
          echo '{"results": []}' > bandit-report.json
        artifact: { name: bandit-report, path: bandit-report.json }
      - gate: { report: bandit-report, threshold: HIGH }
"#;

    fn settings(source: &Path) -> PipelineSettings {
        PipelineSettings {
            source_dir: source.to_path_buf(),
            shell: Some("sh".into()),
            max_parallel: 4,
            ..PipelineSettings::default()
        }
    }

    fn runner(settings: PipelineSettings, yaml: &str) -> PipelineRunner {
        PipelineRunner::new(
            HostContext::new(),
            settings,
            WorkflowDefinition::parse_yaml(yaml).unwrap(),
        )
    }

    #[tokio::test]
    async fn database_failure_does_not_affect_other_jobs() {
        let source = tempfile::tempdir().unwrap();
        let summary = runner(settings(source.path()), WORKFLOW)
            .run_async()
            .await
            .unwrap();

        let keys: Vec<&str> = summary.jobs.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "test (3.8)",
                "test (3.9)",
                "test (3.10)",
                "test (3.11)",
                "database",
                "security"
            ]
        );
        for job in summary.jobs.iter().filter(|j| j.key != "database") {
            assert_eq!(job.state, JobState::Succeeded, "{}", job.key);
        }
        assert_eq!(summary.job("database").unwrap().state, JobState::Failed);
        assert!(!summary.succeeded());
        assert_eq!(summary.result, TaskResult::Failed);
        assert_eq!(summary.exit_code(), 1);

        let rendered = summary.render();
        assert!(rendered.contains("FAIL   database"));
        assert!(rendered.contains("cannot open test.db"));
    }

    #[tokio::test]
    async fn all_jobs_succeeding_exits_zero() {
        let source = tempfile::tempdir().unwrap();
        let settings = PipelineSettings {
            job_filter: vec!["test".into(), "security".into()],
            ..settings(source.path())
        };
        let summary = runner(settings, WORKFLOW).run_async().await.unwrap();
        assert_eq!(summary.jobs.len(), 5);
        assert!(summary.succeeded());
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn untriggered_event_skips_everything() {
        let source = tempfile::tempdir().unwrap();
        let settings = PipelineSettings {
            branch: "feature/x".into(),
            ..settings(source.path())
        };
        let summary = runner(settings, WORKFLOW).run_async().await.unwrap();
        assert!(!summary.triggered);
        assert!(summary.jobs.iter().all(|j| j.state == JobState::Skipped));
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn unknown_job_filter_is_an_error() {
        let source = tempfile::tempdir().unwrap();
        let settings = PipelineSettings {
            job_filter: vec!["deploy".into()],
            ..settings(source.path())
        };
        assert!(runner(settings, WORKFLOW).run_async().await.is_err());
    }

    #[tokio::test]
    async fn independent_jobs_run_concurrently() {
        let source = tempfile::tempdir().unwrap();
        let yaml = r#"
jobs:
  left:
    steps:
      - run: |
          touch left.flag
          i=0
          while [ ! -f right.flag ]; do
            i=$((i + 1)); [ $i -gt 100 ] && exit 1; sleep 0.1
          done
  right:
    steps:
      - run: |
          touch right.flag
          i=0
          while [ ! -f left.flag ]; do
            i=$((i + 1)); [ $i -gt 100 ] && exit 1; sleep 0.1
          done
"#;
        let settings = PipelineSettings {
            in_place: true,
            max_parallel: 2,
            ..settings(source.path())
        };
        let summary = runner(settings, yaml).run_async().await.unwrap();
        assert!(summary.succeeded(), "{}", summary.render());
    }

    #[tokio::test]
    async fn shutdown_marks_the_run_interrupted() {
        let source = tempfile::tempdir().unwrap();
        let host = HostContext::new();
        let runner = PipelineRunner::new(
            Arc::clone(&host),
            settings(source.path()),
            WorkflowDefinition::parse_yaml("jobs:\n  slow:\n    steps:\n      - run: sleep 30\n").unwrap(),
        );
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            host.shutdown(pipeline_common::ShutdownReason::UserCancelled);
        });

        let summary = runner.run_async().await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.jobs[0].state, JobState::Canceled);
        assert_eq!(summary.exit_code(), 130);
    }
}
