// JobRunner: runs one job instance in its own workspace and produces its
// JobResult.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pipeline_common::{HostContext, PipelineSettings, TaskResult};
use pipeline_sdk::io_util::SNAPSHOT_EXCLUDES;
use pipeline_sdk::{IOUtil, TraceWriter};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactStore;
use crate::definition::FailurePolicy;
use crate::environment::{JobEnvironment, SecretStore};
use crate::matrix::JobInstance;
use crate::steps_runner::StepsRunner;

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Canceled,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Canceled)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    pub fn advance(&mut self, next: JobState) -> Result<()> {
        anyhow::ensure!(
            self.can_transition_to(next),
            "invalid job state transition {self} -> {next}"
        );
        *self = next;
        Ok(())
    }

    /// Terminal state for a finished job's merged result.
    pub fn from_result(result: TaskResult) -> JobState {
        match result {
            TaskResult::Succeeded | TaskResult::SucceededWithIssues => JobState::Succeeded,
            TaskResult::Failed => JobState::Failed,
            TaskResult::Canceled => JobState::Canceled,
            TaskResult::Skipped => JobState::Skipped,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub id: String,
    pub name: String,
    /// Result before `continue-on-error` is applied.
    pub outcome: TaskResult,
    /// Result that counts towards the job.
    pub conclusion: TaskResult,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub message: Option<String>,
}

impl StepRecord {
    pub fn skipped(id: &str, name: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            outcome: TaskResult::Skipped,
            conclusion: TaskResult::Skipped,
            exit_code: None,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            message: Some(message.to_string()),
        }
    }
}

/// Captured output of the step that failed the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub step: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub key: String,
    pub template_id: String,
    pub display_name: String,
    pub matrix: BTreeMap<String, String>,
    pub state: JobState,
    pub result: TaskResult,
    pub steps: Vec<StepRecord>,
    pub diagnostics: Option<Diagnostics>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Files copied to the artifact directory.
    pub artifacts: Vec<PathBuf>,
}

impl JobResult {
    /// An empty result for `instance`, stamped now.
    pub fn new(instance: &JobInstance, state: JobState, result: TaskResult) -> Self {
        let now = Utc::now();
        Self {
            key: instance.key.clone(),
            template_id: instance.template_id.clone(),
            display_name: instance.display_name.clone(),
            matrix: instance.matrix.iter().cloned().collect(),
            state,
            result,
            steps: Vec::new(),
            diagnostics: None,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            artifacts: Vec::new(),
        }
    }

    pub fn skipped(instance: &JobInstance) -> Self {
        Self::new(instance, JobState::Skipped, TaskResult::Skipped)
    }

    pub fn canceled(instance: &JobInstance) -> Self {
        Self::new(instance, JobState::Canceled, TaskResult::Canceled)
    }

    /// A job that could not start because its workspace failed.
    pub fn infrastructure_failure(instance: &JobInstance, err: &anyhow::Error) -> Self {
        let mut result = Self::new(instance, JobState::Failed, TaskResult::Failed);
        result.diagnostics = Some(Diagnostics {
            step: "Set up job".to_string(),
            lines: err.chain().map(|cause| cause.to_string()).collect(),
        });
        result
    }

    pub fn succeeded(&self) -> bool {
        self.result.is_success()
    }

    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.duration_ms = elapsed_ms(self.started_at, self.finished_at);
    }
}

pub(crate) fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// Directories one job instance works in. Temporary directories are removed
/// on drop.
pub struct JobWorkspace {
    working_directory: PathBuf,
    snapshot: Option<TempDir>,
    temp: TempDir,
}

impl JobWorkspace {
    /// Snapshot `source` into a fresh directory, or use it directly when
    /// `in_place` is set.
    pub fn create(source: &Path, in_place: bool, name: &str) -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix(&format!("pipeline-{name}-tmp-"))
            .tempdir()
            .context("Failed to create job temp directory")?;

        if in_place {
            let working_directory = source
                .canonicalize()
                .with_context(|| format!("Source directory '{}' not found", source.display()))?;
            return Ok(Self {
                working_directory,
                snapshot: None,
                temp,
            });
        }

        let snapshot = tempfile::Builder::new()
            .prefix(&format!("pipeline-{name}-"))
            .tempdir()
            .context("Failed to create job workspace")?;
        IOUtil::copy_directory(source, snapshot.path(), SNAPSHOT_EXCLUDES).with_context(|| {
            format!(
                "Failed to snapshot '{}' into the job workspace",
                source.display()
            )
        })?;

        Ok(Self {
            working_directory: snapshot.path().to_path_buf(),
            snapshot: Some(snapshot),
            temp,
        })
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn temp_directory(&self) -> &Path {
        self.temp.path()
    }

    pub fn is_isolated(&self) -> bool {
        self.snapshot.is_some()
    }
}

/// Everything the steps runner needs for one job instance.
pub struct PreparedJob {
    pub instance: JobInstance,
    pub environment: JobEnvironment,
    pub working_directory: PathBuf,
    pub temp_directory: PathBuf,
    /// Default shell for `run:` steps.
    pub shell: String,
    pub cancel_token: CancellationToken,
    pub artifacts: ArtifactStore,
}

impl PreparedJob {
    pub fn failure_policy(&self) -> FailurePolicy {
        self.instance.failure_policy
    }
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// Shared, read-only inputs for every job of a run.
pub struct JobRunner {
    host_context: Arc<HostContext>,
    settings: Arc<PipelineSettings>,
    workflow_env: Arc<BTreeMap<String, String>>,
    secrets: Arc<SecretStore>,
    shell: String,
}

impl JobRunner {
    pub fn new(
        host_context: Arc<HostContext>,
        settings: Arc<PipelineSettings>,
        workflow_env: Arc<BTreeMap<String, String>>,
        secrets: Arc<SecretStore>,
        shell: String,
    ) -> Self {
        Self {
            host_context,
            settings,
            workflow_env,
            secrets,
            shell,
        }
    }

    /// Run one job instance to completion. Never fails: infrastructure
    /// errors become a failed JobResult with diagnostics.
    pub async fn run_async(&self, instance: JobInstance, cancel_token: CancellationToken) -> JobResult {
        let trace = self.host_context.get_trace("JobRunner");
        let mut state = JobState::Pending;

        if cancel_token.is_cancelled() {
            trace.info(&format!("Job '{}' canceled before start.", instance.key));
            return JobResult::canceled(&instance);
        }

        let workspace = match JobWorkspace::create(
            &self.settings.source_dir,
            self.settings.in_place,
            &instance.dir_name(),
        ) {
            Ok(workspace) => workspace,
            Err(err) => {
                trace.error_chain(&err);
                return JobResult::infrastructure_failure(&instance, &err);
            }
        };
        if workspace.is_isolated() {
            trace.info(&format!(
                "Running in workspace snapshot '{}'",
                workspace.working_directory().display()
            ));
        } else {
            trace.info("Running in the source directory");
        }

        if let Err(err) = state.advance(JobState::Running) {
            return JobResult::infrastructure_failure(&instance, &err);
        }
        trace.info(&format!(
            "Starting job: {} in '{}'",
            instance.display_name,
            workspace.working_directory().display()
        ));

        let environment = JobEnvironment::new(
            &self.workflow_env,
            &instance,
            &self.secrets,
            workspace.working_directory(),
        );

        let mut prepared = PreparedJob {
            environment,
            working_directory: workspace.working_directory().to_path_buf(),
            temp_directory: workspace.temp_directory().to_path_buf(),
            shell: self.settings.shell.clone().unwrap_or_else(|| self.shell.clone()),
            cancel_token,
            artifacts: ArtifactStore::new(),
            instance,
        };

        let mut result = StepsRunner::new(Arc::clone(&self.host_context.secret_masker))
            .run(&mut prepared)
            .await;

        if let Err(err) = state.advance(JobState::from_result(result.result)) {
            trace.error_chain(&err);
        }
        result.state = state;

        let destination = self
            .settings
            .artifact_dir_for(&prepared.instance.dir_name())
            .filter(|_| !prepared.artifacts.is_empty());
        if let Some(destination) = destination {
            match prepared.artifacts.export(&destination) {
                Ok(exported) => result.artifacts = exported,
                Err(err) => trace.warning(&format!(
                    "Failed to export artifacts of '{}': {err:#}",
                    prepared.instance.key
                )),
            }
        }

        trace.info(&format!(
            "Job '{}' finished: {} ({} ms)",
            result.display_name, result.result, result.duration_ms
        ));
        result
    }
}
