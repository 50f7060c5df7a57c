// PipelineSettings: run configuration resolved from CLI flags and
// `PIPELINE_*` environment variables.

use crate::constants::{DEFAULT_BRANCH, DEFAULT_EVENT, DEFAULT_PIPELINE_FILE};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("max-parallel must be at least 1")]
    MaxParallelZero,

    #[error("workflow file '{}' does not exist", .0.display())]
    WorkflowMissing(PathBuf),

    #[error("source directory '{}' does not exist", .0.display())]
    SourceMissing(PathBuf),

    #[error("shell override must not be empty")]
    EmptyShell,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSettings {
    /// Workflow definition. Relative paths are resolved against `source_dir`.
    pub workflow_file: PathBuf,

    /// Project tree each job instance works on.
    pub source_dir: PathBuf,

    /// Run jobs directly in `source_dir` instead of a per-instance snapshot.
    pub in_place: bool,

    /// Triggering event (`push`, `pull_request`, `workflow_dispatch`).
    pub event: String,

    /// Branch pushed to, or targeted by the pull request.
    pub branch: String,

    /// Only run job templates with these ids. Empty runs everything.
    pub job_filter: Vec<String>,

    /// Upper bound on concurrently running job instances.
    pub max_parallel: usize,

    /// Where declared report artifacts are exported after each job.
    pub artifacts_dir: Option<PathBuf>,

    /// Where the JSON run summary is written.
    pub summary_path: Option<PathBuf>,

    /// Overrides the workflow's default shell.
    pub shell: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workflow_file: PathBuf::from(DEFAULT_PIPELINE_FILE),
            source_dir: PathBuf::from("."),
            in_place: false,
            event: DEFAULT_EVENT.to_string(),
            branch: DEFAULT_BRANCH.to_string(),
            job_filter: Vec::new(),
            max_parallel: default_max_parallel(),
            artifacts_dir: None,
            summary_path: None,
            shell: None,
        }
    }
}

/// One slot per available CPU, capped so a laptop does not run a dozen
/// interpreters at once.
pub fn default_max_parallel() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(2)
}

impl PipelineSettings {
    /// The workflow path, anchored at `source_dir` when relative.
    pub fn resolved_workflow_file(&self) -> PathBuf {
        if self.workflow_file.is_absolute() {
            self.workflow_file.clone()
        } else {
            self.source_dir.join(&self.workflow_file)
        }
    }

    /// Check the settings before any job starts.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_parallel == 0 {
            return Err(SettingsError::MaxParallelZero);
        }
        if !self.source_dir.is_dir() {
            return Err(SettingsError::SourceMissing(self.source_dir.clone()));
        }
        let workflow = self.resolved_workflow_file();
        if !workflow.is_file() {
            return Err(SettingsError::WorkflowMissing(workflow));
        }
        if matches!(self.shell.as_deref(), Some(s) if s.trim().is_empty()) {
            return Err(SettingsError::EmptyShell);
        }
        Ok(())
    }

    /// Whether `job_id` survives the `--job` filter.
    pub fn includes_job(&self, job_id: &str) -> bool {
        self.job_filter.is_empty() || self.job_filter.iter().any(|j| j == job_id)
    }

    /// Artifact export directory for one job instance.
    pub fn artifact_dir_for(&self, instance_dir_name: &str) -> Option<PathBuf> {
        self.artifacts_dir
            .as_deref()
            .map(|root: &Path| root.join(instance_dir_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_in(dir: &Path) -> PipelineSettings {
        std::fs::create_dir_all(dir.join("ci")).unwrap();
        std::fs::write(dir.join("ci/pipeline.yml"), "name: x\n").unwrap();
        PipelineSettings {
            source_dir: dir.to_path_buf(),
            ..PipelineSettings::default()
        }
    }

    #[test]
    fn defaults() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.event, "push");
        assert_eq!(settings.branch, "main");
        assert!(settings.max_parallel >= 1);
        assert!(settings.includes_job("anything"));
    }

    #[test]
    fn validate_accepts_existing_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        assert_eq!(settings.validate(), Ok(()));
        assert_eq!(
            settings.resolved_workflow_file(),
            dir.path().join("ci/pipeline.yml")
        );
    }

    #[test]
    fn validate_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_in(dir.path());

        settings.max_parallel = 0;
        assert_eq!(settings.validate(), Err(SettingsError::MaxParallelZero));

        settings.max_parallel = 2;
        settings.shell = Some("  ".into());
        assert_eq!(settings.validate(), Err(SettingsError::EmptyShell));

        settings.shell = None;
        settings.workflow_file = PathBuf::from("missing.yml");
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::WorkflowMissing(_))
        ));
    }

    #[test]
    fn job_filter_and_artifact_dirs() {
        let settings = PipelineSettings {
            job_filter: vec!["security".into()],
            artifacts_dir: Some(PathBuf::from("/tmp/artifacts")),
            ..PipelineSettings::default()
        };
        assert!(settings.includes_job("security"));
        assert!(!settings.includes_job("test"));
        assert_eq!(
            settings.artifact_dir_for("security"),
            Some(PathBuf::from("/tmp/artifacts/security"))
        );
    }
}
