// Workflow definition: the YAML file parsed into jobs, matrix axes and steps.
// Everything here is static after load.

use pipeline_common::constants::{DEFAULT_FAILURE_PATTERN, DEFAULT_SHELL};
use regex::Regex;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::expressions::{referenced_secrets, Condition};
use crate::security_gate::Severity;
use crate::triggers::TriggerFilter;

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to read workflow file '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow YAML")]
    Yaml(#[from] serde_yaml::Error),

    #[error("workflow defines no jobs")]
    NoJobs,

    #[error("job '{0}' has no steps")]
    EmptyJob(String),

    #[error("step {index} of job '{job}' must define exactly one of `run` or `gate`")]
    StepKind { job: String, index: usize },

    #[error("matrix axis '{axis}' of job '{job}' has no values")]
    EmptyAxis { job: String, axis: String },

    #[error("job '{job}': invalid failure-pattern '{pattern}'")]
    InvalidPattern {
        job: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("job '{job}': unknown severity threshold '{value}'")]
    UnknownSeverity { job: String, value: String },

    #[error("job '{job}': unknown failure-policy '{value}' (expected fail-fast or continue)")]
    UnknownFailurePolicy { job: String, value: String },

    #[error("job '{job}': duplicate step id '{id}'")]
    DuplicateStepId { job: String, id: String },

    #[error("job '{job}': gate step '{step}' reads artifact '{artifact}' that no earlier step declares")]
    UnknownArtifact {
        job: String,
        step: String,
        artifact: String,
    },

    #[error("job '{job}': step '{step}' has an invalid condition")]
    InvalidCondition {
        job: String,
        step: String,
        #[source]
        source: crate::expressions::ExpressionError,
    },

    #[error("job '{job}': '{field}' must be {expected}")]
    InvalidField {
        job: String,
        field: &'static str,
        expected: &'static str,
    },
}

/// What happens to the rest of a job after a fatal step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Skip remaining steps (unless their condition asks for `failure()`/`always()`).
    #[default]
    FailFast,
    /// Keep running remaining steps; the job still ends `Failed`.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub triggers: TriggerFilter,
    /// Secret names read from the invoking environment.
    pub secrets: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Default shell for `run:` steps.
    pub shell: String,
    pub jobs: Vec<JobDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub env: BTreeMap<String, String>,
    /// Axes in declaration order.
    pub matrix: Vec<MatrixAxis>,
    pub failure_policy: FailurePolicy,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAxis {
    pub name: String,
    /// Values in declaration order.
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    pub action: StepAction,
    pub continue_on_error: bool,
    pub condition: Condition,
    pub env: BTreeMap<String, String>,
    pub timeout_minutes: Option<u64>,
    pub failure_budget: Option<FailureBudgetSpec>,
    pub artifact: Option<ArtifactDeclaration>,
    pub working_directory: Option<String>,
    pub shell: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Shell script run through the step's shell.
    Run { script: String },
    /// In-process severity check over a report artifact.
    Gate(GateSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSpec {
    /// Name of an artifact declared by an earlier step.
    pub report: String,
    pub threshold: Severity,
}

/// A report file a step produces, registered under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDeclaration {
    pub name: String,
    /// Path or glob relative to the step's working directory.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureBudgetSpec {
    pub max_failures: u32,
    pub pattern: String,
}

impl WorkflowDefinition {
    /// Read and parse a workflow file.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_yaml(&content)
    }

    /// Parse a workflow YAML document.
    pub fn parse_yaml(content: &str) -> Result<Self, DefinitionError> {
        let yaml: Value = serde_yaml::from_str(content)?;

        let name = yaml
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("Pipeline")
            .to_string();

        // YAML 1.1 readers turn a bare `on` key into `true`.
        let on = yaml.get("on").or_else(|| yaml.get(Value::Bool(true)));
        let triggers = TriggerFilter::from_yaml(on);

        let secrets = yaml
            .get("secrets")
            .and_then(|v| v.as_sequence())
            .map(|seq| {
                seq.iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let env = parse_string_map(yaml.get("env"));

        let shell = yaml
            .get("defaults")
            .and_then(|d| d.get("run"))
            .and_then(|r| r.get("shell"))
            .and_then(|s| s.as_str())
            .unwrap_or(DEFAULT_SHELL)
            .to_string();

        let jobs_map = yaml
            .get("jobs")
            .and_then(|v| v.as_mapping())
            .filter(|m| !m.is_empty())
            .ok_or(DefinitionError::NoJobs)?;

        let mut jobs = Vec::with_capacity(jobs_map.len());
        for (key, value) in jobs_map {
            let id = scalar_to_string(key).unwrap_or_default();
            jobs.push(parse_job(&id, value)?);
        }

        Ok(Self {
            name,
            triggers,
            secrets,
            env,
            shell,
            jobs,
        })
    }

    pub fn job(&self, id: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Secrets referenced through `${{ secrets.X }}` but missing from the
    /// `secrets` list. They always resolve to an empty string.
    pub fn undeclared_secrets(&self) -> Vec<String> {
        let mut texts: Vec<&str> = self.env.values().map(String::as_str).collect();
        for job in &self.jobs {
            texts.extend(job.env.values().map(String::as_str));
            for step in &job.steps {
                texts.extend(step.env.values().map(String::as_str));
                if let StepAction::Run { script } = &step.action {
                    texts.push(script);
                }
            }
        }

        let mut seen = HashSet::new();
        texts
            .into_iter()
            .flat_map(referenced_secrets)
            .filter(|name| !self.secrets.contains(name))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }
}

fn parse_job(id: &str, value: &Value) -> Result<JobDefinition, DefinitionError> {
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(id)
        .to_string();

    let env = parse_string_map(value.get("env"));

    let matrix = parse_matrix(id, value.get("strategy").and_then(|s| s.get("matrix")))?;

    let failure_policy = match value.get("failure-policy").and_then(|v| v.as_str()) {
        None | Some("fail-fast") => FailurePolicy::FailFast,
        Some("continue") => FailurePolicy::Continue,
        Some(other) => {
            return Err(DefinitionError::UnknownFailurePolicy {
                job: id.to_string(),
                value: other.to_string(),
            })
        }
    };

    let steps_seq = value
        .get("steps")
        .and_then(|v| v.as_sequence())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DefinitionError::EmptyJob(id.to_string()))?;

    let mut steps = Vec::with_capacity(steps_seq.len());
    let mut seen_ids = HashSet::new();
    let mut declared_artifacts = HashSet::new();

    for (index, step_yaml) in steps_seq.iter().enumerate() {
        let step = parse_step(id, index, step_yaml)?;

        if !seen_ids.insert(step.id.clone()) {
            return Err(DefinitionError::DuplicateStepId {
                job: id.to_string(),
                id: step.id,
            });
        }

        if let StepAction::Gate(gate) = &step.action {
            if !declared_artifacts.contains(&gate.report) {
                return Err(DefinitionError::UnknownArtifact {
                    job: id.to_string(),
                    step: step.name,
                    artifact: gate.report.clone(),
                });
            }
        }
        if let Some(artifact) = &step.artifact {
            declared_artifacts.insert(artifact.name.clone());
        }

        steps.push(step);
    }

    Ok(JobDefinition {
        id: id.to_string(),
        name,
        env,
        matrix,
        failure_policy,
        steps,
    })
}

fn parse_matrix(job: &str, value: Option<&Value>) -> Result<Vec<MatrixAxis>, DefinitionError> {
    let Some(map) = value.and_then(|v| v.as_mapping()) else {
        return Ok(Vec::new());
    };

    let mut axes = Vec::with_capacity(map.len());
    for (key, values) in map {
        let name = scalar_to_string(key).unwrap_or_default();
        let values: Vec<String> = values
            .as_sequence()
            .map(|seq| seq.iter().filter_map(scalar_to_string).collect())
            .unwrap_or_default();
        if values.is_empty() {
            return Err(DefinitionError::EmptyAxis {
                job: job.to_string(),
                axis: name,
            });
        }
        axes.push(MatrixAxis { name, values });
    }
    Ok(axes)
}

fn parse_step(job: &str, index: usize, value: &Value) -> Result<StepDefinition, DefinitionError> {
    let run = value.get("run").and_then(|v| v.as_str());
    let gate = value.get("gate");

    let action = match (run, gate) {
        (Some(script), None) => StepAction::Run {
            script: script.to_string(),
        },
        (None, Some(gate)) => StepAction::Gate(parse_gate(job, gate)?),
        _ => {
            return Err(DefinitionError::StepKind {
                job: job.to_string(),
                index,
            })
        }
    };

    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| match &action {
            StepAction::Run { script } => {
                format!("Run {}", script.lines().next().unwrap_or_default().trim())
            }
            StepAction::Gate(g) => format!("Gate {}", g.report),
        });

    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("step_{}", index + 1));

    let continue_on_error = match value.get("continue-on-error") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            return Err(DefinitionError::InvalidField {
                job: job.to_string(),
                field: "continue-on-error",
                expected: "a boolean",
            })
        }
    };

    let condition_text = value.get("if").and_then(|v| v.as_str()).unwrap_or("");
    let condition =
        Condition::parse(condition_text).map_err(|source| DefinitionError::InvalidCondition {
            job: job.to_string(),
            step: name.clone(),
            source,
        })?;

    let timeout_minutes = match value.get("timeout-minutes") {
        None => None,
        Some(v) => Some(v.as_u64().filter(|m| *m > 0).ok_or(
            DefinitionError::InvalidField {
                job: job.to_string(),
                field: "timeout-minutes",
                expected: "a positive integer",
            },
        )?),
    };

    let failure_budget = match value.get("max-failures") {
        None => None,
        Some(v) => {
            let max_failures = v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .ok_or(DefinitionError::InvalidField {
                    job: job.to_string(),
                    field: "max-failures",
                    expected: "a positive integer",
                })?;
            let pattern = value
                .get("failure-pattern")
                .and_then(|p| p.as_str())
                .unwrap_or(DEFAULT_FAILURE_PATTERN)
                .to_string();
            Regex::new(&pattern).map_err(|source| DefinitionError::InvalidPattern {
                job: job.to_string(),
                pattern: pattern.clone(),
                source,
            })?;
            Some(FailureBudgetSpec {
                max_failures,
                pattern,
            })
        }
    };

    let artifact = value.get("artifact").and_then(|a| {
        let path = a.get("path").and_then(|p| p.as_str())?.to_string();
        let name = a
            .get("name")
            .and_then(|n| n.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| path.clone());
        Some(ArtifactDeclaration { name, path })
    });

    Ok(StepDefinition {
        id,
        name,
        action,
        continue_on_error,
        condition,
        env: parse_string_map(value.get("env")),
        timeout_minutes,
        failure_budget,
        artifact,
        working_directory: value
            .get("working-directory")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        shell: value.get("shell").and_then(|v| v.as_str()).map(str::to_string),
    })
}

fn parse_gate(job: &str, value: &Value) -> Result<GateSpec, DefinitionError> {
    let report = value
        .get("report")
        .and_then(|v| v.as_str())
        .ok_or(DefinitionError::InvalidField {
            job: job.to_string(),
            field: "gate.report",
            expected: "an artifact name",
        })?
        .to_string();

    let threshold = match value.get("threshold").and_then(|v| v.as_str()) {
        None => Severity::High,
        Some(raw) => raw
            .parse::<Severity>()
            .map_err(|_| DefinitionError::UnknownSeverity {
                job: job.to_string(),
                value: raw.to_string(),
            })?,
    };

    Ok(GateSpec { report, threshold })
}

/// Render a YAML scalar as a string. Unquoted `3.10` already arrived as the
/// float 3.1, so matrix values should be quoted in the workflow.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a YAML mapping into an ordered string map.
fn parse_string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(mapping) = value.and_then(|v| v.as_mapping()) {
        for (k, v) in mapping {
            if let (Some(key), Some(val)) = (scalar_to_string(k), scalar_to_string(v)) {
                if !key.is_empty() {
                    map.insert(key, val);
                }
            }
        }
    }
    map
}
