// Matrix expansion: one job instance per cross-product combination of the
// job's matrix axes.

use pipeline_sdk::StringUtil;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::definition::{
    ArtifactDeclaration, FailurePolicy, JobDefinition, MatrixAxis, StepAction, StepDefinition,
};
use crate::expressions::substitute_matrix;

/// A concrete job to run: a template with one matrix combination applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInstance {
    /// Stable key, e.g. `test (3.10)`. Identical across expansions.
    pub key: String,
    pub template_id: String,
    pub display_name: String,
    /// `(axis, value)` pairs in axis declaration order.
    pub matrix: Vec<(String, String)>,
    pub env: BTreeMap<String, String>,
    pub failure_policy: FailurePolicy,
    pub steps: Vec<StepDefinition>,
}

impl JobInstance {
    /// File-system friendly name, used for artifact export directories.
    pub fn dir_name(&self) -> String {
        StringUtil::format_into_safe_filename(&self.key)
    }
}

/// Compact view of an instance for `plan` output and summaries.
#[derive(Debug, Clone, Serialize)]
pub struct InstancePlan {
    pub key: String,
    pub display_name: String,
    pub matrix: BTreeMap<String, String>,
    pub steps: Vec<String>,
}

impl From<&JobInstance> for InstancePlan {
    fn from(instance: &JobInstance) -> Self {
        Self {
            key: instance.key.clone(),
            display_name: instance.display_name.clone(),
            matrix: instance.matrix.iter().cloned().collect(),
            steps: instance.steps.iter().map(|s| s.name.clone()).collect(),
        }
    }
}

pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a job template. The first axis varies slowest; values keep
    /// their declaration order. A job without a matrix yields one instance.
    pub fn expand(job: &JobDefinition) -> Vec<JobInstance> {
        Self::combinations(&job.matrix)
            .into_iter()
            .map(|combination| Self::instantiate(job, combination))
            .collect()
    }

    /// Expand every job of a workflow, keeping job declaration order.
    pub fn expand_all<'a, I>(jobs: I) -> Vec<JobInstance>
    where
        I: IntoIterator<Item = &'a JobDefinition>,
    {
        jobs.into_iter().flat_map(Self::expand).collect()
    }

    fn combinations(axes: &[MatrixAxis]) -> Vec<Vec<(String, String)>> {
        let mut combinations: Vec<Vec<(String, String)>> = vec![Vec::new()];
        for axis in axes {
            let mut next = Vec::with_capacity(combinations.len() * axis.values.len());
            for prefix in &combinations {
                for value in &axis.values {
                    let mut combination = prefix.clone();
                    combination.push((axis.name.clone(), value.clone()));
                    next.push(combination);
                }
            }
            combinations = next;
        }
        combinations
    }

    fn instantiate(job: &JobDefinition, matrix: Vec<(String, String)>) -> JobInstance {
        let suffix = if matrix.is_empty() {
            String::new()
        } else {
            let values: Vec<&str> = matrix.iter().map(|(_, v)| v.as_str()).collect();
            format!(" ({})", values.join(", "))
        };

        let env = job
            .env
            .iter()
            .map(|(k, v)| (k.clone(), substitute_matrix(v, &matrix)))
            .collect();

        let steps = job
            .steps
            .iter()
            .map(|step| Self::instantiate_step(step, &matrix))
            .collect();

        JobInstance {
            key: format!("{}{}", job.id, suffix),
            template_id: job.id.clone(),
            display_name: format!("{}{}", substitute_matrix(&job.name, &matrix), suffix),
            env,
            failure_policy: job.failure_policy,
            steps,
            matrix,
        }
    }

    fn instantiate_step(step: &StepDefinition, matrix: &[(String, String)]) -> StepDefinition {
        let action = match &step.action {
            StepAction::Run { script } => StepAction::Run {
                script: substitute_matrix(script, matrix),
            },
            StepAction::Gate(gate) => StepAction::Gate(gate.clone()),
        };

        StepDefinition {
            name: substitute_matrix(&step.name, matrix),
            action,
            env: step
                .env
                .iter()
                .map(|(k, v)| (k.clone(), substitute_matrix(v, matrix)))
                .collect(),
            artifact: step.artifact.as_ref().map(|a| ArtifactDeclaration {
                name: a.name.clone(),
                path: substitute_matrix(&a.path, matrix),
            }),
            working_directory: step
                .working_directory
                .as_deref()
                .map(|w| substitute_matrix(w, matrix)),
            ..step.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;

    const TEST_JOB: &str = r#"
jobs:
  test:
    name: Test
    strategy:
      matrix:
        python-version: ["3.8", "3.9", "3.10", "3.11"]
    env:
      PYTHON: python${{ matrix.python-version }}
    steps:
      - name: Set up Python ${{ matrix.python-version }}
        run: python${{ matrix.python-version }} -m venv .venv
      - name: Upload
        run: codecov -t ${{ secrets.CODECOV_TOKEN }}
        artifact:
          name: coverage
          path: coverage-${{ matrix.python-version }}.xml
"#;

    fn test_job() -> JobDefinition {
        WorkflowDefinition::parse_yaml(TEST_JOB).unwrap().jobs.remove(0)
    }

    #[test]
    fn one_instance_per_interpreter_version_in_order() {
        let instances = MatrixExpander::expand(&test_job());
        let versions: Vec<&str> = instances
            .iter()
            .map(|i| {
                assert_eq!(i.matrix[0].0, "python-version");
                i.matrix[0].1.as_str()
            })
            .collect();
        assert_eq!(versions, vec!["3.8", "3.9", "3.10", "3.11"]);
        assert_eq!(instances[2].key, "test (3.10)");
        assert_eq!(instances[2].display_name, "Test (3.10)");
        assert_eq!(instances[2].dir_name(), "test_3.10");
    }

    #[test]
    fn expansion_is_idempotent() {
        let job = test_job();
        assert_eq!(MatrixExpander::expand(&job), MatrixExpander::expand(&job));
    }

    #[test]
    fn matrix_values_are_substituted_but_secrets_are_not() {
        let instances = MatrixExpander::expand(&test_job());
        let first = &instances[0];
        assert_eq!(first.env.get("PYTHON").map(String::as_str), Some("python3.8"));
        assert_eq!(first.steps[0].name, "Set up Python 3.8");
        assert_eq!(
            first.steps[0].action,
            StepAction::Run {
                script: "python3.8 -m venv .venv".into()
            }
        );
        assert_eq!(
            first.steps[1].action,
            StepAction::Run {
                script: "codecov -t ${{ secrets.CODECOV_TOKEN }}".into()
            }
        );
        assert_eq!(
            first.steps[1].artifact.as_ref().unwrap().path,
            "coverage-3.8.xml"
        );
    }

    #[test]
    fn cross_product_first_axis_varies_slowest() {
        let yaml = r#"
jobs:
  build:
    strategy:
      matrix:
        os: [linux, mac]
        py: ["3.8", "3.9"]
    steps:
      - run: "true"
"#;
        let job = WorkflowDefinition::parse_yaml(yaml).unwrap().jobs.remove(0);
        let keys: Vec<String> = MatrixExpander::expand(&job)
            .into_iter()
            .map(|i| i.key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "build (linux, 3.8)",
                "build (linux, 3.9)",
                "build (mac, 3.8)",
                "build (mac, 3.9)"
            ]
        );
    }

    #[test]
    fn job_without_matrix_yields_one_instance() {
        let yaml = "jobs:\n  database:\n    steps:\n      - run: sqlite3 test.db .databases\n";
        let wf = WorkflowDefinition::parse_yaml(yaml).unwrap();
        let instances = MatrixExpander::expand_all(&wf.jobs);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].key, "database");
        assert!(instances[0].matrix.is_empty());
        assert_eq!(InstancePlan::from(&instances[0]).steps.len(), 1);
    }
}
