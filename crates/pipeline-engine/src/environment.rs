// Secret and environment plumbing. Secrets are read once from the invoking
// process and handed to each job as part of an immutable `JobEnvironment`.

use pipeline_common::constants::variables;
use pipeline_common::SecretMasker;
use pipeline_sdk::TraceWriter;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use crate::definition::StepDefinition;
use crate::expressions::{interpolate, ExpressionContext};
use crate::matrix::JobInstance;

/// Declared secrets resolved from the environment.
#[derive(Clone, Default)]
pub struct SecretStore {
    values: BTreeMap<String, String>,
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretStore {
    /// Read each declared name from the process environment.
    pub fn from_env(names: &[String], masker: &SecretMasker, trace: &dyn TraceWriter) -> Self {
        Self::from_lookup(names, |name| std::env::var(name).ok(), masker, trace)
    }

    /// Resolve each name through `lookup`. Missing names become empty with a
    /// warning; every value is registered with the masker.
    pub fn from_lookup<F>(
        names: &[String],
        lookup: F,
        masker: &SecretMasker,
        trace: &dyn TraceWriter,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = BTreeMap::new();
        for name in names {
            let value = match lookup(name) {
                Some(v) if !v.is_empty() => {
                    masker.add_value(&v);
                    v
                }
                _ => {
                    trace.warning(&format!(
                        "Secret '{name}' is not set; it resolves to an empty string."
                    ));
                    String::new()
                }
            };
            values.insert(name.clone(), value);
        }
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// The environment a job instance runs with. Built once per instance and
/// never mutated afterwards.
#[derive(Debug, Clone)]
pub struct JobEnvironment {
    variables: BTreeMap<String, String>,
    context: ExpressionContext,
    /// Declared secret names; withheld from the inherited process
    /// environment of every step.
    secret_names: Vec<String>,
}

impl JobEnvironment {
    /// Layer workflow env, then job env, then the runner's own variables.
    /// Values may reference `${{ secrets.X }}`, `${{ env.X }}` and
    /// `${{ matrix.X }}`.
    pub fn new(
        workflow_env: &BTreeMap<String, String>,
        instance: &JobInstance,
        secrets: &SecretStore,
        workspace: &Path,
    ) -> Self {
        let mut context = ExpressionContext::for_matrix(&instance.matrix);
        context.secrets = secrets.values.clone();

        for layer in [workflow_env, &instance.env] {
            for (key, value) in layer {
                let resolved = interpolate(value, &context);
                context.env.insert(key.clone(), resolved);
            }
        }

        context
            .env
            .insert(variables::PIPELINE_JOB.to_string(), instance.key.clone());
        context.env.insert(
            variables::PIPELINE_WORKSPACE.to_string(),
            workspace.display().to_string(),
        );

        Self {
            variables: context.env.clone(),
            context,
            secret_names: secrets.names().map(str::to_string).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn secret_names(&self) -> &[String] {
        &self.secret_names
    }

    /// Expand `${{ }}` references in a script or path.
    pub fn interpolate(&self, text: &str) -> String {
        interpolate(text, &self.context)
    }

    /// Job variables plus the step's own env, for the child process.
    pub fn for_step(&self, step: &StepDefinition) -> HashMap<String, String> {
        let mut context = self.context.clone();
        for (key, value) in &step.env {
            let resolved = interpolate(value, &context);
            context.env.insert(key.clone(), resolved);
        }
        context.env.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use crate::matrix::MatrixExpander;
    use pipeline_sdk::trace::{CollectingTraceWriter, TraceLevel};

    const WORKFLOW: &str = r#"
secrets: [CODECOV_TOKEN, DATABASE_URL, AUTH0_DOMAIN]
env:
  AUTH0_DOMAIN: ${{ secrets.AUTH0_DOMAIN }}
  APP_ENV: ci
jobs:
  test:
    strategy:
      matrix:
        python-version: ["3.11"]
    env:
      PYTHON: python${{ matrix.python-version }}
      APP_ENV: test
      LABEL: ${{ env.APP_ENV }}-${{ matrix.python-version }}
    steps:
      - run: codecov
        env:
          CODECOV_TOKEN: ${{ secrets.CODECOV_TOKEN }}
          APP_ENV: upload
"#;

    fn secrets(masker: &SecretMasker, trace: &CollectingTraceWriter) -> SecretStore {
        let names: Vec<String> = ["CODECOV_TOKEN", "DATABASE_URL", "AUTH0_DOMAIN"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        SecretStore::from_lookup(
            &names,
            |name| match name {
                "CODECOV_TOKEN" => Some("codecov-abc123".into()),
                "AUTH0_DOMAIN" => Some("tenant.auth0.example".into()),
                _ => None,
            },
            masker,
            trace,
        )
    }

    #[test]
    fn missing_secrets_are_empty_and_warned() {
        let masker = SecretMasker::new();
        let trace = CollectingTraceWriter::new();
        let store = secrets(&masker, &trace);

        assert_eq!(
            store.names().collect::<Vec<_>>(),
            vec!["AUTH0_DOMAIN", "CODECOV_TOKEN", "DATABASE_URL"]
        );
        assert_eq!(store.get("DATABASE_URL"), Some(""));
        assert_eq!(store.get("CODECOV_TOKEN"), Some("codecov-abc123"));
        let warnings = trace.messages_at(TraceLevel::Warning);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("DATABASE_URL"));
        assert_eq!(masker.mask_secrets("token=codecov-abc123"), "token=***");
        assert!(!format!("{store:?}").contains("codecov-abc123"));
    }

    #[test]
    fn layers_merge_in_order() {
        let masker = SecretMasker::new();
        let trace = CollectingTraceWriter::new();
        let store = secrets(&masker, &trace);
        let wf = WorkflowDefinition::parse_yaml(WORKFLOW).unwrap();
        let instance = MatrixExpander::expand(&wf.jobs[0]).remove(0);

        let env = JobEnvironment::new(&wf.env, &instance, &store, Path::new("/work/test"));
        assert_eq!(env.get("AUTH0_DOMAIN"), Some("tenant.auth0.example"));
        assert_eq!(env.get("APP_ENV"), Some("test"));
        assert_eq!(env.get("PYTHON"), Some("python3.11"));
        assert_eq!(env.get(variables::PIPELINE_JOB), Some("test (3.11)"));
        assert_eq!(env.get(variables::PIPELINE_WORKSPACE), Some("/work/test"));
        // Secrets only reach steps through explicit references.
        assert_eq!(env.get("CODECOV_TOKEN"), None);
        assert_eq!(env.secret_names().len(), 3);

        let step_env = env.for_step(&instance.steps[0]);
        assert_eq!(step_env.get("CODECOV_TOKEN").map(String::as_str), Some("codecov-abc123"));
        assert_eq!(step_env.get("APP_ENV").map(String::as_str), Some("upload"));
        assert_eq!(env.get("APP_ENV"), Some("test"));
    }

    #[test]
    fn interpolate_scripts_with_job_context() {
        let masker = SecretMasker::new();
        let trace = CollectingTraceWriter::new();
        let store = secrets(&masker, &trace);
        let wf = WorkflowDefinition::parse_yaml(WORKFLOW).unwrap();
        let instance = MatrixExpander::expand(&wf.jobs[0]).remove(0);
        let env = JobEnvironment::new(&wf.env, &instance, &store, Path::new("/w"));

        assert_eq!(
            env.interpolate("${{ env.PYTHON }} -m pytest && codecov -t ${{ secrets.CODECOV_TOKEN }}"),
            "python3.11 -m pytest && codecov -t codecov-abc123"
        );
    }
}
