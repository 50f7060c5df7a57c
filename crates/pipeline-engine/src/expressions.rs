// Workflow expressions: `${{ namespace.key }}` interpolation and the status
// functions allowed in a step's `if:` condition.

use once_cell::sync::Lazy;
use pipeline_common::TaskResult;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

static REFERENCE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z0-9_.\-]+)\s*\}\}")
        .expect("reference regex is valid")
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("unsupported condition '{0}' (expected success(), failure(), always() or cancelled())")]
    UnsupportedCondition(String),
}

/// Values visible to `${{ ... }}` references.
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    pub matrix: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
}

impl ExpressionContext {
    /// A context that only knows matrix values; used during expansion.
    pub fn for_matrix(matrix: &[(String, String)]) -> Self {
        Self {
            matrix: matrix.iter().cloned().collect(),
            ..Self::default()
        }
    }

    fn lookup(&self, namespace: &str, key: &str) -> Option<&str> {
        let map = match namespace {
            "matrix" => &self.matrix,
            "env" => &self.env,
            "secrets" => &self.secrets,
            _ => return None,
        };
        map.get(key).map(String::as_str)
    }
}

/// Replace every `${{ ns.key }}` in `text`. Unknown references become the
/// empty string, as on hosted runners.
pub fn interpolate(text: &str, context: &ExpressionContext) -> String {
    if !text.contains("${{") {
        return text.to_string();
    }
    REFERENCE_REGEX
        .replace_all(text, |caps: &Captures| {
            context.lookup(&caps[1], &caps[2]).unwrap_or("").to_string()
        })
        .into_owned()
}

/// Replace only `${{ matrix.* }}` references, leaving `env`/`secrets`
/// references for job start. Keeps matrix expansion free of secrets.
pub fn substitute_matrix(text: &str, matrix: &[(String, String)]) -> String {
    if matrix.is_empty() || !text.contains("${{") {
        return text.to_string();
    }
    REFERENCE_REGEX
        .replace_all(text, |caps: &Captures| {
            if &caps[1] != "matrix" {
                return caps[0].to_string();
            }
            matrix
                .iter()
                .find(|(axis, _)| axis == &caps[2])
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Names of secrets referenced in `text`.
pub fn referenced_secrets(text: &str) -> Vec<String> {
    REFERENCE_REGEX
        .captures_iter(text)
        .filter(|caps| &caps[1] == "secrets")
        .map(|caps| caps[2].to_string())
        .collect()
}

/// A parsed `if:` condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Success,
    Failure,
    Always,
    Cancelled,
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    /// Parse a condition. Empty means `success()`. Supports an optional
    /// `${{ }}` wrapper, `!`, and flat `&&` / `||` (`&&` binds tighter).
    pub fn parse(raw: &str) -> Result<Self, ExpressionError> {
        let mut expr = raw.trim();
        if expr.starts_with("${{") && expr.ends_with("}}") {
            expr = expr[3..expr.len() - 2].trim();
        }
        if expr.is_empty() {
            return Ok(Condition::Success);
        }

        let alternatives: Vec<&str> = expr.split("||").collect();
        if alternatives.len() > 1 {
            return alternatives
                .into_iter()
                .map(Self::parse)
                .collect::<Result<Vec<_>, _>>()
                .map(Condition::Or);
        }

        let conjuncts: Vec<&str> = expr.split("&&").collect();
        if conjuncts.len() > 1 {
            return conjuncts
                .into_iter()
                .map(Self::parse)
                .collect::<Result<Vec<_>, _>>()
                .map(Condition::And);
        }

        if let Some(rest) = expr.strip_prefix('!') {
            return Ok(Condition::Not(Box::new(Self::parse(rest)?)));
        }

        match expr.to_lowercase().as_str() {
            "success()" => Ok(Condition::Success),
            "failure()" => Ok(Condition::Failure),
            "always()" => Ok(Condition::Always),
            "cancelled()" => Ok(Condition::Cancelled),
            _ => Err(ExpressionError::UnsupportedCondition(raw.trim().to_string())),
        }
    }

    /// Evaluate against the job's result so far.
    pub fn evaluate(&self, job_status: Option<TaskResult>, is_cancelled: bool) -> bool {
        match self {
            Condition::Always => true,
            Condition::Cancelled => is_cancelled,
            Condition::Success => {
                !is_cancelled
                    && matches!(
                        job_status,
                        None | Some(TaskResult::Succeeded)
                            | Some(TaskResult::SucceededWithIssues)
                            | Some(TaskResult::Skipped)
                    )
            }
            Condition::Failure => matches!(job_status, Some(TaskResult::Failed)),
            Condition::Not(inner) => !inner.evaluate(job_status, is_cancelled),
            Condition::And(parts) => parts.iter().all(|c| c.evaluate(job_status, is_cancelled)),
            Condition::Or(parts) => parts.iter().any(|c| c.evaluate(job_status, is_cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExpressionContext {
        let mut ctx = ExpressionContext::for_matrix(&[("python-version".into(), "3.10".into())]);
        ctx.env.insert("DATABASE_URL".into(), "sqlite:///test.db".into());
        ctx.secrets.insert("CODECOV_TOKEN".into(), "tok-123".into());
        ctx
    }

    #[test]
    fn interpolate_known_references() {
        let ctx = context();
        assert_eq!(
            interpolate("python${{ matrix.python-version }} -m venv .venv", &ctx),
            "python3.10 -m venv .venv"
        );
        assert_eq!(interpolate("${{secrets.CODECOV_TOKEN}}", &ctx), "tok-123");
        assert_eq!(interpolate("url=${{ env.DATABASE_URL }}", &ctx), "url=sqlite:///test.db");
    }

    #[test]
    fn interpolate_unknown_is_empty() {
        let ctx = context();
        assert_eq!(interpolate("[${{ secrets.MISSING }}]", &ctx), "[]");
        assert_eq!(interpolate("[${{ github.sha }}]", &ctx), "[]");
        assert_eq!(interpolate("plain text", &ctx), "plain text");
    }

    #[test]
    fn substitute_matrix_leaves_other_namespaces() {
        let matrix = vec![("python-version".to_string(), "3.8".to_string())];
        assert_eq!(
            substitute_matrix("${{ matrix.python-version }} ${{ secrets.TOKEN }}", &matrix),
            "3.8 ${{ secrets.TOKEN }}"
        );
    }

    #[test]
    fn referenced_secrets_lists_names() {
        let names = referenced_secrets("a=${{ secrets.A }} b=${{ env.B }} c=${{ secrets.C_D }}");
        assert_eq!(names, vec!["A".to_string(), "C_D".to_string()]);
    }

    #[test]
    fn parse_status_functions() {
        assert_eq!(Condition::parse("").unwrap(), Condition::Success);
        assert_eq!(Condition::parse("always()").unwrap(), Condition::Always);
        assert_eq!(Condition::parse("${{ failure() }}").unwrap(), Condition::Failure);
        assert_eq!(
            Condition::parse("!cancelled()").unwrap(),
            Condition::Not(Box::new(Condition::Cancelled))
        );
        assert!(matches!(
            Condition::parse("github.ref == 'main'"),
            Err(ExpressionError::UnsupportedCondition(_))
        ));
    }

    #[test]
    fn evaluate_against_job_status() {
        let success = Condition::Success;
        assert!(success.evaluate(None, false));
        assert!(success.evaluate(Some(TaskResult::SucceededWithIssues), false));
        assert!(!success.evaluate(Some(TaskResult::Failed), false));
        assert!(!success.evaluate(None, true));

        assert!(Condition::Failure.evaluate(Some(TaskResult::Failed), false));
        assert!(!Condition::Failure.evaluate(Some(TaskResult::Succeeded), false));
        assert!(Condition::Always.evaluate(Some(TaskResult::Failed), false));
        assert!(Condition::Always.evaluate(None, true));

        let compound = Condition::parse("failure() || cancelled()").unwrap();
        assert!(compound.evaluate(None, true));
        assert!(!compound.evaluate(Some(TaskResult::Succeeded), false));

        let both = Condition::parse("always() && !cancelled()").unwrap();
        assert!(both.evaluate(Some(TaskResult::Failed), false));
        assert!(!both.evaluate(Some(TaskResult::Failed), true));
    }
}
