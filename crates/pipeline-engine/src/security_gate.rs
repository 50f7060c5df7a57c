// Security gate: apply a severity threshold to a static-analysis report.
//
// The scan step itself is tolerant; whether the job passes is decided here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Finding severity, ordered `Undefined < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Severity {
    Undefined,
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Undefined => "UNDEFINED",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNDEFINED" => Ok(Severity::Undefined),
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            _ => Err(GateError::UnknownSeverity(s.to_string())),
        }
    }
}

impl TryFrom<String> for Severity {
    type Error = GateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Severity> for String {
    fn from(value: Severity) -> Self {
        value.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("unknown severity '{0}' (expected LOW, MEDIUM or HIGH)")]
    UnknownSeverity(String),

    #[error("failed to read scan report '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("scan report is not valid JSON")]
    Parse(#[from] serde_json::Error),
}

/// One finding in a scanner report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub test_id: String,
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub line_number: u64,
    pub issue_severity: Severity,
    #[serde(default = "undefined")]
    pub issue_confidence: Severity,
    #[serde(default)]
    pub issue_text: String,
}

fn undefined() -> Severity {
    Severity::Undefined
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {}:{} {} ({})",
            self.issue_severity,
            self.issue_confidence,
            self.filename,
            self.line_number,
            self.test_id,
            self.issue_text
        )
    }
}

/// A scanner's structured report (bandit's JSON layout).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(default)]
    pub results: Vec<Finding>,
    /// Files the scanner could not process. Reported, never fatal.
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

impl ScanReport {
    pub fn from_json(content: &str) -> Result<Self, GateError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, GateError> {
        let content = std::fs::read_to_string(path).map_err(|source| GateError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass {
        /// Findings below the threshold.
        below_threshold: usize,
    },
    Fail {
        offending: Vec<Finding>,
    },
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, GateVerdict::Pass { .. })
    }
}

pub struct SecurityGate;

impl SecurityGate {
    /// Fail when any finding is at or above `threshold`.
    pub fn evaluate(report: &ScanReport, threshold: Severity) -> GateVerdict {
        let offending: Vec<Finding> = report
            .results
            .iter()
            .filter(|f| f.issue_severity >= threshold)
            .cloned()
            .collect();

        if offending.is_empty() {
            GateVerdict::Pass {
                below_threshold: report.results.len(),
            }
        } else {
            GateVerdict::Fail { offending }
        }
    }

    /// Load the report at `path` and evaluate it.
    pub fn evaluate_file(path: &Path, threshold: Severity) -> Result<GateVerdict, GateError> {
        let report = ScanReport::load(path)?;
        Ok(Self::evaluate(&report, threshold))
    }
}
