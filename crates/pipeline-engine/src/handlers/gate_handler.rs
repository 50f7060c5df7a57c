// GateHandler: evaluates a scan report artifact in-process.

use anyhow::Result;
use async_trait::async_trait;
use pipeline_common::TaskResult;
use std::path::Path;

use crate::execution_context::StepContext;
use crate::handlers::handler::{Handler, HandlerData};
use crate::security_gate::{GateVerdict, SecurityGate, Severity};

pub struct GateHandler;

impl GateHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GateHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for GateHandler {
    async fn run_async(&self, context: &mut StepContext, data: &HandlerData) -> Result<()> {
        let threshold: Severity = data.input("threshold").unwrap_or("HIGH").parse()?;

        let Some(report) = data.input("report") else {
            let artifact = data.input("artifact").unwrap_or("report");
            context.error(&format!(
                "Scan report '{artifact}' was not produced; the security gate cannot pass."
            ));
            context.complete(TaskResult::Failed, Some("Scan report missing"));
            return Ok(());
        };

        context.info(&format!("Evaluating '{report}' with threshold {threshold}"));

        match SecurityGate::evaluate_file(Path::new(report), threshold) {
            Ok(GateVerdict::Pass { below_threshold }) => {
                context.info(&format!(
                    "No findings at or above {threshold} ({below_threshold} below threshold)."
                ));
                context.complete(TaskResult::Succeeded, None);
            }
            Ok(GateVerdict::Fail { offending }) => {
                for finding in &offending {
                    context.error(&finding.to_string());
                }
                let message = format!("{} finding(s) at or above {threshold}", offending.len());
                context.error(&message);
                context.complete(TaskResult::Failed, Some(&message));
            }
            Err(err) => {
                context.error(&format!("{:#}", anyhow::Error::new(err)));
                context.complete(TaskResult::Failed, Some("Scan report unreadable"));
            }
        }
        Ok(())
    }
}
