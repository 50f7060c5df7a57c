// pipeline-engine: Workflow loading, matrix expansion, job and step execution.
// Depends on `pipeline-sdk` and `pipeline-common`.
//
// Architecture:
//   cli::execute → PipelineRunner::run_async → (per instance) JobRunner::run_async
//     → StepsRunner::run → per-step Handler::run_async

pub mod artifacts;
pub mod cli;
pub mod definition;
pub mod environment;
pub mod execution_context;
pub mod expressions;
pub mod failure_budget;
pub mod handlers;
pub mod job_runner;
pub mod matrix;
pub mod pipeline_runner;
pub mod security_gate;
pub mod steps_runner;
pub mod triggers;

pub use definition::{DefinitionError, FailurePolicy, StepAction, WorkflowDefinition};
pub use failure_budget::{BudgetVerdict, FailureBudget};
pub use job_runner::{JobResult, JobState};
pub use matrix::{JobInstance, MatrixExpander};
pub use pipeline_runner::{PipelineRunner, PipelineSummary};
pub use security_gate::{GateVerdict, ScanReport, SecurityGate, Severity};
