// pipeline-common: Shared services and infrastructure for the pipeline runner.
// Depends on `pipeline-sdk`; consumed by `pipeline-engine`.

pub mod constants;
pub mod host_context;
pub mod logging;
pub mod secret_masker;
pub mod settings;
pub mod task_result;
pub mod trace_manager;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use host_context::{HostContext, ShutdownReason};
pub use logging::LogFormat;
pub use secret_masker::SecretMasker;
pub use settings::PipelineSettings;
pub use task_result::{TaskResult, TaskResultUtil};
pub use trace_manager::{TraceManager, TraceSetting, Tracing};
