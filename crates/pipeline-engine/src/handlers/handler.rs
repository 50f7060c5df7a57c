// Handler trait and HandlerFactory.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::definition::StepAction;
use crate::execution_context::StepContext;

/// Everything a handler needs besides the step context.
#[derive(Debug, Clone, Default)]
pub struct HandlerData {
    /// Handler inputs: `script`, `shell` for run steps; `report`,
    /// `threshold` for gate steps.
    pub inputs: HashMap<String, String>,

    /// Environment for the child process.
    pub environment: HashMap<String, String>,

    /// Inherited variables hidden from the child unless `environment` sets
    /// them (declared secret names).
    pub removed_environment: Vec<String>,

    pub working_directory: PathBuf,

    /// Scratch directory for generated script files.
    pub temp_directory: PathBuf,
}

impl HandlerData {
    pub fn input(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).map(String::as_str)
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the step. A failing step is reported through
    /// [`StepContext::complete`]; `Err` is reserved for infrastructure
    /// problems and cancellation.
    async fn run_async(&self, context: &mut StepContext, data: &HandlerData) -> anyhow::Result<()>;
}

pub struct HandlerFactory;

impl HandlerFactory {
    pub fn create(action: &StepAction) -> Box<dyn Handler> {
        match action {
            StepAction::Run { .. } => Box::new(super::script_handler::ScriptHandler::new()),
            StepAction::Gate(_) => Box::new(super::gate_handler::GateHandler::new()),
        }
    }
}
