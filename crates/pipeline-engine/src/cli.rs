// Command-line interface of the `pipeline` binary.

use clap::{Args, Parser, Subcommand};
use pipeline_common::constants::{
    exit_code, variables, DEFAULT_BRANCH, DEFAULT_EVENT, DEFAULT_PIPELINE_FILE,
};
use pipeline_common::settings::default_max_parallel;
use pipeline_common::{HostContext, LogFormat, PipelineSettings};
use pipeline_sdk::{IOUtil, StringUtil};
use std::path::PathBuf;

use crate::definition::WorkflowDefinition;
use crate::matrix::InstancePlan;
use crate::pipeline_runner::PipelineRunner;
use crate::security_gate::{GateVerdict, SecurityGate, Severity};

#[derive(Parser, Debug)]
#[command(name = "pipeline", version, about = "Run a CI pipeline definition locally")]
pub struct Cli {
    /// Diagnostic log format on stderr.
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Debug-level diagnostics.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the workflow's jobs.
    Run(RunArgs),
    /// Print the expanded job instances without running anything.
    Plan(PlanArgs),
    /// Evaluate a scan report against a severity threshold.
    Gate(GateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct WorkflowArgs {
    /// Workflow file, relative to the source directory.
    #[arg(short = 'f', long = "file", env = variables::PIPELINE_FILE, default_value = DEFAULT_PIPELINE_FILE)]
    pub file: PathBuf,

    /// Project directory the jobs work on.
    #[arg(long, default_value = ".")]
    pub source: PathBuf,

    /// Only these job ids (repeatable).
    #[arg(long = "job")]
    pub jobs: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub workflow: WorkflowArgs,

    #[arg(long, env = variables::PIPELINE_EVENT, default_value = DEFAULT_EVENT)]
    pub event: String,

    #[arg(long, env = variables::PIPELINE_BRANCH, default_value = DEFAULT_BRANCH)]
    pub branch: String,

    #[arg(long, env = variables::PIPELINE_MAX_PARALLEL)]
    pub max_parallel: Option<usize>,

    /// Export declared report artifacts here, one directory per job instance.
    #[arg(long, env = variables::PIPELINE_ARTIFACTS_DIR)]
    pub artifacts_dir: Option<PathBuf>,

    /// Write the run summary as JSON.
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Run jobs directly in the source directory instead of a snapshot.
    #[arg(long)]
    pub in_place: bool,

    /// Override the workflow's default shell.
    #[arg(long, env = variables::PIPELINE_SHELL)]
    pub shell: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[command(flatten)]
    pub workflow: WorkflowArgs,

    /// Print the plan as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct GateArgs {
    /// Scanner report (bandit JSON).
    pub report: PathBuf,

    #[arg(long, default_value = "HIGH")]
    pub threshold: Severity,
}

impl RunArgs {
    pub fn to_settings(&self) -> PipelineSettings {
        let in_place = self.in_place
            || std::env::var(variables::PIPELINE_IN_PLACE)
                .ok()
                .and_then(|v| StringUtil::convert_to_bool(&v))
                .unwrap_or(false);

        PipelineSettings {
            in_place,
            event: self.event.clone(),
            branch: self.branch.clone(),
            max_parallel: self.max_parallel.unwrap_or_else(default_max_parallel),
            artifacts_dir: self.artifacts_dir.clone(),
            summary_path: self.summary.clone(),
            shell: self.shell.clone(),
            ..self.workflow.to_settings()
        }
    }
}

impl WorkflowArgs {
    /// Settings for commands that only read the workflow.
    pub fn to_settings(&self) -> PipelineSettings {
        PipelineSettings {
            workflow_file: self.file.clone(),
            source_dir: self.source.clone(),
            job_filter: self.jobs.clone(),
            ..PipelineSettings::default()
        }
    }
}

/// Dispatch a parsed command line; returns the process exit code.
pub async fn execute(cli: Cli) -> i32 {
    match cli.command {
        Command::Run(args) => run_command(&args).await,
        Command::Plan(args) => plan_command(&args),
        Command::Gate(args) => gate_command(&args),
    }
}

async fn run_command(args: &RunArgs) -> i32 {
    let settings = args.to_settings();
    if let Err(e) = settings.validate() {
        tracing::error!("{}", e);
        return exit_code::CONFIGURATION_ERROR;
    }

    let Some(workflow) = load_workflow(&settings) else {
        return exit_code::CONFIGURATION_ERROR;
    };

    let host_context = HostContext::new();
    if let Err(e) = host_context.install_interrupt_handler() {
        tracing::warn!("{:#}", e);
    }

    let summary_path = settings.summary_path.clone();
    let runner = PipelineRunner::new(host_context, settings, workflow);
    let summary = match runner.run_async().await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!("{:#}", e);
            return exit_code::CONFIGURATION_ERROR;
        }
    };

    print!("{}", summary.render());

    if let Some(path) = summary_path {
        if let Err(e) = IOUtil::save_object(&path, &summary) {
            tracing::error!("Failed to write run summary: {:#}", e);
        }
    }

    summary.exit_code()
}

fn load_workflow(settings: &PipelineSettings) -> Option<WorkflowDefinition> {
    match WorkflowDefinition::load(&settings.resolved_workflow_file()) {
        Ok(workflow) => Some(workflow),
        Err(e) => {
            tracing::error!("{:#}", anyhow::Error::new(e));
            None
        }
    }
}

fn plan_command(args: &PlanArgs) -> i32 {
    let settings = args.workflow.to_settings();
    let Some(workflow) = load_workflow(&settings) else {
        return exit_code::CONFIGURATION_ERROR;
    };
    let name = workflow.name.clone();

    let runner = PipelineRunner::new(HostContext::new(), settings, workflow);
    let plan: Vec<InstancePlan> = match runner.plan() {
        Ok(instances) => instances.iter().map(InstancePlan::from).collect(),
        Err(e) => {
            tracing::error!("{:#}", e);
            return exit_code::CONFIGURATION_ERROR;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&plan) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                tracing::error!("Failed to serialize plan: {}", e);
                return exit_code::FAILURE;
            }
        }
    } else {
        println!("{}: {} job instance(s)", name, plan.len());
        for instance in &plan {
            println!("  {}", instance.display_name);
            for step in &instance.steps {
                println!("    - {step}");
            }
        }
    }
    exit_code::SUCCESS
}

fn gate_command(args: &GateArgs) -> i32 {
    match SecurityGate::evaluate_file(&args.report, args.threshold) {
        Ok(GateVerdict::Pass { below_threshold }) => {
            println!(
                "PASS: no findings at or above {} ({} below threshold)",
                args.threshold, below_threshold
            );
            exit_code::SUCCESS
        }
        Ok(GateVerdict::Fail { offending }) => {
            println!(
                "FAIL: {} finding(s) at or above {}",
                offending.len(),
                args.threshold
            );
            for finding in &offending {
                println!("  {finding}");
            }
            exit_code::FAILURE
        }
        Err(e) => {
            tracing::error!("{:#}", anyhow::Error::new(e));
            exit_code::CONFIGURATION_ERROR
        }
    }
}
