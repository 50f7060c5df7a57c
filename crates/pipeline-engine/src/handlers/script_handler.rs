// ScriptHandler: runs `run:` steps by writing the script to a temp file and
// invoking it through the configured shell.

use anyhow::{Context, Result};
use async_trait::async_trait;
use pipeline_common::constants::DEFAULT_SHELL;
use pipeline_common::TaskResult;
use pipeline_sdk::trace::TracingTraceWriter;
use pipeline_sdk::{ProcessInvoker, ProcessSpec};
use std::path::Path;
use std::sync::Arc;

use crate::execution_context::StepContext;
use crate::handlers::handler::{Handler, HandlerData};

pub struct ScriptHandler;

impl ScriptHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScriptHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for ScriptHandler {
    async fn run_async(&self, context: &mut StepContext, data: &HandlerData) -> Result<()> {
        let script = data.input("script").unwrap_or_default();
        if script.trim().is_empty() {
            context.debug("Script body is empty, skipping.");
            context.complete(TaskResult::Succeeded, None);
            return Ok(());
        }

        let shell = data.input("shell").unwrap_or(DEFAULT_SHELL);
        let (program, shell_args, extension) = ScriptHandlerHelpers::parse_shell_option_string(shell);

        std::fs::create_dir_all(&data.temp_directory).with_context(|| {
            format!(
                "Failed to create temp directory '{}'",
                data.temp_directory.display()
            )
        })?;
        let script_file = data.temp_directory.join(format!(
            "{}_{}.{}",
            context.step_id(),
            uuid::Uuid::new_v4().as_simple(),
            extension
        ));
        std::fs::write(&script_file, script)
            .with_context(|| format!("Failed to write script file '{}'", script_file.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&script_file, std::fs::Permissions::from_mode(0o755));
        }

        let arguments = ScriptHandlerHelpers::build_arguments(&shell_args, &script_file);
        context.info(&format!("{} {}", program, arguments.join(" ")));
        for line in script.lines() {
            context.debug(&format!("  {line}"));
        }

        let spec = ProcessSpec::new(program)
            .args(arguments)
            .current_dir(&data.working_directory)
            .envs(&data.environment)
            .env_remove(data.removed_environment.iter().cloned());

        let mut invoker = ProcessInvoker::new(Arc::new(TracingTraceWriter::new("ProcessInvoker")));
        let mut output = invoker
            .take_output_receiver()
            .context("Process output receiver already taken")?;
        let cancel = context.cancel_token();

        let process = tokio::spawn(async move { invoker.execute(&spec, false, cancel).await });

        while let Some(line) = output.recv().await {
            context.write(&line.data);
        }

        let result = process.await.context("Process task panicked")?;
        let _ = std::fs::remove_file(&script_file);
        let exit_code = result?;

        context.set_exit_code(exit_code);
        if exit_code == 0 {
            context.complete(TaskResult::Succeeded, None);
        } else {
            context.error(&format!("Process completed with exit code {exit_code}."));
            context.complete(
                TaskResult::Failed,
                Some(&format!("Exit code {exit_code}")),
            );
        }
        Ok(())
    }
}

pub struct ScriptHandlerHelpers;

impl ScriptHandlerHelpers {
    /// Parse a shell option into (program, arguments, script file extension).
    ///
    /// - `bash` → `bash --noprofile --norc -e -o pipefail {0}`
    /// - `sh` → `sh -e {0}`
    /// - `python` → `python3 {0}`
    /// - anything else is split on whitespace; `{0}` marks where the script
    ///   path goes, otherwise it is appended.
    pub fn parse_shell_option_string(shell: &str) -> (String, Vec<String>, String) {
        let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        match shell.trim().to_lowercase().as_str() {
            "bash" => (
                "bash".to_string(),
                owned(&["--noprofile", "--norc", "-e", "-o", "pipefail", "{0}"]),
                "sh".to_string(),
            ),
            "sh" => ("sh".to_string(), owned(&["-e", "{0}"]), "sh".to_string()),
            "python" => ("python3".to_string(), owned(&["{0}"]), "py".to_string()),
            _ => {
                let parts: Vec<&str> = shell.split_whitespace().collect();
                match parts.split_first() {
                    None => Self::parse_shell_option_string(DEFAULT_SHELL),
                    Some((program, rest)) => {
                        let extension = Self::get_script_file_extension(program);
                        (program.to_string(), owned(rest), extension)
                    }
                }
            }
        }
    }

    /// Substitute the script path for `{0}`, or append it.
    pub fn build_arguments(shell_args: &[String], script_file: &Path) -> Vec<String> {
        let path = script_file.display().to_string();
        if shell_args.iter().any(|a| a.contains("{0}")) {
            shell_args.iter().map(|a| a.replace("{0}", &path)).collect()
        } else {
            let mut args = shell_args.to_vec();
            args.push(path);
            args
        }
    }

    pub fn get_script_file_extension(shell: &str) -> String {
        let basename = Path::new(shell)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(shell);

        match basename.to_lowercase().as_str() {
            "python" | "python3" => "py".to_string(),
            "node" => "js".to_string(),
            _ => "sh".to_string(),
        }
    }
}
