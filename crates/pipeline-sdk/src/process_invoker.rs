use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The duration to wait after sending SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// The duration to wait after sending SIGTERM before escalating to SIGKILL.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Returned when the cancellation token fired while the process was running.
#[derive(Debug, thiserror::Error)]
#[error("Process '{program}' was cancelled (exit code {exit_code}).")]
pub struct ProcessCancelledError {
    pub exit_code: i32,
    pub program: String,
}

/// Which pipe a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A single line read from the child's stdout or stderr.
#[derive(Debug, Clone)]
pub struct ProcessOutputLine {
    pub stream: OutputStream,
    pub data: String,
}

/// Everything needed to start one child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Directory the child starts in. Empty means the current directory.
    pub working_directory: PathBuf,
    pub program: String,
    pub arguments: Vec<String>,
    /// Overrides layered on top of the inherited process environment.
    pub environment: HashMap<String, String>,
    /// Inherited variables the child must not see. A name also present in
    /// `environment` keeps its override.
    pub removed_environment: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &HashMap<String, String>) -> Self {
        for (k, v) in vars {
            self.environment.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn env_remove<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.removed_environment
            .extend(names.into_iter().map(Into::into));
        self
    }

    fn display_arguments(&self) -> String {
        self.arguments.join(" ")
    }
}

/// Spawns a child process, streams stdout/stderr line by line through a
/// channel, and tears the child down gracefully (SIGINT → SIGTERM → SIGKILL)
/// when cancelled.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    output_tx: mpsc::UnboundedSender<ProcessOutputLine>,
    output_rx: Option<mpsc::UnboundedReceiver<ProcessOutputLine>>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            output_tx,
            output_rx: Some(output_rx),
        }
    }

    /// Take the output receiver. Can only be called once; subsequent calls return `None`.
    ///
    /// The channel closes once the invoker is dropped and both pipe readers finish.
    pub fn take_output_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessOutputLine>> {
        self.output_rx.take()
    }

    /// Run the process described by `spec` to completion and return its exit
    /// code, zero or not. A fired `cancellation_token` yields a
    /// [`ProcessCancelledError`].
    pub async fn execute(
        &self,
        spec: &ProcessSpec,
        kill_process_on_cancel: bool,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        anyhow::ensure!(!spec.program.is_empty(), "program must not be empty");

        let arguments = spec.display_arguments();
        self.trace.verbose("Starting process:");
        self.trace.verbose(&format!("  File name: '{}'", spec.program));
        self.trace.verbose(&format!("  Arguments: '{arguments}'"));
        self.trace.verbose(&format!(
            "  Working directory: '{}'",
            spec.working_directory.display()
        ));

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.arguments);

        if spec.working_directory.is_dir() {
            cmd.current_dir(&spec.working_directory);
        }

        for name in &spec.removed_environment {
            if !spec.environment.contains_key(name) {
                cmd.env_remove(name);
            }
        }
        for (key, value) in &spec.environment {
            cmd.env(key, value);
        }

        if !spec.environment.contains_key("CI") {
            cmd.env("CI", "true");
        }

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        // Own process group, so signals reach the whole script tree and a
        // grandchild cannot keep the output pipes open after cancellation.
        #[cfg(unix)]
        cmd.process_group(0);

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to start process '{}' with arguments '{arguments}'",
                spec.program
            )
        })?;

        let pid = child.id().unwrap_or(0);
        self.trace
            .verbose(&format!("Process started with process id {pid}, waiting for process exit."));

        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| self.spawn_reader(pipe, OutputStream::Stdout));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| self.spawn_reader(pipe, OutputStream::Stderr));

        let (exit_code, was_cancelled) = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for process")?;
                (status.code().unwrap_or(-1), false)
            }
            _ = cancellation_token.cancelled() => {
                self.trace.info("Cancellation requested.");
                (self.cancel_and_kill_process(&mut child, kill_process_on_cancel).await, true)
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        self.trace.verbose(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {:.2?}.",
            start.elapsed()
        ));

        if was_cancelled {
            return Err(ProcessCancelledError {
                exit_code,
                program: spec.program.clone(),
            }
            .into());
        }

        Ok(exit_code)
    }

    fn spawn_reader<R>(&self, pipe: R, stream: OutputStream) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.output_tx.clone();
        let trace = self.trace.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(ProcessOutputLine { stream, data: line });
            }
            trace.verbose(&format!("{stream:?} stream read finished."));
        })
    }

    /// Attempt graceful cancellation: SIGINT → SIGTERM → SIGKILL.
    /// If `kill_immediately` is true, skip signals and go straight to kill.
    async fn cancel_and_kill_process(
        &self,
        child: &mut tokio::process::Child,
        kill_immediately: bool,
    ) -> i32 {
        if !kill_immediately {
            if self.send_signal_and_wait(child, Signal::Int, SIGINT_TIMEOUT).await {
                self.trace.info("Process cancelled successfully through SIGINT.");
                return exit_code_of(child).await;
            }

            if self.send_signal_and_wait(child, Signal::Term, SIGTERM_TIMEOUT).await {
                self.trace.info("Process terminated successfully through SIGTERM.");
                return exit_code_of(child).await;
            }
        }

        self.trace
            .info("Killing process since both cancel and terminate signals have been ignored.");
        kill_process_group(child);
        let _ = child.kill().await;
        exit_code_of(child).await
    }

    /// Send a signal to the child process and wait up to `timeout` for it to exit.
    /// Returns `true` if the process exited within the timeout.
    #[cfg(unix)]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        signal: Signal,
        timeout: Duration,
    ) -> bool {
        let Some(pid) = child.id() else {
            // Already reaped.
            return true;
        };

        let sig = match signal {
            Signal::Int => nix::sys::signal::Signal::SIGINT,
            Signal::Term => nix::sys::signal::Signal::SIGTERM,
        };

        self.trace.info(&format!("Sending {sig:?} to process {pid}."));

        let pid = match i32::try_from(pid) {
            Ok(pid) => nix::unistd::Pid::from_raw(pid),
            Err(_) => return false,
        };
        if nix::sys::signal::killpg(pid, sig).is_err() && nix::sys::signal::kill(pid, sig).is_err() {
            self.trace
                .info(&format!("{sig:?} signal failed to send to process {pid}."));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        _signal: Signal,
        timeout: Duration,
    ) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

/// SIGKILL the child's process group; the child itself is killed separately.
#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &tokio::process::Child) {}

async fn exit_code_of(child: &mut tokio::process::Child) -> i32 {
    child
        .wait()
        .await
        .map(|s| s.code().unwrap_or(-1))
        .unwrap_or(-1)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}
