// Well-known names and defaults shared across the runner.

/// Workflow file used when neither `--file` nor `PIPELINE_FILE` is given.
pub const DEFAULT_PIPELINE_FILE: &str = "ci/pipeline.yml";

/// Shell used for `run:` steps unless the workflow or settings override it.
pub const DEFAULT_SHELL: &str = "bash";

/// Event assumed when none is supplied on the command line.
pub const DEFAULT_EVENT: &str = "push";

/// Branch assumed when none is supplied on the command line.
pub const DEFAULT_BRANCH: &str = "main";

/// Lines matching this pattern are counted as individual test failures
/// (pytest's short test summary prints `FAILED path::test - reason`).
pub const DEFAULT_FAILURE_PATTERN: &str = r"^FAILED\b";

/// Output lines retained per step for diagnostics.
pub const MAX_DIAGNOSTIC_LINES: usize = 200;

/// Process exit codes reported by the `pipeline` binary.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const CONFIGURATION_ERROR: i32 = 2;
    pub const INTERRUPTED: i32 = 130;
}

/// Environment variables read by the runner itself.
pub mod variables {
    pub const PIPELINE_FILE: &str = "PIPELINE_FILE";
    pub const PIPELINE_EVENT: &str = "PIPELINE_EVENT";
    pub const PIPELINE_BRANCH: &str = "PIPELINE_BRANCH";
    pub const PIPELINE_MAX_PARALLEL: &str = "PIPELINE_MAX_PARALLEL";
    pub const PIPELINE_ARTIFACTS_DIR: &str = "PIPELINE_ARTIFACTS_DIR";
    pub const PIPELINE_SHELL: &str = "PIPELINE_SHELL";
    pub const PIPELINE_IN_PLACE: &str = "PIPELINE_IN_PLACE";
    pub const PIPELINE_LOG: &str = "PIPELINE_LOG";
    pub const PIPELINE_PRINT_TRACE: &str = "PIPELINE_PRINT_TRACE";

    /// Set for every step so scripts can tell which job instance they run in.
    pub const PIPELINE_JOB: &str = "PIPELINE_JOB";
    pub const PIPELINE_WORKSPACE: &str = "PIPELINE_WORKSPACE";
}
