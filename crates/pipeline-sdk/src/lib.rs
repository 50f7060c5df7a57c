// pipeline-sdk: Foundation layer for the pipeline runner.
// This crate has no dependencies on other pipeline crates and provides
// process invocation, trace abstractions and file system helpers.

pub mod io_util;
pub mod process_invoker;
pub mod string_util;
pub mod trace;

// Re-export commonly used items at crate root
pub use io_util::IOUtil;
pub use process_invoker::{
    OutputStream, ProcessCancelledError, ProcessInvoker, ProcessOutputLine,
    ProcessSpec,
};
pub use string_util::StringUtil;
pub use trace::{TraceLevel, TraceWriter};
