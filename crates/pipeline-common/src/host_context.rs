// HostContext: process-wide services shared by every job instance.
// Owns the secret masker, the trace manager and the shutdown token.

use crate::constants::variables;
use crate::secret_masker::SecretMasker;
use crate::trace_manager::{TraceManager, TraceSetting, Tracing};

use parking_lot::Mutex;
use pipeline_sdk::{StringUtil, TraceWriter};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why the runner is shutting down early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    UserCancelled,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
        }
    }
}

pub struct HostContext {
    /// Secret masker shared across the entire process.
    pub secret_masker: Arc<SecretMasker>,

    trace_manager: TraceManager,

    /// Cancelled on Ctrl-C / SIGTERM; every job token is a child of it.
    shutdown_token: CancellationToken,

    shutdown_reason: Mutex<Option<ShutdownReason>>,
}

impl HostContext {
    pub fn new() -> Arc<Self> {
        let secret_masker = Arc::new(SecretMasker::new());

        let print_to_stdout = std::env::var(variables::PIPELINE_PRINT_TRACE)
            .ok()
            .and_then(|v| StringUtil::convert_to_bool(&v))
            .unwrap_or(false);

        let trace_setting = TraceSetting {
            print_to_stdout,
            ..TraceSetting::default()
        };

        Arc::new(Self {
            trace_manager: TraceManager::new(Arc::clone(&secret_masker), trace_setting),
            secret_masker,
            shutdown_token: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
        })
    }

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    /// The root cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown_reason.lock()
    }

    /// Cancel every running job. Only the first reason is kept.
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut current = self.shutdown_reason.lock();
            if current.is_some() {
                return;
            }
            *current = Some(reason);
        }
        self.get_trace("HostContext")
            .warning(&format!("Pipeline will be shut down for {}", reason));
        self.shutdown_token.cancel();
    }

    /// Route Ctrl-C / SIGTERM into [`HostContext::shutdown`].
    pub fn install_interrupt_handler(self: &Arc<Self>) -> anyhow::Result<()> {
        let host = Arc::clone(self);
        ctrlc::set_handler(move || host.shutdown(ShutdownReason::UserCancelled))
            .map_err(|e| anyhow::anyhow!("Failed to install interrupt handler: {e}"))
    }
}
