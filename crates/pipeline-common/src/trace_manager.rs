// Named trace sources. Every message passes through the process-wide
// SecretMasker before it reaches `tracing` (or stdout).

use crate::secret_masker::SecretMasker;
use pipeline_sdk::{TraceLevel, TraceWriter};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TraceSetting {
    /// Messages below this level are dropped.
    pub min_level: TraceLevel,
    /// Echo masked messages to stdout as well.
    pub print_to_stdout: bool,
}

impl Default for TraceSetting {
    fn default() -> Self {
        Self {
            min_level: TraceLevel::Verbose,
            print_to_stdout: false,
        }
    }
}

#[derive(Clone)]
pub struct Tracing {
    name: String,
    secret_masker: Arc<SecretMasker>,
    setting: TraceSetting,
}

impl Tracing {
    pub fn new(name: impl Into<String>, secret_masker: Arc<SecretMasker>, setting: TraceSetting) -> Self {
        Self {
            name: name.into(),
            secret_masker,
            setting,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn emit(&self, level: TraceLevel, message: &str) {
        if level < self.setting.min_level {
            return;
        }
        let message = self.secret_masker.mask_secrets(message);
        let component = self.name.as_str();
        match level {
            TraceLevel::Verbose => tracing::debug!(component, "{message}"),
            TraceLevel::Info => tracing::info!(component, "{message}"),
            TraceLevel::Warning => tracing::warn!(component, "{message}"),
            TraceLevel::Error => tracing::error!(component, "{message}"),
        }
        if self.setting.print_to_stdout {
            println!("[{component}] {}: {message}", level.label());
        }
    }

    /// Pretty-printed JSON of `item` at verbose level.
    pub fn verbose_object<T: serde::Serialize>(&self, item: &T) {
        if TraceLevel::Verbose < self.setting.min_level {
            return;
        }
        match serde_json::to_string_pretty(item) {
            Ok(json) => self.verbose(&json),
            Err(e) => self.verbose(&format!("<unserializable: {e}>")),
        }
    }

    /// One error line for `err`, then one per cause.
    pub fn error_chain(&self, err: &anyhow::Error) {
        let mut chain = err.chain();
        if let Some(head) = chain.next() {
            self.error(&head.to_string());
        }
        for cause in chain {
            self.error(&format!("  caused by: {cause}"));
        }
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.emit(TraceLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.emit(TraceLevel::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.emit(TraceLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.emit(TraceLevel::Error, message);
    }
}

/// Builds `Tracing` sources that share one masker and setting.
pub struct TraceManager {
    secret_masker: Arc<SecretMasker>,
    setting: TraceSetting,
}

impl TraceManager {
    pub fn new(secret_masker: Arc<SecretMasker>, setting: TraceSetting) -> Self {
        Self {
            secret_masker,
            setting,
        }
    }

    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, Arc::clone(&self.secret_masker), self.setting.clone())
    }
}
