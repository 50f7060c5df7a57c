// Thread-safe store of secret values, replaced with `***` in any text that
// leaves the runner (step output, diagnostics, trace lines).

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text used when a secret is found.
const MASK: &str = "***";

/// Values shorter than this are not masked; masking a one-character secret
/// would garble every line of output.
const MIN_SECRET_LENGTH: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    /// Registered values, longest first so that a secret containing another
    /// secret is masked as a whole.
    secrets: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret value. Multi-line values are also registered line by
    /// line, since output is captured one line at a time.
    pub fn add_value(&self, secret: &str) {
        let mut candidates = vec![secret.trim()];
        if secret.contains('\n') {
            candidates.extend(secret.lines().map(str::trim));
        }

        let mut secrets = self.secrets.write();
        for candidate in candidates {
            if candidate.len() < MIN_SECRET_LENGTH {
                continue;
            }
            if !secrets.iter().any(|s| s == candidate) {
                secrets.push(candidate.to_string());
            }
        }
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Replace every registered secret in `input` with `***`.
    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        let mut result = input.to_string();
        for secret in secrets.iter() {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_single_secret() {
        let masker = SecretMasker::new();
        masker.add_value("client-secret-123");
        assert_eq!(
            masker.mask_secrets("token=client-secret-123 sent"),
            "token=*** sent"
        );
    }

    #[test]
    fn longer_secret_masked_first() {
        let masker = SecretMasker::new();
        masker.add_value("pass");
        masker.add_value("password");
        assert_eq!(masker.mask_secrets("my password is here"), "my *** is here");
    }

    #[test]
    fn empty_and_tiny_values_ignored() {
        let masker = SecretMasker::new();
        masker.add_value("");
        masker.add_value("   ");
        masker.add_value("x");
        assert_eq!(masker.mask_secrets("x marks"), "x marks");
        assert_eq!(masker.mask_secrets("   "), "   ");
    }

    #[test]
    fn multiline_secret_masked_per_line() {
        let masker = SecretMasker::new();
        masker.add_value("line-one\nline-two");
        assert_eq!(masker.mask_secrets("got line-two"), "got ***");
    }

    #[test]
    fn clones_share_registrations() {
        let masker = SecretMasker::new();
        let clone = masker.clone();
        masker.add_value("shared-value");
        assert_eq!(clone.mask_secrets("shared-value"), "***");
    }
}
