//! Bootstrap errors

use thiserror::Error;

/// Every bootstrap failure is either worth retrying or not
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootstrapError {
    /// Transient: network hiccups, the gatekeeper returning 5xx, systemd busy
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Needs an operator: missing tenant config, no interface, rejected request
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl BootstrapError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BootstrapError::Retryable(_))
    }
}
