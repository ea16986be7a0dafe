//! Error types for the control plane

use probegate_proto::{MacError, SelectorError};
use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Registry (system of record) errors
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Registry conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt registry record: {0}")]
    InvalidRecord(String),
}

impl From<DbErr> for RegistryError {
    fn from(err: DbErr) -> Self {
        if let Some(SqlErr::UniqueConstraintViolation(detail)) = err.sql_err() {
            return RegistryError::Conflict(detail);
        }

        match err {
            DbErr::RecordNotFound(what) => RegistryError::NotFound(what),
            other => RegistryError::Unavailable(other.to_string()),
        }
    }
}

/// Port allocation errors surfaced to callers
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Invalid MAC address: {0}")]
    InvalidMac(#[from] MacError),

    #[error("Backing registry unavailable: {0}")]
    BackingStoreUnavailable(String),

    #[error("No free port left in {base}..={max}")]
    Exhausted { base: u16, max: u16 },

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device is decommissioned: {0}")]
    Decommissioned(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Failed to install probe key: {0}")]
    Credential(String),
}

impl AllocationError {
    /// Whether the caller should retry later
    ///
    /// An exhausted range frees up again once cleanup archives dead devices.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AllocationError::BackingStoreUnavailable(_) | AllocationError::Exhausted { .. }
        )
    }
}

impl From<CredentialError> for AllocationError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::MalformedKey(reason) => AllocationError::InvalidPublicKey(reason),
            other => AllocationError::Credential(other.to_string()),
        }
    }
}

impl From<RegistryError> for AllocationError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(what) => AllocationError::NotFound(what),
            other => AllocationError::BackingStoreUnavailable(other.to_string()),
        }
    }
}

/// Kill switch errors that abort the whole invocation
///
/// Per-device failures are reported in the `KillReport` instead.
#[derive(Debug, Error)]
pub enum KillSwitchError {
    #[error(transparent)]
    InvalidSelector(#[from] SelectorError),

    #[error("Failed to resolve selector: {0}")]
    Registry(#[from] RegistryError),
}

/// Credential store errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Malformed public key: {0}")]
    MalformedKey(String),

    #[error("Authorized keys I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reachability probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe of port {port} timed out")]
    Timeout { port: u16 },

    #[error("Port {port} unreachable: {reason}")]
    Unreachable { port: u16, reason: String },
}
