//! Wire messages for the provisioning API and the registration trigger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{DeviceStatus, PortOrigin};
use crate::mac::MacAddress;

/// Response of `GET /provision/request-port`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RequestPortResponse {
    /// Assigned proxy port
    pub port: u16,
    /// `existing` when the MAC already held a port, `new` otherwise
    pub status: PortOrigin,
    /// Canonical MAC address
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub mac: MacAddress,
    /// Inventory device name
    pub device_name: String,
}

/// Health check response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HealthResponse {
    /// `ok` or `error`
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn error() -> Self {
        Self {
            status: "error".to_string(),
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Notification sent by a probe to the registration trigger once its tunnel is up
///
/// Delivered at least once; receivers must treat duplicates as the same registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationNotice {
    pub mac: MacAddress,
    pub port: u16,
    pub tenant: String,
    pub tenant_slug: String,
    pub site: String,
    pub site_slug: String,
    pub public_key: String,
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_config_key: Option<String>,
}

/// Registration acknowledgement posted back by the automation controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RegisterDeviceRequest {
    /// Probe MAC address (any common format)
    pub mac: String,
    /// Tenant the probe belongs to
    pub tenant: String,
    /// Site within the tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Public key installed on the proxy for this probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Device record as exposed to the fleet inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DeviceInfo {
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub mac: MacAddress,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub port: u16,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// List of devices
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DeviceList {
    pub devices: Vec<DeviceInfo>,
    pub total: usize,
}

/// Which devices a kill switch invocation targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KillSelector {
    Mac(MacAddress),
    Port(u16),
    Tenant(String),
}

impl std::fmt::Display for KillSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillSelector::Mac(mac) => write!(f, "mac={}", mac),
            KillSelector::Port(port) => write!(f, "port={}", port),
            KillSelector::Tenant(tenant) => write!(f, "tenant={}", tenant),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("Exactly one of mac, port or tenant must be given (got {0})")]
    WrongArity(usize),

    #[error("Invalid MAC in selector: {0}")]
    InvalidMac(String),

    #[error("Tenant selector must not be empty")]
    EmptyTenant,
}

/// Kill switch request body: exactly one field must be set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct KillSwitchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

impl KillSwitchRequest {
    pub fn into_selector(self) -> Result<KillSelector, SelectorError> {
        let given = [
            self.mac.is_some(),
            self.port.is_some(),
            self.tenant.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if given != 1 {
            return Err(SelectorError::WrongArity(given));
        }

        if let Some(mac) = self.mac {
            let parsed = mac
                .parse()
                .map_err(|e: crate::MacError| SelectorError::InvalidMac(e.to_string()))?;
            return Ok(KillSelector::Mac(parsed));
        }

        if let Some(port) = self.port {
            return Ok(KillSelector::Port(port));
        }

        match self.tenant {
            Some(tenant) if !tenant.trim().is_empty() => {
                Ok(KillSelector::Tenant(tenant.trim().to_string()))
            }
            _ => Err(SelectorError::EmptyTenant),
        }
    }
}

/// Outcome of a kill switch invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct KillReport {
    /// Selector as given by the caller
    pub selector: String,
    /// Devices revoked by this invocation
    pub revoked: Vec<String>,
    /// Devices that were already decommissioned
    pub already_decommissioned: Vec<String>,
    /// Devices whose revocation failed, with the reason
    pub failed: Vec<DeviceFailure>,
}

impl KillReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of one heartbeat sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SweepReport {
    pub probed: usize,
    pub reachable: usize,
    pub unreachable: usize,
    /// Devices that transitioned to offline during this sweep
    pub went_offline: Vec<String>,
    /// Devices that recovered (offline or pending to active)
    pub recovered: Vec<String>,
    /// Devices that could not be evaluated (registry errors)
    pub errors: Vec<DeviceFailure>,
}

/// Per-device failure entry in aggregate reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DeviceFailure {
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub error: String,
}
