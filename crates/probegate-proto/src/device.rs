//! Device lifecycle vocabulary shared by the registry, API and controller

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::mac::MacAddress;
use crate::DEVICE_NAME_PREFIX;

/// Lifecycle status of a probe in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Port reserved, registration not yet acknowledged
    Pending,
    /// Registered and answering heartbeats
    Active,
    /// Missed at least `failure_threshold` consecutive heartbeats
    Offline,
    /// Revoked by the kill switch
    Decommissioned,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Active => "active",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Decommissioned => "decommissioned",
        }
    }

    /// Whether cleanup may archive a device in this status
    pub fn is_archivable(&self) -> bool {
        matches!(self, DeviceStatus::Offline | DeviceStatus::Decommissioned)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown device status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for DeviceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(DeviceStatus::Pending),
            "active" => Ok(DeviceStatus::Active),
            "offline" => Ok(DeviceStatus::Offline),
            "decommissioned" => Ok(DeviceStatus::Decommissioned),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Whether a port assignment was found or freshly created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum PortOrigin {
    Existing,
    New,
}

/// Inventory display name for a probe: `probe-<mac without separators>`
pub fn device_name(mac: &MacAddress) -> String {
    format!("{}{}", DEVICE_NAME_PREFIX, mac.compact())
}

/// Lower-case, underscore-separated slug used for tenant and site identifiers
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_sep = false;

    for c in text.trim().chars() {
        if c.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }

    slug
}
