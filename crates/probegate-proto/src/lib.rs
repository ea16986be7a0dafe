//! Probegate Protocol Definitions
//!
//! Shared domain types and wire messages exchanged between probes, the
//! provisioning API and the lifecycle controller.

pub mod device;
pub mod mac;
pub mod messages;

pub use device::{device_name, slugify, DeviceStatus, ParseStatusError, PortOrigin};
pub use mac::{MacAddress, MacError};
pub use messages::*;

/// First port handed out to a probe on the proxy
pub const DEFAULT_BASE_PORT: u16 = 10001;

/// Prefix used for inventory device names (`probe-<mac hex>`)
pub const DEVICE_NAME_PREFIX: &str = "probe-";
