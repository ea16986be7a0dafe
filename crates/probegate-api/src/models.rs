//! Request/response models for the provisioning and fleet API

use serde::Deserialize;
use utoipa::IntoParams;

pub use probegate_proto::{
    DeviceFailure, DeviceInfo, DeviceList, DeviceStatus, ErrorResponse, HealthResponse, KillReport,
    KillSwitchRequest, PortOrigin, RegisterDeviceRequest, RequestPortResponse, SweepReport,
};

/// Query of `GET /provision/request-port`
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RequestPortQuery {
    /// Probe MAC address (any common format)
    pub mac: Option<String>,
}

/// Filters of `GET /api/devices`
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DeviceQuery {
    /// Only devices of this tenant
    pub tenant: Option<String>,
    /// Only devices in this status (pending, active, offline, decommissioned)
    pub status: Option<String>,
}
