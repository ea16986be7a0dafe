//! HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use probegate_control::{AllocationError, DeviceFilter, KillSwitchError, Registration, RegistryError};
use probegate_proto::MacAddress;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::models::*;
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: Some(code.to_string()),
        }),
    )
}

fn parse_mac(raw: Option<&str>) -> Result<MacAddress, ApiError> {
    let raw = raw.ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Missing 'mac' parameter", "INVALID_MAC"))?;
    raw.parse()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid MAC '{}': {}", raw, e), "INVALID_MAC"))
}

fn allocation_error(err: AllocationError) -> ApiError {
    match &err {
        AllocationError::InvalidMac(_) => api_error(StatusCode::BAD_REQUEST, err.to_string(), "INVALID_MAC"),
        AllocationError::BackingStoreUnavailable(_) => {
            error!("Registry unavailable: {}", err);
            api_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string(), "REGISTRY_UNAVAILABLE")
        }
        AllocationError::Exhausted { .. } => {
            error!("{}", err);
            api_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string(), "PORTS_EXHAUSTED")
        }
        AllocationError::NotFound(_) => api_error(StatusCode::NOT_FOUND, err.to_string(), "DEVICE_NOT_FOUND"),
        AllocationError::Decommissioned(_) => {
            api_error(StatusCode::GONE, err.to_string(), "DEVICE_DECOMMISSIONED")
        }
        AllocationError::InvalidPublicKey(_) => {
            api_error(StatusCode::BAD_REQUEST, err.to_string(), "INVALID_PUBLIC_KEY")
        }
        AllocationError::Credential(_) => {
            error!("{}", err);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), "CREDENTIAL_ERROR")
        }
    }
}

fn registry_error(err: RegistryError) -> ApiError {
    error!("Registry error: {}", err);
    match err {
        RegistryError::NotFound(_) => api_error(StatusCode::NOT_FOUND, err.to_string(), "DEVICE_NOT_FOUND"),
        RegistryError::Unavailable(_) => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string(), "REGISTRY_UNAVAILABLE")
        }
        RegistryError::Conflict(_) | RegistryError::InvalidRecord(_) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), "REGISTRY_ERROR")
        }
    }
}

/// Look up or allocate the proxy port for a probe
#[utoipa::path(
    get,
    path = "/provision/request-port",
    params(RequestPortQuery),
    responses(
        (status = 200, description = "Port assigned to the MAC", body = RequestPortResponse),
        (status = 400, description = "Missing or malformed MAC", body = ErrorResponse),
        (status = 503, description = "Registry unavailable, retry later", body = ErrorResponse)
    ),
    tag = "provisioning"
)]
pub async fn request_port(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RequestPortQuery>,
) -> Result<Json<RequestPortResponse>, ApiError> {
    let mac = parse_mac(query.mac.as_deref())?;
    debug!(mac = %mac, "Port requested");

    let assignment = state.allocator.request_port(&mac).await.map_err(allocation_error)?;
    Ok(Json(assignment.to_response()))
}

/// Registration acknowledgement from the automation controller
#[utoipa::path(
    post,
    path = "/provision/register",
    request_body = RegisterDeviceRequest,
    responses(
        (status = 200, description = "Device registered and active", body = DeviceInfo),
        (status = 400, description = "Malformed MAC or public key", body = ErrorResponse),
        (status = 404, description = "MAC never requested a port", body = ErrorResponse),
        (status = 410, description = "Device was decommissioned", body = ErrorResponse),
        (status = 503, description = "Registry unavailable", body = ErrorResponse)
    ),
    tag = "provisioning"
)]
pub async fn register_device(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<Json<DeviceInfo>, ApiError> {
    let mac = parse_mac(Some(&req.mac))?;
    if req.tenant.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Tenant must not be empty", "INVALID_TENANT"));
    }

    let device = state
        .allocator
        .enroll(
            &mac,
            Registration {
                tenant: req.tenant.trim().to_string(),
                site: req.site,
                public_key: req.public_key,
            },
            state.credentials.as_ref(),
        )
        .await
        .map_err(allocation_error)?;

    Ok(Json(device.to_info()))
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Registry reachable", body = HealthResponse),
        (status = 503, description = "Registry unreachable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.allocator.health().await {
        (StatusCode::OK, Json(HealthResponse::ok()))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(HealthResponse::error()))
    }
}

/// List devices in the active working set
#[utoipa::path(
    get,
    path = "/api/devices",
    params(DeviceQuery),
    responses(
        (status = 200, description = "Matching devices", body = DeviceList),
        (status = 400, description = "Unknown status filter", body = ErrorResponse),
        (status = 503, description = "Registry unavailable", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeviceQuery>,
) -> Result<Json<DeviceList>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DeviceStatus>)
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string(), "INVALID_STATUS"))?;

    let filter = DeviceFilter {
        tenant: query.tenant,
        status,
    };
    let devices = state.registry.list(&filter).await.map_err(registry_error)?;
    let devices: Vec<DeviceInfo> = devices.iter().map(|d| d.to_info()).collect();

    Ok(Json(DeviceList {
        total: devices.len(),
        devices,
    }))
}

/// Get one device by MAC
#[utoipa::path(
    get,
    path = "/api/devices/{mac}",
    params(
        ("mac" = String, Path, description = "Device MAC address")
    ),
    responses(
        (status = 200, description = "Device information", body = DeviceInfo),
        (status = 400, description = "Malformed MAC", body = ErrorResponse),
        (status = 404, description = "Device not found", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(mac): Path<String>,
) -> Result<Json<DeviceInfo>, ApiError> {
    let mac = parse_mac(Some(&mac))?;
    match state.registry.find_by_mac(&mac).await.map_err(registry_error)? {
        Some(device) => Ok(Json(device.to_info())),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Device '{}' not found", mac),
            "DEVICE_NOT_FOUND",
        )),
    }
}

/// Revoke access for a device, a port or a whole tenant
#[utoipa::path(
    post,
    path = "/api/kill-switch",
    request_body = KillSwitchRequest,
    responses(
        (status = 200, description = "Kill switch report (check `failed` for partial failures)", body = KillReport),
        (status = 400, description = "Selector must name exactly one of mac, port, tenant", body = ErrorResponse),
        (status = 503, description = "Registry unavailable", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn kill_switch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KillSwitchRequest>,
) -> Result<Json<KillReport>, ApiError> {
    let selector = req
        .into_selector()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string(), "INVALID_SELECTOR"))?;

    info!(%selector, "Kill switch requested");
    match state.lifecycle.kill(&selector).await {
        Ok(report) => {
            if !report.is_complete() {
                warn!(%selector, failed = report.failed.len(), "Kill switch incomplete");
            }
            Ok(Json(report))
        }
        Err(KillSwitchError::InvalidSelector(e)) => {
            Err(api_error(StatusCode::BAD_REQUEST, e.to_string(), "INVALID_SELECTOR"))
        }
        Err(KillSwitchError::Registry(e)) => Err(registry_error(e)),
    }
}

/// Run one heartbeat sweep now
#[utoipa::path(
    post,
    path = "/api/heartbeat/sweep",
    responses(
        (status = 200, description = "Sweep report", body = SweepReport),
        (status = 503, description = "Registry unavailable", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn heartbeat_sweep(State(state): State<Arc<AppState>>) -> Result<Json<SweepReport>, ApiError> {
    let report = state.lifecycle.sweep().await.map_err(registry_error)?;
    Ok(Json(report))
}
