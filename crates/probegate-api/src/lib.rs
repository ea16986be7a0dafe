//! Provisioning and fleet management HTTP API

pub mod handlers;
pub mod models;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use probegate_control::{CredentialStore, DeviceRegistry, LifecycleController, PortAllocationService};

/// Application state shared across handlers
pub struct AppState {
    pub allocator: Arc<PortAllocationService>,
    pub lifecycle: Arc<LifecycleController>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub credentials: Arc<dyn CredentialStore>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Probegate API",
        version = "0.1.0",
        description = "Zero-touch probe provisioning and fleet lifecycle"
    ),
    paths(
        handlers::request_port,
        handlers::register_device,
        handlers::health_check,
        handlers::list_devices,
        handlers::get_device,
        handlers::kill_switch,
        handlers::heartbeat_sweep,
    ),
    components(
        schemas(
            models::RequestPortResponse,
            models::PortOrigin,
            models::RegisterDeviceRequest,
            models::HealthResponse,
            models::ErrorResponse,
            models::DeviceStatus,
            models::DeviceInfo,
            models::DeviceList,
            models::KillSwitchRequest,
            models::KillReport,
            models::SweepReport,
            models::DeviceFailure,
        )
    ),
    tags(
        (name = "provisioning", description = "Endpoints called by probes and the registration trigger"),
        (name = "devices", description = "Fleet inventory, kill switch and heartbeat"),
        (name = "system", description = "System health")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable permissive CORS (for local dashboards)
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: false,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();

        let api_router = Router::new()
            .route("/provision/request-port", get(handlers::request_port))
            .route("/provision/register", post(handlers::register_device))
            .route("/health", get(handlers::health_check))
            .route("/api/devices", get(handlers::list_devices))
            .route("/api/devices/{mac}", get(handlers::get_device))
            .route("/api/kill-switch", post(handlers::kill_switch))
            .route("/api/heartbeat/sweep", post(handlers::heartbeat_sweep))
            .with_state(self.state.clone());

        // SwaggerUi serves /api/openapi.json as well
        let router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(api_router);

        let mut router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE])
                .allow_origin(tower_http::cors::Any);
            router = router.layer(cors);
        }

        router
    }

    /// Serve until `shutdown` flips to true
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("Starting API server on {}", listener.local_addr()?);
        info!("OpenAPI spec: http://{}/api/openapi.json", self.config.bind_addr);
        info!("Swagger UI: http://{}/swagger-ui", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                info!("API server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
