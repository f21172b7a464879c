use crate::errors::RelayError;
use crate::relay::wire::{DiscoveryRequest, DiscoveryResponse, RelayRequest, RelayResponse, StatusResponse};
use crate::relay::RelayService;
use axum::{
    extract::{Json, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// HTTP server state
#[derive(Clone)]
pub struct RelayState {
    pub service: Arc<RelayService>,
}

impl RelayState {
    pub fn new(service: Arc<RelayService>) -> Self {
        Self { service }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Error response for non-relay endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

pub fn status_code_for(error: &RelayError) -> StatusCode {
    match error {
        RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RelayError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RelayError::RelayUnreachable(_) | RelayError::RelayTimeout(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        RelayError::ConnectRefused(_)
        | RelayError::ConnectTimeout { .. }
        | RelayError::Unreachable(_)
        | RelayError::WriteFailed(_)
        | RelayError::IdleTimeout(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = status_code_for(&self);
        let body = Json(ErrorResponse {
            error: self.to_string(),
            kind: self.kind().to_string(),
        });
        (status, body).into_response()
    }
}

/// Reject the request unless it carries the configured bearer token.
fn authorize(headers: &HeaderMap, state: &RelayState) -> Result<(), Response> {
    let Some(expected) = state.service.config().auth_token.as_deref() else {
        return Ok(());
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    if presented == Some(expected) {
        Ok(())
    } else {
        debug!("Rejected relay request with missing or wrong bearer token");
        let body = Json(ErrorResponse {
            error: "missing or invalid bearer token".to_string(),
            kind: "unauthorized".to_string(),
        });
        Err((StatusCode::UNAUTHORIZED, body).into_response())
    }
}

/// POST /api/relay - Perform one TCP exchange with a printer
async fn handle_relay(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(request): Json<RelayRequest>,
) -> Response {
    if let Err(rejection) = authorize(&headers, &state) {
        return rejection;
    }

    debug!(
        "Relay request: {}:{} ({} bytes)",
        request.host,
        request.port,
        request.payload.len()
    );

    let started = Instant::now();
    match state.service.relay(request).await {
        Ok(outcome) => Json(RelayResponse::from_outcome(&outcome)).into_response(),
        Err(e) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            (status_code_for(&e), Json(RelayResponse::from_error(&e, elapsed_ms))).into_response()
        }
    }
}

/// POST /api/discover - Probe a subnet for raw-port listeners
async fn handle_discover(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(request): Json<DiscoveryRequest>,
) -> Result<Json<DiscoveryResponse>, Response> {
    authorize(&headers, &state)?;

    state
        .service
        .discover(request)
        .await
        .map(Json)
        .map_err(IntoResponse::into_response)
}

/// GET /api/status - In-flight sessions and uptime
async fn handle_status(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, Response> {
    authorize(&headers, &state)?;
    Ok(Json(state.service.status()))
}

/// GET /api/health - Liveness probe, never authenticated
async fn handle_health(State(state): State<RelayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.service.status().uptime_seconds,
    })
}

/// GET /api/metrics - Telemetry metrics (Prometheus format)
async fn handle_metrics(State(state): State<RelayState>) -> String {
    let service = &state.service;
    service
        .telemetry()
        .export_prometheus(service.in_flight(), service.queued())
        .await
}

/// GET /api/metrics/json - Telemetry metrics (JSON format)
async fn handle_metrics_json(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, Response> {
    authorize(&headers, &state)?;
    let metrics = state.service.telemetry().get_metrics().await;
    Ok(Json(serde_json::to_value(&metrics).unwrap_or_default()))
}

fn cors_layer(extra_origins: Vec<String>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            let o = origin.as_bytes();
            // Local web clients and explicitly configured app origins
            o.starts_with(b"http://localhost")
                || o.starts_with(b"https://localhost")
                || o.starts_with(b"http://127.0.0.1")
                || extra_origins.iter().any(|allowed| allowed.as_bytes() == o)
        }))
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

/// Create the relay HTTP router
pub fn create_router(state: RelayState) -> Router {
    let extra_origins = state.service.config().allowed_origins.clone();

    Router::new()
        .route("/api/relay", post(handle_relay))
        .route("/api/discover", post(handle_discover))
        .route("/api/status", get(handle_status))
        .route("/api/health", get(handle_health))
        .route("/api/metrics", get(handle_metrics))
        .route("/api/metrics/json", get(handle_metrics_json))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(extra_origins)),
        )
        .with_state(state)
}

/// Serve the relay on an already-bound listener until `shutdown` resolves.
/// In-flight requests are allowed to finish.
pub async fn serve<F>(
    listener: TcpListener,
    service: Arc<RelayService>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(RelayState::new(service));

    match listener.local_addr() {
        Ok(addr) => info!("Bridge relay listening on {}", addr),
        Err(e) => debug!("Bridge relay listening (address unavailable: {})", e),
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!("Relay server error: {}", e);
            e
        })
}
