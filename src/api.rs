use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Topics;
use crate::services::{ServiceRegistry, WriteError};
use crate::state::{DeviceState, EntityState, StateMachine};

/// Shared bridge context: entity registry, raw device snapshot, the
/// fixed topic set, and the bridge event bus. Constructed once in main
/// and passed by reference everywhere.
pub struct AppState {
    pub state_machine: StateMachine,
    pub device: DeviceState,
    pub topics: Topics,
    pub started_at: Instant,
    event_tx: broadcast::Sender<BridgeEvent>,
}

/// Non-state event, e.g. "a telemetry message arrived".
#[derive(Debug, Clone, Serialize)]
pub struct BridgeEvent {
    pub event_type: String,
}

impl AppState {
    pub fn new(topics: Topics) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            state_machine: StateMachine::new(256),
            device: DeviceState::new(),
            topics,
            started_at: Instant::now(),
            event_tx,
        }
    }

    pub fn fire_event(&self, event_type: &str) {
        let _ = self.event_tx.send(BridgeEvent {
            event_type: event_type.to_string(),
        });
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.event_tx.subscribe()
    }
}

#[derive(Clone)]
struct ApiCtx {
    app: Arc<AppState>,
    registry: Arc<ServiceRegistry>,
}

/// GET /api/ response
#[derive(Serialize)]
struct ApiStatus {
    message: String,
}

pub fn router(app: Arc<AppState>, registry: Arc<ServiceRegistry>) -> Router {
    Router::new()
        .route("/api/", get(api_status))
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state))
        .route("/api/services/:domain/:service", post(call_service))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ApiCtx { app, registry })
}

async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "ThermIQ bridge running.".to_string(),
    })
}

/// GET /api/states - all entity states
async fn get_states(State(ctx): State<ApiCtx>) -> Json<Vec<EntityState>> {
    Json(ctx.app.state_machine.get_all())
}

/// GET /api/states/{entity_id} - one entity
async fn get_state(
    State(ctx): State<ApiCtx>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, StatusCode> {
    ctx.app
        .state_machine
        .get(&entity_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/services/{domain}/{service} - invoke a write or helper
/// service. A validation failure comes back as 4xx with the reason and
/// nothing is published.
async fn call_service(
    State(ctx): State<ApiCtx>,
    Path((domain, service)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    tracing::info!(domain = %domain, service = %service, "Service called");

    match ctx.registry.call(&domain, &service, &body) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "result": "ok" })),
        ),
        Err(err @ WriteError::UnknownService { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": err.to_string() })),
        ),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": err.to_string() })),
        ),
    }
}

/// GET /api/health - liveness plus the bridge counters
async fn health(State(ctx): State<ApiCtx>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "entity_count": ctx.app.state_machine.len(),
        "registers_seen": ctx.app.device.len(),
        "messages_received": ctx.app.device.msg_count(),
        "uptime_seconds": ctx.app.started_at.elapsed().as_secs(),
    }))
}
