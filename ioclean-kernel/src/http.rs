/**
 * API REST IOCLEAN - Façade HTTP du bus de commandes
 *
 * RÔLE :
 * Expose la dernière lecture reçue, accepte des commandes vers un équipement
 * et publie l'état de santé du bus.
 *
 * ROUTES :
 * - GET  /api/state    → dernière Frame (champs vides avant la première)
 * - POST /api/command  → {device_id, metric_name, value} → file du dispatcher
 * - GET  /api/health   → liens connectés, file, commandes en vol, compteurs
 *
 * SÉCURITÉ :
 * - Si une clé API est configurée, header x-api-key obligatoire sauf /api/health
 */

use crate::facade::{LatestReading, Rejected};
use crate::health::BusHealth;
use crate::supervisor::SharedSupervisor;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: SharedSupervisor,
    pub api_key: Option<String>,
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Ok(next.run(req).await);
    };

    // Health check toujours accessible
    if req.uri().path().starts_with("/api/health") {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request without valid API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/command", post(post_command))
        .route("/api/health", get(get_health))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /api/state
async fn get_state(State(app): State<AppState>) -> Json<LatestReading> {
    Json(app.supervisor.facade().latest_reading())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommandBody {
    device_id: String,
    metric_name: String,
    value: Value,
}

/// Les équipements ne voient que du texte : `2` et `"2"` donnent la même commande
fn value_to_wire(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// POST /api/command
async fn post_command(State(app): State<AppState>, Json(body): Json<CommandBody>) -> (StatusCode, Json<Value>) {
    let value = value_to_wire(&body.value);
    match app.supervisor.facade().submit_command(&body.device_id, &body.metric_name, &value) {
        Ok(accepted) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "device_id": accepted.device_id,
                "command": accepted.command,
                "request_id": accepted.request_id,
            })),
        ),
        Err(rejected) => {
            let code = match rejected {
                Rejected::MissingParameter(_) | Rejected::InvalidParameter(_) => StatusCode::BAD_REQUEST,
                Rejected::UnknownDevice(_) => StatusCode::NOT_FOUND,
                Rejected::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            };
            (code, Json(json!({ "success": false, "error": rejected.to_string() })))
        }
    }
}

// GET /api/health
async fn get_health(State(app): State<AppState>) -> Json<BusHealth> {
    Json(app.supervisor.health())
}
