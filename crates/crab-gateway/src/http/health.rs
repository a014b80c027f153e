use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health: liveness probe plus the dashboard's headline counters.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (warnings, errors) = state.status.problem_counts();
    Json(json!({
        "status": "ok",
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "warnings": warnings,
        "errors": errors,
    }))
}
