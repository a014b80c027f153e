//! Admin endpoints: schedules, inhibition, retirement, and the
//! notification rule set. Schedule changes are validated here so a typo
//! surfaces as a 400 instead of a misconfigured job.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crab_core::NotifyRule;
use crab_monitor::{parse_timezone, CronSpec};

use crate::app::AppState;
use crate::http::ApiError;

#[derive(Debug, Deserialize)]
pub struct ConfigBody {
    pub time: Option<String>,
    pub timezone: Option<String>,
    pub graceperiod: Option<u64>,
    pub timeout: Option<u64>,
}

pub async fn set_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ConfigBody>,
) -> Result<Json<Value>, ApiError> {
    require_job(&state, id)?;

    if let Some(spec) = body.time.as_deref() {
        CronSpec::parse(spec).map_err(|e| ApiError::protocol(e.to_string()))?;
    }
    if let Some(tz) = body.timezone.as_deref() {
        parse_timezone(tz).map_err(|e| ApiError::protocol(e.to_string()))?;
    }

    state.store.set_schedule(
        id,
        body.time.as_deref(),
        body.timezone.as_deref(),
        body.graceperiod,
        body.timeout,
    )?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn set_inhibit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_job(&state, id)?;
    state.store.set_inhibit(id, true)?;
    Ok(Json(json!({ "status": "ok", "inhibit": true })))
}

pub async fn clear_inhibit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_job(&state, id)?;
    state.store.set_inhibit(id, false)?;
    Ok(Json(json!({ "status": "ok", "inhibit": false })))
}

pub async fn retire_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_job(&state, id)?;
    state.store.retire_job(id)?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn get_notifications(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let rules = state.store.get_notifications()?;
    Ok(Json(json!({ "status": "ok", "notifications": rules })))
}

/// Full transactional replace of the rule set.
pub async fn set_notifications(
    State(state): State<Arc<AppState>>,
    Json(rules): Json<Vec<NotifyRule>>,
) -> Result<Json<Value>, ApiError> {
    for rule in &rules {
        if rule.method.trim().is_empty() {
            return Err(ApiError::protocol("notification rule without a method"));
        }
        if rule.address.is_empty() {
            return Err(ApiError::protocol("notification rule without addresses"));
        }
    }
    state.store.set_notifications(&rules)?;
    Ok(Json(json!({ "status": "ok", "count": rules.len() })))
}

fn require_job(state: &AppState, id: i64) -> Result<(), ApiError> {
    state
        .store
        .get_job(id)?
        .map(|_| ())
        .ok_or_else(|| ApiError::NotFound(format!("no job {id}")))
}
