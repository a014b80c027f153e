//! Read-only endpoints: dashboards, per-job timelines, raw output, and
//! the recent-failures view. State is always derived fresh from the store
//! so readers see a consistent snapshot, never the monitor's cache.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crab_monitor::CronSpec;

use crate::app::AppState;
use crate::http::report::derive_snapshot;
use crate::http::ApiError;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_retired: bool,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub since: Option<i64>,
    pub limit: Option<u32>,
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let jobs = state.store.get_jobs(query.include_retired)?;
    let mut rows = Vec::with_capacity(jobs.len());

    for job in jobs {
        let config = state.store.get_config(job.id)?;
        let misconfigured = config
            .as_ref()
            .and_then(|c| c.time.as_deref())
            .is_some_and(|spec| CronSpec::parse(spec).is_err());
        let events = state.store.get_recent_events(job.id, 50)?;
        let snapshot = derive_snapshot(&state, &job, &events)?;

        rows.push(json!({
            "job": job,
            "state": snapshot.state,
            "reliability": snapshot.reliability,
            "misconfigured": misconfigured,
            "schedule": config,
        }));
    }

    let (warnings, errors) = state.status.problem_counts();
    Ok(Json(json!({
        "status": "ok",
        "jobs": rows,
        "warnings": warnings,
        "errors": errors,
    })))
}

pub async fn job_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .store
        .get_job(id)?
        .ok_or_else(|| ApiError::NotFound(format!("no job {id}")))?;
    let config = state.store.get_config(id)?;

    let events = match query.since {
        Some(since) => state.store.get_events(id, Some(since), query.limit)?,
        None => state.store.get_recent_events(id, query.limit.unwrap_or(100))?,
    };
    let snapshot = derive_snapshot(&state, &job, &events)?;

    Ok(Json(json!({
        "status": "ok",
        "job": job,
        "schedule": config,
        "state": snapshot.state,
        "reliability": snapshot.reliability,
        "last_start": snapshot.last_start,
        "last_finish": snapshot.last_finish,
        "last_nonok_finish": snapshot.last_nonok_finish,
        "events": events,
    })))
}

pub async fn job_output(
    State(state): State<Arc<AppState>>,
    Path((id, eventid)): Path<(i64, i64)>,
) -> Result<Json<Value>, ApiError> {
    let event = state
        .store
        .get_event(eventid)?
        .filter(|e| e.jobid == id)
        .ok_or_else(|| ApiError::NotFound(format!("no event {eventid} for job {id}")))?;
    let output = state.store.get_output(eventid)?.unwrap_or_default();

    Ok(Json(json!({
        "status": "ok",
        "event": event,
        "stdout": output.stdout,
        "stderr": output.stderr,
    })))
}

pub async fn failures(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let rows = state.store.get_fail_events(query.limit.unwrap_or(40))?;
    let failures: Vec<Value> = rows
        .into_iter()
        .map(|(job, event)| json!({ "job": job, "event": event }))
        .collect();
    Ok(Json(json!({ "status": "ok", "failures": failures })))
}
