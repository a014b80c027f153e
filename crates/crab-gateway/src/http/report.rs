//! Client protocol handlers: the endpoints the `crabsh` wrapper calls to
//! register, report starts and finishes, and read back status.
//!
//! All event-carrying requests are `PUT` with a JSON body
//! `{command, status?, kind?, stdout?, stderr?}`; timestamps are assigned
//! here at receive time. A START with no prior registration registers
//! implicitly, and a changed command under a known crabid supersedes.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crab_core::{EventKind, JobOutput, JobRecord};
use crab_monitor::filter;

use crate::app::AppState;
use crate::http::ApiError;

/// Body of every event-carrying request.
#[derive(Debug, Deserialize)]
pub struct ReportBody {
    pub command: Option<String>,
    /// Child exit status, for finishes.
    pub status: Option<i64>,
    /// Finish flavour: `finish` (default), `alreadyrunning`, `inhibited`
    /// or `couldnotstart`.
    pub kind: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Command text for looking up id-less registrations.
    pub command: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub status: &'static str,
    /// The admin asked this job to skip its next run. Advisory: honoured
    /// only by wrappers configured with `allow_inhibit`.
    pub inhibit: bool,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Path((host, crabid)): Path<(String, String)>,
    Json(body): Json<ReportBody>,
) -> Result<Json<Value>, ApiError> {
    handle_register(&state, &host, Some(&crabid), body)
}

pub async fn register_commandless(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
    Json(body): Json<ReportBody>,
) -> Result<Json<Value>, ApiError> {
    handle_register(&state, &host, None, body)
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Path((host, crabid)): Path<(String, String)>,
    Json(body): Json<ReportBody>,
) -> Result<Json<StartResponse>, ApiError> {
    handle_start(&state, &host, Some(&crabid), body)
}

pub async fn start_commandless(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
    Json(body): Json<ReportBody>,
) -> Result<Json<StartResponse>, ApiError> {
    handle_start(&state, &host, None, body)
}

pub async fn finish(
    State(state): State<Arc<AppState>>,
    Path((host, crabid)): Path<(String, String)>,
    Json(body): Json<ReportBody>,
) -> Result<Json<Value>, ApiError> {
    handle_finish(&state, &host, Some(&crabid), body)
}

pub async fn finish_commandless(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
    Json(body): Json<ReportBody>,
) -> Result<Json<Value>, ApiError> {
    handle_finish(&state, &host, None, body)
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path((host, crabid)): Path<(String, String)>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Value>, ApiError> {
    handle_status(&state, &host, Some(&crabid), query)
}

pub async fn status_commandless(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Value>, ApiError> {
    handle_status(&state, &host, None, query)
}

fn handle_register(
    state: &AppState,
    host: &str,
    crabid: Option<&str>,
    body: ReportBody,
) -> Result<Json<Value>, ApiError> {
    let command = require_command(&body)?;
    let id = state.store.ensure_job(host, crabid, command)?;
    Ok(Json(json!({ "status": "ok", "id": id })))
}

fn handle_start(
    state: &AppState,
    host: &str,
    crabid: Option<&str>,
    body: ReportBody,
) -> Result<Json<StartResponse>, ApiError> {
    let command = require_command(&body)?;
    let id = state.store.ensure_job(host, crabid, command)?;
    state.store.log_start(id, Utc::now())?;

    let inhibit = state
        .store
        .get_job(id)?
        .map(|j| j.inhibited)
        .unwrap_or(false);
    Ok(Json(StartResponse {
        status: "ok",
        inhibit,
    }))
}

fn handle_finish(
    state: &AppState,
    host: &str,
    crabid: Option<&str>,
    body: ReportBody,
) -> Result<Json<Value>, ApiError> {
    let command = require_command(&body)?;
    let kind = parse_finish_kind(body.kind.as_deref())?;
    let id = state.store.ensure_job(host, crabid, command)?;

    let output = JobOutput {
        stdout: body.stdout,
        stderr: body.stderr,
    };
    let output = (output.stdout.is_some() || output.stderr.is_some()).then_some(output);
    state
        .store
        .log_finish(id, kind, Utc::now(), body.status, output.as_ref())?;
    Ok(Json(json!({ "status": "ok" })))
}

fn handle_status(
    state: &AppState,
    host: &str,
    crabid: Option<&str>,
    query: StatusQuery,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .store
        .find_job(host, crabid, query.command.as_deref())?
        .ok_or_else(|| ApiError::NotFound(format!("no job for host {host:?}")))?;

    let events = state
        .store
        .get_recent_events(job.id, query.limit.unwrap_or(20))?;
    let snapshot = derive_snapshot(state, &job, &events)?;

    Ok(Json(json!({
        "status": "ok",
        "job": job,
        "state": snapshot.state,
        "reliability": snapshot.reliability,
        "events": events,
    })))
}

/// Derive a job's state fresh from the store, with its configured timeout.
pub fn derive_snapshot(
    state: &AppState,
    job: &JobRecord,
    events: &[crab_core::EventRecord],
) -> Result<filter::JobSnapshot, ApiError> {
    let timeout = state
        .store
        .get_config(job.id)?
        .and_then(|c| c.timeout)
        .map(|s| Duration::seconds(s as i64))
        .unwrap_or(state.defaults.default_timeout);
    Ok(filter::derive(events, timeout, Utc::now()))
}

fn require_command(body: &ReportBody) -> Result<&str, ApiError> {
    body.command
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::protocol("request body must carry a command"))
}

fn parse_finish_kind(kind: Option<&str>) -> Result<EventKind, ApiError> {
    let kind = match kind {
        None => return Ok(EventKind::Finish),
        Some(s) => EventKind::from_str(s)
            .map_err(|e| ApiError::protocol(e))?,
    };
    if kind.ends_run() && kind != EventKind::Timeout {
        Ok(kind)
    } else {
        Err(ApiError::protocol(format!(
            "kind {kind} cannot be reported as a finish"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_kind_defaults_and_validates() {
        assert_eq!(parse_finish_kind(None).unwrap(), EventKind::Finish);
        assert_eq!(
            parse_finish_kind(Some("inhibited")).unwrap(),
            EventKind::Inhibited
        );
        assert_eq!(
            parse_finish_kind(Some("alreadyrunning")).unwrap(),
            EventKind::AlreadyRunning
        );
        assert_eq!(
            parse_finish_kind(Some("couldnotstart")).unwrap(),
            EventKind::CouldNotStart
        );
        // Monitor-owned and nonsense kinds are rejected.
        assert!(parse_finish_kind(Some("timeout")).is_err());
        assert!(parse_finish_kind(Some("missed")).is_err());
        assert!(parse_finish_kind(Some("start")).is_err());
        assert!(parse_finish_kind(Some("banana")).is_err());
    }
}
