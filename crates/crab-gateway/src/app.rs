use axum::{
    routing::{get, put},
    Router,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crab_core::config::REQUEST_TIMEOUT_SECS;

use crab_core::CrabConfig;
use crab_monitor::{MonitorConfig, StatusMap};
use crab_store::CrabStore;

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: CrabConfig,
    pub store: Arc<CrabStore>,
    /// Read-only copy view of the monitor's status cache (dashboard
    /// counters only; job queries derive state fresh from the store).
    pub status: StatusMap,
    /// Liveness defaults, used when deriving state at read time.
    pub defaults: MonitorConfig,
    /// Discovered once at startup: the feed needs an absolute base URL.
    pub feed_enabled: bool,
    pub started_at: DateTime<Utc>,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        // Client protocol (the wrapper's endpoints). Registrations keyed by
        // command text use the id-less forms.
        .route(
            "/api/0/crab/:host",
            put(crate::http::report::register_commandless).get(crate::http::report::status_commandless),
        )
        .route("/api/0/crab/:host/start", put(crate::http::report::start_commandless))
        .route("/api/0/crab/:host/finish", put(crate::http::report::finish_commandless))
        .route(
            "/api/0/crab/:host/:crabid",
            put(crate::http::report::register).get(crate::http::report::status),
        )
        .route("/api/0/crab/:host/:crabid/start", put(crate::http::report::start))
        .route("/api/0/crab/:host/:crabid/finish", put(crate::http::report::finish))
        // Read API.
        .route("/api/0/jobs", get(crate::http::query::list_jobs))
        .route("/api/0/job/:id", get(crate::http::query::job_detail))
        .route("/api/0/job/:id/output/:eventid", get(crate::http::query::job_output))
        .route("/api/0/failures", get(crate::http::query::failures))
        // Admin.
        .route("/api/0/job/:id/config", put(crate::http::admin::set_config))
        .route(
            "/api/0/job/:id/inhibit",
            put(crate::http::admin::set_inhibit).delete(crate::http::admin::clear_inhibit),
        )
        .route(
            "/api/0/notify",
            get(crate::http::admin::get_notifications).put(crate::http::admin::set_notifications),
        )
        .route("/api/0/job/:id/retire", put(crate::http::admin::retire_job))
        // Syndication feed (404 unless enabled at startup).
        .route("/feed", get(crate::http::feed::feed_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        // Requests answer within the budget or get a 408; the API must
        // never leave a wrapper hanging.
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(
            REQUEST_TIMEOUT_SECS,
        )))
}
