//! `crab-gateway` — HTTP surface and daemon assembly for crab.
//!
//! The binary (`crabd`) wires the store, the liveness monitor and the
//! notification engine together; this library holds the router, handlers
//! and PID-file discipline so they can be exercised in tests.

pub mod app;
pub mod http;
pub mod pidfile;

pub use app::{build_router, AppState};
