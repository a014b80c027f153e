//! `crab-store` — durable persistence for the crab monitoring daemon.
//!
//! # Overview
//!
//! One SQLite database holds registrations (`job`), the append-only event
//! log (`jobevent`), per-job schedules (`jobconfig`), notification rules
//! (`jobnotify`) and dispatched alerts (`jobalert`). Captured stdout/stderr
//! lives in `rawoutput`, either alongside the rest or in a secondary
//! output-store database when one is configured.
//!
//! [`CrabStore`] is the single writer for all durable state; the monitor,
//! the notifier and the HTTP handlers all go through it.

pub mod db;
pub mod error;
pub mod output;
pub mod store;

pub use error::{Result, StoreError};
pub use output::{open_output_store, OutputStore, SqliteOutputStore};
pub use store::CrabStore;
