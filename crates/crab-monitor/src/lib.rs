//! `crab-monitor` — scheduling-aware liveness for the crab daemon.
//!
//! # Overview
//!
//! Three pieces, from pure to stateful:
//!
//! | Piece | Job |
//! |-------|-----|
//! | [`schedule`] | Parse five-field cron specs and enumerate expected fire instants in a window, timezone-aware |
//! | [`filter`]   | Reduce a job's event log to its derived state and summary figures |
//! | [`engine`]   | The tick loop: materialise MISSED/LATE/TIMEOUT events (idempotently, via synthetic keys) and fan out state transitions |
//!
//! The engine's only durable effects go through the store; its in-memory
//! cache is disposable and a restart costs at most one tick of rework.

pub mod engine;
pub mod error;
pub mod filter;
pub mod schedule;
pub mod types;

pub use engine::{MonitorConfig, MonitorEngine, FANOUT_BUFFER};
pub use error::ScheduleError;
pub use filter::{derive, JobSnapshot};
pub use schedule::{expected_fires, parse_timezone, CronSpec};
pub use types::{JobStatusEntry, MonitorEvent, StatusDelta, StatusMap};
