//! `crab-core` — shared types, configuration, and error kinds for the crab
//! monitoring daemon.
//!
//! Everything that crosses a crate boundary lives here: the event and job
//! records persisted by `crab-store`, the severity ordering used by
//! `crab-notify`, the daemon configuration loaded by both binaries, and the
//! daemon-level [`CrabError`] that component errors translate into.

pub mod config;
pub mod error;
pub mod text;
pub mod types;

pub use config::CrabConfig;
pub use error::{CrabError, Result};
pub use types::{
    AlertRecord, EventKind, EventRecord, JobConfigRecord, JobOutput, JobRecord, JobState,
    NotifyRule, Severity,
};
