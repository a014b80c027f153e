use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crab_core::{JobState, Severity};

/// A state transition detected by the monitor, pushed on the fan-out
/// channel for the notification engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDelta {
    pub jobid: i64,
    pub host: String,
    pub crabid: Option<String>,
    pub old: JobState,
    pub new: JobState,
    /// The newest event at detection time, when one exists.
    pub eventid: Option<i64>,
    pub at: DateTime<Utc>,
}

/// Everything the monitor can emit on the fan-out.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Delta(StatusDelta),
    /// The fan-out backlog overran its ceiling and deltas were discarded.
    /// Emitted once per degradation episode.
    Degraded { dropped: u64 },
}

/// One job's entry in the monitor's soft status cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusEntry {
    pub state: JobState,
    /// The schedule failed to parse; the job is excluded from liveness.
    pub misconfigured: bool,
    pub reliability: u8,
}

/// Shared read view of the monitor's status cache.
///
/// Readers get copies; the cache itself is owned by the monitor and is
/// disposable (a restart costs at most one tick of redundant work).
#[derive(Clone, Default)]
pub struct StatusMap {
    inner: Arc<RwLock<HashMap<i64, JobStatusEntry>>>,
}

impl StatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the full map.
    pub fn snapshot(&self) -> HashMap<i64, JobStatusEntry> {
        self.inner.read().unwrap().clone()
    }

    pub fn get(&self, jobid: i64) -> Option<JobStatusEntry> {
        self.inner.read().unwrap().get(&jobid).cloned()
    }

    /// (warnings, errors) across all jobs, for the dashboard header.
    pub fn problem_counts(&self) -> (usize, usize) {
        let map = self.inner.read().unwrap();
        let mut warnings = 0;
        let mut errors = 0;
        for entry in map.values() {
            match Severity::of_state(entry.state) {
                Severity::Ok => {}
                Severity::Warn | Severity::Late => warnings += 1,
                _ => errors += 1,
            }
            if entry.misconfigured {
                warnings += 1;
            }
        }
        (warnings, errors)
    }

    pub(crate) fn replace(&self, map: HashMap<i64, JobStatusEntry>) {
        *self.inner.write().unwrap() = map;
    }
}
