//! The liveness monitor: a long-lived tick loop that compares expected
//! fire instants against observed events, materialises MISSED/LATE/TIMEOUT
//! events, and fans out state transitions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crab_core::config::{
    CrabConfig, DEFAULT_GRACE_SECS, DEFAULT_LOOKBACK_SECS, DEFAULT_TICK_SECS,
    DEFAULT_TIMEOUT_SECS,
};
use crab_core::{EventKind, EventRecord, JobState};
use crab_store::{CrabStore, StoreError};

use crate::filter;
use crate::schedule::{expected_fires, parse_timezone, CronSpec};
use crate::types::{JobStatusEntry, MonitorEvent, StatusDelta, StatusMap};

/// Fan-out channel capacity.
pub const FANOUT_BUFFER: usize = 256;
/// Queued deltas beyond the channel before the monitor declares
/// notifications degraded and starts discarding.
const BACKLOG_CEILING: usize = 1024;
/// Events fetched per job per tick; covers the lookback window at any
/// plausible cadence.
const RECENT_EVENT_WINDOW: u32 = 200;

/// Tunables resolved from the daemon config at startup.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub tick: std::time::Duration,
    /// Hard cap on how far back expected fires are examined. Also caps the
    /// effective grace period: a grace longer than this cannot be honoured.
    pub lookback: Duration,
    pub default_tz: Tz,
    pub default_grace: Duration,
    pub default_timeout: Duration,
}

impl MonitorConfig {
    pub fn from_config(config: &CrabConfig) -> crate::error::Result<Self> {
        Ok(MonitorConfig {
            tick: std::time::Duration::from_secs(config.notify.interval.max(1)),
            lookback: Duration::seconds(DEFAULT_LOOKBACK_SECS as i64),
            default_tz: parse_timezone(&config.notify.timezone)?,
            default_grace: Duration::seconds(DEFAULT_GRACE_SECS as i64),
            default_timeout: Duration::seconds(DEFAULT_TIMEOUT_SECS as i64),
        })
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            tick: std::time::Duration::from_secs(DEFAULT_TICK_SECS),
            lookback: Duration::seconds(DEFAULT_LOOKBACK_SECS as i64),
            default_tz: Tz::UTC,
            default_grace: Duration::seconds(DEFAULT_GRACE_SECS as i64),
            default_timeout: Duration::seconds(DEFAULT_TIMEOUT_SECS as i64),
        }
    }
}

/// The monitor task. Owns the soft status cache; all durable effects go
/// through the store, keyed so that a restart cannot double-emit.
pub struct MonitorEngine {
    store: Arc<CrabStore>,
    config: MonitorConfig,
    event_tx: mpsc::Sender<MonitorEvent>,
    status: StatusMap,
    /// Previous derived state per job, for transition detection.
    states: HashMap<i64, JobState>,
    /// Deltas waiting for room in the fan-out channel.
    backlog: VecDeque<StatusDelta>,
    degraded: bool,
    dropped: u64,
    last_check: Option<DateTime<Utc>>,
}

impl MonitorEngine {
    pub fn new(
        store: Arc<CrabStore>,
        config: MonitorConfig,
        event_tx: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        MonitorEngine {
            store,
            config,
            event_tx,
            status: StatusMap::new(),
            states: HashMap::new(),
            backlog: VecDeque::new(),
            degraded: false,
            dropped: 0,
            last_check: None,
        }
    }

    /// Shared read view of the status cache, for the dashboard.
    pub fn status_map(&self) -> StatusMap {
        self.status.clone()
    }

    /// Main loop. Ticks until `shutdown` broadcasts `true`; an in-progress
    /// tick always completes before exit.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.config.tick.as_secs(), "liveness monitor started");
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()) {
                        // Self-healing: log, keep the cache, try again next tick.
                        error!("monitor tick failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("liveness monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One evaluation pass at `now`. Separable from the loop for tests.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.flush_backlog();

        let jobs = self.store.get_jobs(false)?;
        let configs = self.store.get_configs()?;
        let mut status = HashMap::with_capacity(jobs.len());
        let mut states = HashMap::with_capacity(jobs.len());

        // Fires are examined from the previous tick backwards far enough
        // that a fire stays under examination until its grace expires. A
        // restart therefore reworks at most one tick plus one grace window.
        let tick = Duration::from_std(self.config.tick)
            .unwrap_or_else(|_| Duration::seconds(DEFAULT_TICK_SECS as i64));
        let anchor = self.last_check.unwrap_or(now - tick);

        for job in jobs {
            let config = configs.get(&job.id);
            let grace = config
                .and_then(|c| c.graceperiod)
                .map(|s| Duration::seconds(s as i64))
                .unwrap_or(self.config.default_grace);
            let timeout = config
                .and_then(|c| c.timeout)
                .map(|s| Duration::seconds(s as i64))
                .unwrap_or(self.config.default_timeout);

            let mut events = self.store.get_recent_events(job.id, RECENT_EVENT_WINDOW)?;
            let mut misconfigured = false;

            if let Some(spec_str) = config.and_then(|c| c.time.as_deref()) {
                match self.schedule_for(spec_str, config.and_then(|c| c.timezone.as_deref())) {
                    Ok((spec, tz)) => {
                        let window_start =
                            std::cmp::max(now - self.config.lookback, anchor - grace);
                        self.check_fires(job.id, &spec, tz, grace, window_start, now, &mut events)?;
                    }
                    Err(e) => {
                        warn!(job_id = job.id, "schedule excluded from liveness: {e}");
                        misconfigured = true;
                    }
                }
            }

            // A START past its timeout gets exactly one TIMEOUT event,
            // keyed on the start's id.
            if let Some(start) = filter::runaway_start(&events, timeout, now) {
                let key = filter::timeout_key(start);
                if let Some(id) = self.store.log_warning(job.id, EventKind::Timeout, now, &key)? {
                    debug!(job_id = job.id, start = start.id, "materialised TIMEOUT");
                    events.push(synthetic_event(id, job.id, EventKind::Timeout, now, key));
                }
            }

            let snapshot = filter::derive(&events, timeout, now);
            let previous = self.states.get(&job.id).copied().unwrap_or(JobState::Unknown);
            if snapshot.state != previous {
                self.forward(StatusDelta {
                    jobid: job.id,
                    host: job.host.clone(),
                    crabid: job.crabid.clone(),
                    old: previous,
                    new: snapshot.state,
                    eventid: events.last().map(|e| e.id),
                    at: now,
                });
            }

            states.insert(job.id, snapshot.state);
            status.insert(
                job.id,
                JobStatusEntry {
                    state: snapshot.state,
                    misconfigured,
                    reliability: snapshot.reliability,
                },
            );
        }

        // Dropping entries for retired/vanished jobs also forgets their
        // cached state, which is the intent.
        self.states = states;
        self.status.replace(status);
        self.last_check = Some(now);
        Ok(())
    }

    /// Examine every expected fire in the window and materialise LATE and
    /// MISSED warnings. Keys make re-examination idempotent.
    #[allow(clippy::too_many_arguments)]
    fn check_fires(
        &self,
        jobid: i64,
        spec: &CronSpec,
        tz: Tz,
        grace: Duration,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
        events: &mut Vec<EventRecord>,
    ) -> Result<(), StoreError> {
        for fire in expected_fires(spec, tz, window_start, now) {
            let started = events.iter().any(|e| {
                e.kind == EventKind::Start && e.datetime >= fire && e.datetime <= fire + grace
            });
            if started {
                continue;
            }

            if now > fire + grace {
                let key = format!("missed:{jobid}:{}", fire.to_rfc3339());
                if let Some(id) = self.store.log_warning(jobid, EventKind::Missed, now, &key)? {
                    debug!(job_id = jobid, fire = %fire, "materialised MISSED");
                    events.push(synthetic_event(id, jobid, EventKind::Missed, now, key));
                }
            } else if now > fire {
                let key = format!("late:{jobid}:{}", fire.to_rfc3339());
                if let Some(id) = self.store.log_warning(jobid, EventKind::Late, now, &key)? {
                    debug!(job_id = jobid, fire = %fire, "materialised LATE");
                    events.push(synthetic_event(id, jobid, EventKind::Late, now, key));
                }
            }
        }
        Ok(())
    }

    fn schedule_for(
        &self,
        spec: &str,
        timezone: Option<&str>,
    ) -> crate::error::Result<(CronSpec, Tz)> {
        let spec = CronSpec::parse(spec)?;
        let tz = match timezone {
            Some(name) => parse_timezone(name)?,
            None => self.config.default_tz,
        };
        Ok((spec, tz))
    }

    /// Push a delta toward the notification engine.
    ///
    /// The channel is bounded; when it is full the delta queues in the
    /// backlog. A newer delta for the same job replaces the queued one
    /// (merging old->new), and a merge that nets out to no change is
    /// discarded first, so genuine transitions survive the longest.
    fn forward(&mut self, delta: StatusDelta) {
        if self.backlog.is_empty() {
            match self.event_tx.try_send(MonitorEvent::Delta(delta)) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(MonitorEvent::Delta(delta))) => {
                    self.backlog.push_back(delta);
                }
                Err(e) => {
                    warn!("notification fan-out closed: {e}");
                    return;
                }
            }
        } else if let Some(queued) = self.backlog.iter_mut().find(|d| d.jobid == delta.jobid) {
            queued.new = delta.new;
            queued.eventid = delta.eventid;
            queued.at = delta.at;
            if queued.old == queued.new {
                let jobid = delta.jobid;
                self.backlog.retain(|d| d.jobid != jobid);
            }
        } else {
            self.backlog.push_back(delta);
        }

        if self.backlog.len() > BACKLOG_CEILING {
            if let Some(dropped) = self.backlog.pop_front() {
                self.dropped += 1;
                warn!(job_id = dropped.jobid, total = self.dropped, "delta dropped: backlog over ceiling");
            }
            if !self.degraded {
                self.degraded = true;
                let _ = self
                    .event_tx
                    .try_send(MonitorEvent::Degraded { dropped: self.dropped });
            }
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(delta) = self.backlog.front() {
            match self.event_tx.try_send(MonitorEvent::Delta(delta.clone())) {
                Ok(()) => {
                    self.backlog.pop_front();
                }
                Err(_) => return,
            }
        }
        // Backlog drained: a future overrun is a new degradation episode.
        self.degraded = false;
    }
}

fn synthetic_event(
    id: i64,
    jobid: i64,
    kind: EventKind,
    at: DateTime<Utc>,
    key: String,
) -> EventRecord {
    EventRecord {
        id,
        jobid,
        kind,
        datetime: at,
        status: None,
        synthetic_key: Some(key),
    }
}
