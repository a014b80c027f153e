//! The notification engine: consumes status deltas from the monitor's
//! fan-out, applies the rule set (matching, severity floor, dedup, rate
//! limit) and dispatches alerts through the transport registry.
//!
//! Dispatches run as independent tasks so a slow or failing transport
//! never blocks the others; every dispatch outcome lands in the alert
//! table (pending row first, outcome update after).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crab_core::config::{CrabConfig, NOTIFY_FLUSH_SECS};
use crab_core::{CrabError, NotifyRule, Severity};
use crab_monitor::{parse_timezone, MonitorEvent, StatusDelta};
use crab_store::{CrabStore, StoreError};

use crate::format;
use crate::transport::{dispatch_with_retry, RetryPolicy, TransportRegistry};

/// Default per-rule rate limit: 10 alerts per 5 minutes.
const RATE_BURST: u32 = 10;
const RATE_WINDOW_SECS: i64 = 300;
/// Rate-limited alerts queue up to this many before overflow is dropped.
const QUEUE_CAP: usize = 100;
/// Events shown in an alert body.
const BODY_EVENT_COUNT: u32 = 10;

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Dedup window for rules without their own cooldown.
    pub default_cooldown: Duration,
    /// Timezone used to render timestamps in alert bodies.
    pub display_tz: Tz,
    pub retry: RetryPolicy,
    pub rate_burst: u32,
    pub rate_window: Duration,
    pub queue_cap: usize,
    /// Shutdown budget for flushing queued and in-flight work.
    pub flush_timeout: std::time::Duration,
}

impl NotifyConfig {
    pub fn from_config(config: &CrabConfig) -> crab_core::Result<Self> {
        let display_tz = parse_timezone(&config.notify.timezone)
            .map_err(|e| CrabError::Config(e.to_string()))?;
        Ok(NotifyConfig {
            default_cooldown: Duration::seconds(config.notify.cooldown as i64),
            display_tz,
            ..NotifyConfig::default()
        })
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            default_cooldown: Duration::seconds(3600),
            display_tz: Tz::UTC,
            retry: RetryPolicy::default(),
            rate_burst: RATE_BURST,
            rate_window: Duration::seconds(RATE_WINDOW_SECS),
            queue_cap: QUEUE_CAP,
            flush_timeout: std::time::Duration::from_secs(NOTIFY_FLUSH_SECS),
        }
    }
}

struct PendingAlert {
    rule: NotifyRule,
    delta: StatusDelta,
}

pub struct NotifyEngine {
    store: Arc<CrabStore>,
    registry: Arc<TransportRegistry>,
    config: NotifyConfig,
    buckets: HashMap<i64, TokenBucket>,
    pending: VecDeque<PendingAlert>,
    tasks: JoinSet<()>,
    dropped: u64,
}

impl NotifyEngine {
    pub fn new(
        store: Arc<CrabStore>,
        registry: Arc<TransportRegistry>,
        config: NotifyConfig,
    ) -> Self {
        NotifyEngine {
            store,
            registry,
            config,
            buckets: HashMap::new(),
            pending: VecDeque::new(),
            tasks: JoinSet::new(),
            dropped: 0,
        }
    }

    /// Main loop: consume monitor events until shutdown, then flush.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<MonitorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("notification engine started");
        let mut drain = tokio::time::interval(std::time::Duration::from_secs(1));

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(MonitorEvent::Delta(delta)) => {
                        if let Err(e) = self.handle_delta(delta, Utc::now()) {
                            // Self-healing: log and pick up the next delta.
                            error!("notification handling failed: {e}");
                        }
                    }
                    Some(MonitorEvent::Degraded { dropped }) => self.notify_degraded(dropped),
                    None => break,
                },
                _ = drain.tick() => {
                    self.drain_pending(Utc::now());
                    while self.tasks.try_join_next().is_some() {}
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("notification engine flushing before shutdown");
        self.flush().await;
    }

    /// Apply the rule set to one status delta.
    pub fn handle_delta(
        &mut self,
        delta: StatusDelta,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let rules = self.store.get_notifications()?;
        if rules.is_empty() {
            return Ok(());
        }

        let event = match delta.eventid {
            Some(id) => self.store.get_event(id)?,
            None => None,
        };
        let state_severity = Severity::of_state(delta.new);
        let severity = event
            .as_ref()
            .map(|e| Severity::of_event(e.kind, e.status))
            .unwrap_or(Severity::Ok)
            .max(state_severity);

        for rule in rules {
            if !rule_matches(&rule, &delta) || severity < rule.min_severity {
                continue;
            }
            if severity == Severity::Ok && rule.skip_ok {
                continue;
            }

            // Dedup: a repeat of the same derived state within the rule's
            // cool-down stays quiet; a state change always passes.
            let cooldown = rule
                .cooldown
                .map(|s| Duration::seconds(s as i64))
                .unwrap_or(self.config.default_cooldown);
            if let Some(last) = self.store.last_alert(rule.id, delta.jobid)? {
                if last.state == delta.new && now - last.dispatched_at < cooldown {
                    debug!(rule = rule.id, job = delta.jobid, "alert suppressed by cool-down");
                    continue;
                }
            }

            if delta.eventid.is_none() {
                // No event to anchor the alert on; nothing to reference.
                debug!(rule = rule.id, job = delta.jobid, "delta without event, skipped");
                continue;
            }

            if self.take_token(rule.id, now) {
                if let Err(e) = self.dispatch(rule, delta.clone(), now) {
                    error!("alert dispatch setup failed: {e}");
                }
            } else if self.pending.len() < self.config.queue_cap {
                self.pending.push_back(PendingAlert {
                    rule,
                    delta: delta.clone(),
                });
            } else {
                self.dropped += 1;
                warn!(
                    rule = rule.id,
                    total_dropped = self.dropped,
                    "alert dropped: rate-limit backlog full"
                );
            }
        }
        Ok(())
    }

    /// Dispatch rate-limited alerts as their rules regain tokens.
    pub fn drain_pending(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.pending.front() {
            let rule_id = front.rule.id;
            if !self.take_token(rule_id, now) {
                return;
            }
            let pending = self.pending.pop_front().expect("front checked above");
            if let Err(e) = self.dispatch(pending.rule, pending.delta, now) {
                error!("alert dispatch setup failed: {e}");
            }
        }
    }

    /// Drain the queue and wait for in-flight dispatches, bounded by the
    /// flush timeout; whatever remains afterwards is abandoned.
    pub async fn flush(&mut self) {
        let now = Utc::now();
        while let Some(pending) = self.pending.pop_front() {
            if let Err(e) = self.dispatch(pending.rule, pending.delta, now) {
                error!("alert dispatch setup failed during flush: {e}");
            }
        }

        let deadline = self.config.flush_timeout;
        let drained = tokio::time::timeout(deadline, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = self.tasks.len(), "flush timeout: abandoning in-flight alerts");
        }
    }

    /// Build the alert, record the pending row, and hand delivery to a
    /// per-dispatch task.
    fn dispatch(
        &mut self,
        rule: NotifyRule,
        delta: StatusDelta,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(eventid) = delta.eventid else {
            return Ok(());
        };
        let Some(job) = self.store.get_job(delta.jobid)? else {
            return Ok(());
        };
        let events = self.store.get_recent_events(delta.jobid, BODY_EVENT_COUNT)?;
        let output = if rule.include_output {
            self.store.get_output(eventid)?
        } else {
            None
        };

        let subject = format::subject(&job, &delta);
        let body = format::body(
            &job,
            &delta,
            &events,
            output.as_ref(),
            self.config.display_tz,
            rule.include_output,
        );

        let alert_id = self
            .store
            .record_alert(rule.id, delta.jobid, eventid, delta.new, now)?;

        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let retry = self.config.retry.clone();

        self.tasks.spawn(async move {
            let transport = match registry.get(&rule.method) {
                Ok(t) => t,
                Err(e) => {
                    error!(rule = rule.id, "alert undeliverable: {e}");
                    if let Err(e) = store.mark_alert(alert_id, false, Some(&e.to_string())) {
                        error!("failed to record alert outcome: {e}");
                    }
                    return;
                }
            };

            let mut failures = Vec::new();
            let mut max_attempts = 1;
            for address in &rule.address {
                match dispatch_with_retry(transport, address, &subject, &body, &retry).await {
                    Ok(attempts) => max_attempts = max_attempts.max(attempts),
                    Err((attempts, e)) => {
                        failures.push(format!("{address}: {e} (after {attempts} attempts)"))
                    }
                }
            }

            let delivered = failures.is_empty();
            let detail = if delivered {
                (max_attempts > 1).then(|| format!("delivered after {max_attempts} attempts"))
            } else {
                Some(failures.join("; "))
            };
            if let Err(e) = store.mark_alert(alert_id, delivered, detail.as_deref()) {
                error!("failed to record alert outcome: {e}");
            }
            if delivered {
                info!(rule = rule.id, job = delta.jobid, state = %delta.new, "alert delivered");
            } else {
                error!(rule = rule.id, job = delta.jobid, "alert dispatch failed after retries");
            }
        });
        Ok(())
    }

    /// Best-effort broadcast that the monitor is discarding deltas. Sent
    /// once per episode, one message per distinct (method, address); not
    /// recorded as alerts since there is no event to reference.
    fn notify_degraded(&mut self, dropped: u64) {
        error!(dropped, "monitor fan-out degraded: deltas were discarded");
        let rules = match self.store.get_notifications() {
            Ok(rules) => rules,
            Err(e) => {
                error!("cannot load rules for degraded notice: {e}");
                return;
            }
        };

        let mut seen = HashSet::new();
        for rule in rules {
            for address in rule.address {
                if !seen.insert((rule.method.clone(), address.clone())) {
                    continue;
                }
                let registry = Arc::clone(&self.registry);
                let method = rule.method.clone();
                let body = format!(
                    "The crab monitor discarded {dropped} status change(s) because \
                     notification dispatch could not keep up. Alerting is degraded."
                );
                self.tasks.spawn(async move {
                    match registry.get(&method) {
                        Ok(transport) => {
                            if let Err(e) = transport
                                .dispatch(&address, "crab: notifications degraded", &body)
                                .await
                            {
                                error!("degraded notice delivery failed: {e}");
                            }
                        }
                        Err(e) => error!("degraded notice undeliverable: {e}"),
                    }
                });
            }
        }
    }

    fn take_token(&mut self, rule_id: i64, now: DateTime<Utc>) -> bool {
        let burst = self.config.rate_burst;
        let window = self.config.rate_window;
        self.buckets
            .entry(rule_id)
            .or_insert_with(|| TokenBucket::new(burst, window, now))
            .take(now)
    }
}

fn rule_matches(rule: &NotifyRule, delta: &StatusDelta) -> bool {
    let host_ok = rule.host.as_deref().is_none_or(|h| h == delta.host);
    let crabid_ok = rule
        .crabid
        .as_deref()
        .is_none_or(|c| Some(c) == delta.crabid.as_deref());
    host_ok && crabid_ok
}

/// Classic token bucket: `burst` tokens refilled evenly over `window`.
struct TokenBucket {
    tokens: f64,
    burst: f64,
    refill_per_sec: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    fn new(burst: u32, window: Duration, now: DateTime<Utc>) -> Self {
        let window_secs = window.num_seconds().max(1) as f64;
        TokenBucket {
            tokens: f64::from(burst),
            burst: f64::from(burst),
            refill_per_sec: f64::from(burst) / window_secs,
            last_refill: now,
        }
    }

    fn take(&mut self, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.last_refill).num_milliseconds() as f64 / 1000.0;
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.burst);
            self.last_refill = now;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
