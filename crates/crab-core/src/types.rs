use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a job lifecycle event, as stored in the event log.
///
/// `Start`, `Finish`, `AlreadyRunning`, `Inhibited` and `CouldNotStart` are
/// reported by wrappers; `Late`, `Missed` and `Timeout` are materialised by
/// the liveness monitor; `Warn` is reserved for out-of-band warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Finish,
    Warn,
    AlreadyRunning,
    Inhibited,
    Missed,
    Late,
    Timeout,
    CouldNotStart,
}

impl EventKind {
    /// Whether this kind settles a job's derived state; everything but
    /// `Start` does.
    pub fn is_terminal(self) -> bool {
        !matches!(self, EventKind::Start)
    }

    /// Whether this kind ends an in-flight run. `Missed`, `Late` and `Warn`
    /// describe the schedule, not the running process, so a `Start` stays
    /// live across them.
    pub fn ends_run(self) -> bool {
        matches!(
            self,
            EventKind::Finish
                | EventKind::AlreadyRunning
                | EventKind::Inhibited
                | EventKind::Timeout
                | EventKind::CouldNotStart
        )
    }

    /// Whether this kind is a counted run outcome. Warn-tier kinds
    /// (`Warn`, `AlreadyRunning`, `Inhibited`, `Late`) still settle
    /// derived state but stay out of streak and reliability history.
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            EventKind::Finish
                | EventKind::Missed
                | EventKind::Timeout
                | EventKind::CouldNotStart
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Start => "start",
            EventKind::Finish => "finish",
            EventKind::Warn => "warn",
            EventKind::AlreadyRunning => "alreadyrunning",
            EventKind::Inhibited => "inhibited",
            EventKind::Missed => "missed",
            EventKind::Late => "late",
            EventKind::Timeout => "timeout",
            EventKind::CouldNotStart => "couldnotstart",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "start" => Ok(EventKind::Start),
            "finish" => Ok(EventKind::Finish),
            "warn" => Ok(EventKind::Warn),
            "alreadyrunning" => Ok(EventKind::AlreadyRunning),
            "inhibited" => Ok(EventKind::Inhibited),
            "missed" => Ok(EventKind::Missed),
            "late" => Ok(EventKind::Late),
            "timeout" => Ok(EventKind::Timeout),
            "couldnotstart" => Ok(EventKind::CouldNotStart),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Derived state of a job at a point in time.
///
/// Never stored as authoritative state; always recomputed from the event
/// log plus liveness evaluation at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Unknown,
    Running,
    Ok,
    Fail,
    Warn,
    Missed,
    Late,
    Timeout,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Unknown => "unknown",
            JobState::Running => "running",
            JobState::Ok => "ok",
            JobState::Fail => "fail",
            JobState::Warn => "warn",
            JobState::Missed => "missed",
            JobState::Late => "late",
            JobState::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(JobState::Unknown),
            "running" => Ok(JobState::Running),
            "ok" => Ok(JobState::Ok),
            "fail" => Ok(JobState::Fail),
            "warn" => Ok(JobState::Warn),
            "missed" => Ok(JobState::Missed),
            "late" => Ok(JobState::Late),
            "timeout" => Ok(JobState::Timeout),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Alert severity, ordered from least to most severe.
///
/// The derive of `Ord` relies on declaration order; do not reorder variants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warn,
    Late,
    Missed,
    Timeout,
    Fail,
}

impl Severity {
    /// Severity of a derived job state.
    pub fn of_state(state: JobState) -> Severity {
        match state {
            JobState::Unknown | JobState::Running | JobState::Ok => Severity::Ok,
            JobState::Warn => Severity::Warn,
            JobState::Late => Severity::Late,
            JobState::Missed => Severity::Missed,
            JobState::Timeout => Severity::Timeout,
            JobState::Fail => Severity::Fail,
        }
    }

    /// Severity of a single event, given its kind and exit status.
    pub fn of_event(kind: EventKind, status: Option<i64>) -> Severity {
        match kind {
            EventKind::Start => Severity::Ok,
            EventKind::Finish => {
                if status.unwrap_or(0) == 0 {
                    Severity::Ok
                } else {
                    Severity::Fail
                }
            }
            EventKind::Warn | EventKind::AlreadyRunning | EventKind::Inhibited => Severity::Warn,
            EventKind::Late => Severity::Late,
            EventKind::Missed => Severity::Missed,
            EventKind::Timeout => Severity::Timeout,
            EventKind::CouldNotStart => Severity::Fail,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Ok => "ok",
            Severity::Warn => "warn",
            Severity::Late => "late",
            Severity::Missed => "missed",
            Severity::Timeout => "timeout",
            Severity::Fail => "fail",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Severity::Ok),
            "warn" => Ok(Severity::Warn),
            "late" => Ok(Severity::Late),
            "missed" => Ok(Severity::Missed),
            "timeout" => Ok(Severity::Timeout),
            "fail" => Ok(Severity::Fail),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// A job registration row.
///
/// Registrations are created implicitly on first observed event and never
/// hard-deleted; `retired` is set on supersession or explicit admin action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Row ID, the internal job reference.
    pub id: i64,
    /// Reporting host, free-form.
    pub host: String,
    /// Caller-supplied stable identifier; `None` means the command text is
    /// the business key.
    pub crabid: Option<String>,
    /// Command text as reported by the wrapper.
    pub command: String,
    /// First time any event for this registration was observed.
    pub first_seen: DateTime<Utc>,
    /// Most recent event time.
    pub last_seen: DateTime<Utc>,
    /// When the registration was retired, if it was.
    pub retired: Option<DateTime<Utc>>,
    /// Admin inhibition flag; reflected in start responses, never blocks
    /// event logging.
    pub inhibited: bool,
}

/// One append-only event log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic event ID (log-wide).
    pub id: i64,
    /// Owning job row ID.
    pub jobid: i64,
    pub kind: EventKind,
    /// Server-assigned receive time (UTC).
    pub datetime: DateTime<Utc>,
    /// Exit status for finish-like events.
    pub status: Option<i64>,
    /// Idempotence key for monitor-materialised events.
    pub synthetic_key: Option<String>,
}

/// Per-job schedule and liveness configuration, set out-of-band.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfigRecord {
    pub jobid: i64,
    /// Five-field cron specification.
    pub time: Option<String>,
    /// IANA zone name; the daemon default applies when unset.
    pub timezone: Option<String>,
    /// Seconds a START may arrive late before MISSED.
    pub graceperiod: Option<u64>,
    /// Seconds a START may run without FINISH before TIMEOUT.
    pub timeout: Option<u64>,
}

/// A notification rule: who gets told what.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyRule {
    pub id: i64,
    /// Restrict to events from this host; `None` matches all hosts.
    pub host: Option<String>,
    /// Restrict to this crabid; `None` matches all jobs.
    pub crabid: Option<String>,
    pub min_severity: Severity,
    /// Transport name, resolved against the registry (e.g. "email").
    pub method: String,
    /// One or more transport addresses.
    pub address: Vec<String>,
    /// Suppress alerts for OK transitions.
    pub skip_ok: bool,
    /// Attach captured job output to the alert body.
    pub include_output: bool,
    /// Dedup window in seconds; the daemon default applies when unset.
    pub cooldown: Option<u64>,
}

/// A dispatched (or pending) alert row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    /// Originating rule; `None` once the rule set was replaced.
    pub notifyid: Option<i64>,
    pub jobid: i64,
    /// The event that triggered the alert. Always resolvable.
    pub eventid: i64,
    /// Derived state the alert reported.
    pub state: JobState,
    pub dispatched_at: DateTime<Utc>,
    /// False while dispatch is pending or after it ultimately failed.
    pub delivered: bool,
    /// Transport result detail (error text, attempt count).
    pub detail: Option<String>,
}

/// Captured stdout/stderr for a finish event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_is_least_to_most_severe() {
        assert!(Severity::Ok < Severity::Warn);
        assert!(Severity::Warn < Severity::Late);
        assert!(Severity::Late < Severity::Missed);
        assert!(Severity::Missed < Severity::Timeout);
        assert!(Severity::Timeout < Severity::Fail);
    }

    #[test]
    fn event_kind_roundtrip() {
        for kind in [
            EventKind::Start,
            EventKind::Finish,
            EventKind::Warn,
            EventKind::AlreadyRunning,
            EventKind::Inhibited,
            EventKind::Missed,
            EventKind::Late,
            EventKind::Timeout,
            EventKind::CouldNotStart,
        ] {
            let s = kind.to_string();
            assert_eq!(s.parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn finish_severity_depends_on_status() {
        assert_eq!(Severity::of_event(EventKind::Finish, Some(0)), Severity::Ok);
        assert_eq!(Severity::of_event(EventKind::Finish, None), Severity::Ok);
        assert_eq!(
            Severity::of_event(EventKind::Finish, Some(2)),
            Severity::Fail
        );
    }

    #[test]
    fn start_is_the_only_non_terminal_kind() {
        assert!(!EventKind::Start.is_terminal());
        assert!(EventKind::Warn.is_terminal());
        assert!(EventKind::Finish.is_terminal());
        assert!(EventKind::Missed.is_terminal());
        assert!(!EventKind::Missed.ends_run());
        assert!(EventKind::Timeout.ends_run());
        assert!(!EventKind::Start.ends_run());
    }

    #[test]
    fn warn_tier_kinds_are_not_outcomes() {
        for kind in [
            EventKind::Finish,
            EventKind::Missed,
            EventKind::Timeout,
            EventKind::CouldNotStart,
        ] {
            assert!(kind.is_outcome(), "{kind} should count as an outcome");
        }
        for kind in [
            EventKind::Start,
            EventKind::Warn,
            EventKind::AlreadyRunning,
            EventKind::Inhibited,
            EventKind::Late,
        ] {
            assert!(!kind.is_outcome(), "{kind} should not count as an outcome");
        }
    }
}
