//! Event-stream reduction: collapse a job's ordered event log into its
//! current derived state and summary figures.
//!
//! Derivation is a pure function of (events, timeout, now); no state is
//! stored anywhere, so readers and the monitor always agree. Derived
//! state is a single field: the newest decisive event speaks for the job,
//! with no severity merging across events in a window.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crab_core::{EventKind, EventRecord, JobState};

/// How many recent outcome events feed the reliability percentage.
const RELIABILITY_WINDOW: usize = 10;

/// A job's derived status at one instant.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub state: JobState,
    pub last_start: Option<EventRecord>,
    pub last_finish: Option<EventRecord>,
    pub last_nonok_finish: Option<EventRecord>,
    /// Length of the current run of identical outcomes. Warn-tier events
    /// neither extend nor interrupt it.
    pub streak: u32,
    /// Terminal events per kind within the examined window.
    pub counts: HashMap<EventKind, u32>,
    /// Percentage of recent outcomes that were clean finishes. Warn-tier
    /// events stay out of the window entirely.
    pub reliability: u8,
}

impl JobSnapshot {
    fn empty() -> Self {
        JobSnapshot {
            state: JobState::Unknown,
            last_start: None,
            last_finish: None,
            last_nonok_finish: None,
            streak: 0,
            counts: HashMap::new(),
            reliability: 0,
        }
    }
}

/// Reduce an ascending event stream to a [`JobSnapshot`].
///
/// The state comes from the newest decisive event: a trailing `START`
/// means RUNNING until it outlives `timeout`, any terminal kind speaks
/// for itself, and an empty stream is UNKNOWN.
pub fn derive(events: &[EventRecord], timeout: Duration, now: DateTime<Utc>) -> JobSnapshot {
    if events.is_empty() {
        return JobSnapshot::empty();
    }

    let mut snapshot = JobSnapshot::empty();
    snapshot.state = derive_state(events, timeout, now);

    for event in events.iter().rev() {
        match event.kind {
            EventKind::Start if snapshot.last_start.is_none() => {
                snapshot.last_start = Some(event.clone());
            }
            EventKind::Finish => {
                if snapshot.last_finish.is_none() {
                    snapshot.last_finish = Some(event.clone());
                }
                if snapshot.last_nonok_finish.is_none() && event.status.unwrap_or(0) != 0 {
                    snapshot.last_nonok_finish = Some(event.clone());
                }
            }
            _ => {}
        }
    }

    let terminals: Vec<&EventRecord> = events.iter().filter(|e| e.kind.is_terminal()).collect();
    for event in &terminals {
        *snapshot.counts.entry(event.kind).or_insert(0) += 1;
    }

    // Streak and reliability count outcomes only; LATE and the other
    // warn-tier kinds never enter the history they are computed over.
    let outcomes: Vec<&EventRecord> = terminals
        .iter()
        .copied()
        .filter(|e| e.kind.is_outcome())
        .collect();

    let newest_outcome = outcomes.last().map(|e| terminal_state(e));
    if let Some(outcome) = newest_outcome {
        snapshot.streak = outcomes
            .iter()
            .rev()
            .take_while(|e| terminal_state(e) == outcome)
            .count() as u32;
    }

    let recent = outcomes.iter().rev().take(RELIABILITY_WINDOW);
    let (mut ok, mut total) = (0u32, 0u32);
    for event in recent {
        total += 1;
        if event.kind == EventKind::Finish && event.status.unwrap_or(0) == 0 {
            ok += 1;
        }
    }
    if total > 0 {
        snapshot.reliability = (100 * ok / total) as u8;
    }

    snapshot
}

/// Find the newest `START` that is still running past `timeout` and has no
/// `TIMEOUT` event materialised for it yet.
///
/// Used by the monitor to decide when to append a synthetic `TIMEOUT`;
/// idempotence comes from keying that event on the start's id.
pub fn runaway_start<'a>(
    events: &'a [EventRecord],
    timeout: Duration,
    now: DateTime<Utc>,
) -> Option<&'a EventRecord> {
    for event in events.iter().rev() {
        if event.kind == EventKind::Start {
            if now - event.datetime <= timeout {
                return None;
            }
            let key = timeout_key(event);
            let already = events
                .iter()
                .any(|e| e.synthetic_key.as_deref() == Some(key.as_str()));
            return if already { None } else { Some(event) };
        }
        if event.kind.ends_run() {
            return None;
        }
    }
    None
}

/// Idempotence key for a synthetic TIMEOUT on this start event.
pub fn timeout_key(start: &EventRecord) -> String {
    format!("timeout:{}:{}", start.jobid, start.id)
}

fn derive_state(events: &[EventRecord], timeout: Duration, now: DateTime<Utc>) -> JobState {
    for event in events.iter().rev() {
        match event.kind {
            EventKind::Start => {
                return if now - event.datetime > timeout {
                    JobState::Timeout
                } else {
                    JobState::Running
                };
            }
            EventKind::Finish | EventKind::CouldNotStart => return terminal_state(event),
            EventKind::Warn | EventKind::AlreadyRunning | EventKind::Inhibited => {
                return JobState::Warn
            }
            EventKind::Missed => return JobState::Missed,
            EventKind::Late => return JobState::Late,
            EventKind::Timeout => return JobState::Timeout,
        }
    }
    JobState::Unknown
}

fn terminal_state(event: &EventRecord) -> JobState {
    match event.kind {
        EventKind::Finish => {
            if event.status.unwrap_or(0) == 0 {
                JobState::Ok
            } else {
                JobState::Fail
            }
        }
        EventKind::CouldNotStart => JobState::Fail,
        EventKind::Warn | EventKind::AlreadyRunning | EventKind::Inhibited => JobState::Warn,
        EventKind::Missed => JobState::Missed,
        EventKind::Late => JobState::Late,
        EventKind::Timeout => JobState::Timeout,
        EventKind::Start => JobState::Running,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, 10, minute, 0).unwrap()
    }

    fn event(id: i64, kind: EventKind, minute: u32, status: Option<i64>) -> EventRecord {
        EventRecord {
            id,
            jobid: 1,
            kind,
            datetime: at(minute),
            status,
            synthetic_key: None,
        }
    }

    #[test]
    fn no_events_is_unknown() {
        let snapshot = derive(&[], Duration::seconds(300), at(30));
        assert_eq!(snapshot.state, JobState::Unknown);
        assert_eq!(snapshot.reliability, 0);
    }

    #[test]
    fn fresh_start_is_running() {
        let events = vec![event(1, EventKind::Start, 0, None)];
        let snapshot = derive(&events, Duration::seconds(300), at(2));
        assert_eq!(snapshot.state, JobState::Running);
        assert_eq!(snapshot.last_start.as_ref().unwrap().id, 1);
    }

    #[test]
    fn aged_start_without_finish_is_timeout() {
        let events = vec![event(1, EventKind::Start, 0, None)];
        let snapshot = derive(&events, Duration::seconds(300), at(10));
        assert_eq!(snapshot.state, JobState::Timeout);
    }

    #[test]
    fn clean_finish_is_ok_and_nonzero_is_fail() {
        let mut events = vec![
            event(1, EventKind::Start, 0, None),
            event(2, EventKind::Finish, 1, Some(0)),
        ];
        let snapshot = derive(&events, Duration::seconds(300), at(30));
        assert_eq!(snapshot.state, JobState::Ok);
        assert_eq!(snapshot.last_finish.as_ref().unwrap().id, 2);
        assert!(snapshot.last_nonok_finish.is_none());

        events.push(event(3, EventKind::Start, 5, None));
        events.push(event(4, EventKind::Finish, 6, Some(2)));
        let snapshot = derive(&events, Duration::seconds(300), at(30));
        assert_eq!(snapshot.state, JobState::Fail);
        assert_eq!(snapshot.last_nonok_finish.as_ref().unwrap().id, 4);
    }

    #[test]
    fn warn_kinds_are_terminal_but_not_fail() {
        let events = vec![
            event(1, EventKind::Start, 0, None),
            event(2, EventKind::Finish, 1, Some(0)),
            event(3, EventKind::AlreadyRunning, 5, None),
        ];
        let snapshot = derive(&events, Duration::seconds(300), at(6));
        assert_eq!(snapshot.state, JobState::Warn);
    }

    #[test]
    fn start_after_late_clears_it() {
        let events = vec![
            event(1, EventKind::Late, 0, None),
            event(2, EventKind::Start, 2, None),
        ];
        let snapshot = derive(&events, Duration::seconds(300), at(3));
        assert_eq!(snapshot.state, JobState::Running);
    }

    #[test]
    fn missed_event_sets_missed() {
        let events = vec![
            event(1, EventKind::Finish, 0, Some(0)),
            event(2, EventKind::Missed, 10, None),
        ];
        let snapshot = derive(&events, Duration::seconds(300), at(11));
        assert_eq!(snapshot.state, JobState::Missed);
    }

    #[test]
    fn streak_and_reliability_track_recent_outcomes() {
        let events = vec![
            event(1, EventKind::Finish, 0, Some(0)),
            event(2, EventKind::Finish, 1, Some(1)),
            event(3, EventKind::Finish, 2, Some(1)),
        ];
        let snapshot = derive(&events, Duration::seconds(300), at(30));
        assert_eq!(snapshot.state, JobState::Fail);
        assert_eq!(snapshot.streak, 2);
        assert_eq!(snapshot.counts.get(&EventKind::Finish), Some(&3));
        assert_eq!(snapshot.reliability, 33);
    }

    #[test]
    fn warn_tier_events_stay_out_of_streak_and_reliability() {
        // Clean finishes interleaved with LATE warnings: the warnings set
        // the displayed state but never dilute the run history.
        let events = vec![
            event(1, EventKind::Finish, 0, Some(0)),
            event(2, EventKind::Late, 1, None),
            event(3, EventKind::Finish, 2, Some(0)),
            event(4, EventKind::Late, 3, None),
        ];
        let snapshot = derive(&events, Duration::seconds(300), at(30));
        assert_eq!(snapshot.state, JobState::Late);
        assert_eq!(snapshot.reliability, 100);
        assert_eq!(snapshot.streak, 2);
        // The warnings still show up in the per-kind counts.
        assert_eq!(snapshot.counts.get(&EventKind::Late), Some(&2));
    }

    #[test]
    fn inhibited_runs_do_not_dilute_reliability() {
        let events = vec![
            event(1, EventKind::Finish, 0, Some(1)),
            event(2, EventKind::Inhibited, 1, None),
            event(3, EventKind::AlreadyRunning, 2, None),
        ];
        let snapshot = derive(&events, Duration::seconds(300), at(30));
        assert_eq!(snapshot.state, JobState::Warn);
        assert_eq!(snapshot.reliability, 0);
        assert_eq!(snapshot.streak, 1);
    }

    #[test]
    fn runaway_start_detection_is_idempotent() {
        let mut events = vec![event(1, EventKind::Start, 0, None)];
        let timeout = Duration::seconds(300);

        // Too young at +2 minutes.
        assert!(runaway_start(&events, timeout, at(2)).is_none());
        // Past timeout at +10 minutes.
        let start = runaway_start(&events, timeout, at(10)).expect("runaway");
        assert_eq!(start.id, 1);

        // A materialised TIMEOUT keyed on the start suppresses re-detection.
        let key = timeout_key(&events[0]);
        events.push(EventRecord {
            id: 2,
            jobid: 1,
            kind: EventKind::Timeout,
            datetime: at(10),
            status: None,
            synthetic_key: Some(key),
        });
        assert!(runaway_start(&events, timeout, at(20)).is_none());
    }

    #[test]
    fn late_warning_does_not_end_a_run() {
        // START, then a LATE for a different fire: still running, and still
        // eligible for timeout detection.
        let events = vec![
            event(1, EventKind::Start, 0, None),
            event(2, EventKind::Late, 5, None),
        ];
        assert!(runaway_start(&events, Duration::seconds(300), at(2)).is_none());
        assert!(runaway_start(&events, Duration::seconds(300), at(10)).is_some());
    }
}
