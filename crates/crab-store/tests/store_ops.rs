//! Store behaviour: registration identity, event ordering, rule replace,
//! alert lifecycle, retention.

use chrono::{Duration, Utc};
use rusqlite::Connection;

use crab_core::{EventKind, JobOutput, JobState, NotifyRule, Severity};
use crab_store::{CrabStore, SqliteOutputStore};

fn store() -> CrabStore {
    CrabStore::new(Connection::open_in_memory().unwrap(), None).unwrap()
}

#[test]
fn ensure_job_is_idempotent() {
    let store = store();
    let first = store.ensure_job("hostA", Some("backup"), "/usr/bin/backup").unwrap();
    for _ in 0..5 {
        let id = store.ensure_job("hostA", Some("backup"), "/usr/bin/backup").unwrap();
        assert_eq!(id, first);
    }
    assert_eq!(store.get_jobs(false).unwrap().len(), 1);
}

#[test]
fn reregistration_with_new_command_supersedes() {
    let store = store();
    let old = store.ensure_job("h", Some("j"), "cmd1").unwrap();
    let new = store.ensure_job("h", Some("j"), "cmd2").unwrap();
    assert_ne!(old, new);

    let live = store.get_jobs(false).unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, new);
    assert_eq!(live[0].command, "cmd2");

    let all = store.get_jobs(true).unwrap();
    assert_eq!(all.len(), 2);
    let retired = all.iter().find(|j| j.id == old).unwrap();
    assert!(retired.retired.is_some());
    assert_eq!(retired.command, "cmd1");
}

#[test]
fn supersession_carries_inhibition_and_schedule() {
    let store = store();
    let old = store.ensure_job("h", Some("j"), "cmd1").unwrap();
    store.set_inhibit(old, true).unwrap();
    store
        .set_schedule(old, Some("0 4 * * *"), None, Some(120), None)
        .unwrap();

    let new = store.ensure_job("h", Some("j"), "cmd2").unwrap();
    assert!(store.get_job(new).unwrap().unwrap().inhibited);
    let config = store.get_config(new).unwrap().expect("schedule follows identity");
    assert_eq!(config.time.as_deref(), Some("0 4 * * *"));
    assert!(store.get_config(old).unwrap().is_none());
}

#[test]
fn crabid_adopts_existing_command_row() {
    let store = store();
    let anon = store.ensure_job("h", None, "/usr/bin/backup").unwrap();
    let named = store.ensure_job("h", Some("backup"), "/usr/bin/backup").unwrap();
    assert_eq!(anon, named);
    let job = store.get_job(named).unwrap().unwrap();
    assert_eq!(job.crabid.as_deref(), Some("backup"));
}

#[test]
fn empty_crabid_is_command_keyed() {
    let store = store();
    let a = store.ensure_job("h", Some(""), "cmd").unwrap();
    let b = store.ensure_job("h", None, "cmd").unwrap();
    assert_eq!(a, b);
}

#[test]
fn commandless_lookup_attaches_to_named_row() {
    let store = store();
    let named = store.ensure_job("h", Some("backup"), "cmd").unwrap();
    let attached = store.ensure_job("h", None, "cmd").unwrap();
    assert_eq!(named, attached);
}

#[test]
fn event_append_then_read_roundtrip() {
    let store = store();
    let job = store.ensure_job("h", Some("j"), "cmd").unwrap();
    let now = Utc::now();

    let start = store.log_start(job, now).unwrap();
    let finish = store
        .log_finish(
            job,
            EventKind::Finish,
            now + Duration::seconds(5),
            Some(0),
            Some(&JobOutput {
                stdout: Some("done\n".to_string()),
                stderr: None,
            }),
        )
        .unwrap();

    let events = store.get_events(job, None, None).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].id, start);
    assert_eq!(events[0].kind, EventKind::Start);
    assert_eq!(events.last().unwrap().id, finish);
    assert_eq!(events.last().unwrap().status, Some(0));

    // Ids ascend and timestamps never run backwards.
    assert!(events.windows(2).all(|w| w[0].id < w[1].id));
    assert!(events.windows(2).all(|w| w[0].datetime <= w[1].datetime));

    let output = store.get_output(finish).unwrap().unwrap();
    assert_eq!(output.stdout.as_deref(), Some("done\n"));
    assert_eq!(output.stderr, None);
}

#[test]
fn synthetic_events_are_idempotent() {
    let store = store();
    let job = store.ensure_job("h", Some("j"), "cmd").unwrap();
    let now = Utc::now();
    let key = format!("missed:{job}:2026-08-02T10:00:00Z");

    let first = store.log_warning(job, EventKind::Missed, now, &key).unwrap();
    assert!(first.is_some());
    let second = store.log_warning(job, EventKind::Missed, now, &key).unwrap();
    assert!(second.is_none());
    assert_eq!(store.get_events(job, None, None).unwrap().len(), 1);
}

#[test]
fn get_events_since_and_limit() {
    let store = store();
    let job = store.ensure_job("h", Some("j"), "cmd").unwrap();
    let now = Utc::now();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(store.log_start(job, now + Duration::seconds(i)).unwrap());
    }

    let after = store.get_events(job, Some(ids[2]), None).unwrap();
    assert_eq!(after.iter().map(|e| e.id).collect::<Vec<_>>(), &ids[3..]);

    let capped = store.get_events(job, None, Some(2)).unwrap();
    assert_eq!(capped.len(), 2);
    assert_eq!(capped[0].id, ids[0]);

    let recent = store.get_recent_events(job, 2).unwrap();
    assert_eq!(recent.iter().map(|e| e.id).collect::<Vec<_>>(), &ids[3..]);
}

#[test]
fn notification_replace_roundtrip() {
    let store = store();
    let rules = vec![
        NotifyRule {
            id: 1,
            host: Some("hostA".to_string()),
            crabid: None,
            min_severity: Severity::Warn,
            method: "email".to_string(),
            address: vec!["ops@example.com".to_string(), "oncall@example.com".to_string()],
            skip_ok: true,
            include_output: true,
            cooldown: Some(600),
        },
        NotifyRule {
            id: 2,
            host: None,
            crabid: Some("backup".to_string()),
            min_severity: Severity::Fail,
            method: "command".to_string(),
            address: vec!["/usr/local/bin/page".to_string()],
            skip_ok: false,
            include_output: false,
            cooldown: None,
        },
    ];

    store.set_notifications(&rules).unwrap();
    assert_eq!(store.get_notifications().unwrap(), rules);

    // Replace is full, not additive.
    store.set_notifications(&rules[..1]).unwrap();
    assert_eq!(store.get_notifications().unwrap(), rules[..1]);
}

#[test]
fn alert_lifecycle_and_dedup_lookup() {
    let store = store();
    let job = store.ensure_job("h", Some("j"), "cmd").unwrap();
    let now = Utc::now();
    let event = store
        .log_finish(job, EventKind::Finish, now, Some(1), None)
        .unwrap();

    let rules = vec![NotifyRule {
        id: 1,
        host: None,
        crabid: None,
        min_severity: Severity::Ok,
        method: "email".to_string(),
        address: vec!["ops@example.com".to_string()],
        skip_ok: false,
        include_output: false,
        cooldown: None,
    }];
    store.set_notifications(&rules).unwrap();

    let alert = store.record_alert(1, job, event, JobState::Fail, now).unwrap();
    let last = store.last_alert(1, job).unwrap().unwrap();
    assert_eq!(last.id, alert);
    assert!(!last.delivered);
    assert_eq!(last.state, JobState::Fail);
    assert!(last.dispatched_at >= now - Duration::seconds(1));

    store.mark_alert(alert, true, Some("ok after 2 attempts")).unwrap();
    let last = store.last_alert(1, job).unwrap().unwrap();
    assert!(last.delivered);
    assert_eq!(last.detail.as_deref(), Some("ok after 2 attempts"));
}

#[test]
fn cleanup_keeps_events_with_pending_alerts() {
    let store = store();
    let job = store.ensure_job("h", Some("j"), "cmd").unwrap();
    let now = Utc::now();
    let old = now - Duration::days(30);

    let kept = store
        .log_finish(job, EventKind::Finish, old, Some(1), None)
        .unwrap();
    let dropped = store
        .log_finish(
            job,
            EventKind::Finish,
            old,
            Some(0),
            Some(&JobOutput {
                stdout: Some("x".to_string()),
                stderr: None,
            }),
        )
        .unwrap();
    let fresh = store.log_start(job, now).unwrap();

    store.set_notifications(&[NotifyRule {
        id: 1,
        host: None,
        crabid: None,
        min_severity: Severity::Ok,
        method: "email".to_string(),
        address: vec!["a@example.com".to_string()],
        skip_ok: false,
        include_output: false,
        cooldown: None,
    }]).unwrap();
    // Pending alert pins `kept`; a delivered alert does not pin `dropped`.
    store.record_alert(1, job, kept, JobState::Fail, now).unwrap();
    let done = store.record_alert(1, job, dropped, JobState::Ok, now).unwrap();
    store.mark_alert(done, true, None).unwrap();

    let removed = store.cleanup_events(7, now).unwrap();
    assert_eq!(removed, 1);

    let ids: Vec<i64> = store
        .get_events(job, None, None)
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert!(ids.contains(&kept));
    assert!(ids.contains(&fresh));
    assert!(!ids.contains(&dropped));
    assert!(store.get_output(dropped).unwrap().is_none());

    // Second pass is a no-op.
    assert_eq!(store.cleanup_events(7, now).unwrap(), 0);
}

#[test]
fn output_routes_to_secondary_store() {
    let output = SqliteOutputStore::new(Connection::open_in_memory().unwrap()).unwrap();
    let store = CrabStore::new(
        Connection::open_in_memory().unwrap(),
        Some(Box::new(output)),
    )
    .unwrap();

    let job = store.ensure_job("h", Some("j"), "cmd").unwrap();
    let event = store
        .log_finish(
            job,
            EventKind::Finish,
            Utc::now(),
            Some(0),
            Some(&JobOutput {
                stdout: Some("routed".to_string()),
                stderr: Some("err".to_string()),
            }),
        )
        .unwrap();

    // Reads reassemble transparently.
    let out = store.get_output(event).unwrap().unwrap();
    assert_eq!(out.stdout.as_deref(), Some("routed"));
    assert_eq!(out.stderr.as_deref(), Some("err"));
}

#[test]
fn retire_job_excludes_from_live_listing() {
    let store = store();
    let job = store.ensure_job("h", Some("j"), "cmd").unwrap();
    store.retire_job(job).unwrap();
    assert!(store.get_jobs(false).unwrap().is_empty());
    assert_eq!(store.get_jobs(true).unwrap().len(), 1);
    assert!(store.retire_job(job).is_err());
}

#[test]
fn fail_events_exclude_clean_finishes_and_late() {
    let store = store();
    let job = store.ensure_job("h", Some("j"), "cmd").unwrap();
    let now = Utc::now();
    store.log_start(job, now).unwrap();
    store.log_finish(job, EventKind::Finish, now, Some(0), None).unwrap();
    store.log_finish(job, EventKind::Finish, now, Some(2), None).unwrap();
    store.log_warning(job, EventKind::Late, now, "late:1:x").unwrap();
    store.log_warning(job, EventKind::Missed, now, "missed:1:x").unwrap();

    let fails = store.get_fail_events(10).unwrap();
    let kinds: Vec<EventKind> = fails.iter().map(|(_, e)| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Missed, EventKind::Finish]);
    assert_eq!(fails[1].1.status, Some(2));
    assert_eq!(fails[0].0.id, job);
}
