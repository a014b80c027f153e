//! Full-pipeline scenario: a scheduled job misses its fire, the monitor
//! materialises MISSED, the notification engine matches a rule and the
//! alert lands both at the transport and in the alert table.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tokio::sync::mpsc;

use crab_core::{EventKind, JobState, NotifyRule, Severity};
use crab_monitor::{MonitorConfig, MonitorEngine, MonitorEvent};
use crab_notify::{NotifyConfig, NotifyEngine, Transport, TransportError, TransportRegistry};
use crab_store::CrabStore;

struct RecordingTransport {
    sent: Arc<Mutex<Vec<(String, String, String)>>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "email"
    }

    async fn dispatch(
        &self,
        address: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((
            address.to_string(),
            subject.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 4, h, m, s).unwrap()
}

#[tokio::test]
async fn missed_schedule_reaches_the_recipient() {
    let store = Arc::new(CrabStore::new(Connection::open_in_memory().unwrap(), None).unwrap());

    // Scheduled every 5 minutes, 60s grace, alert on MISSED or worse.
    let job = store.ensure_job("hostA", Some("backup"), "/usr/bin/backup").unwrap();
    store
        .set_schedule(job, Some("*/5 * * * *"), Some("UTC"), Some(60), None)
        .unwrap();
    store
        .set_notifications(&[NotifyRule {
            id: 1,
            host: Some("hostA".to_string()),
            crabid: None,
            min_severity: Severity::Missed,
            method: "email".to_string(),
            address: vec!["ops@example.com".to_string()],
            skip_ok: true,
            include_output: false,
            cooldown: None,
        }])
        .unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let mut monitor = MonitorEngine::new(Arc::clone(&store), MonitorConfig::default(), tx);

    let sent = Arc::new(Mutex::new(Vec::new()));
    let mut registry = TransportRegistry::new();
    registry.register(Box::new(RecordingTransport {
        sent: Arc::clone(&sent),
    }));
    let mut notifier = NotifyEngine::new(
        Arc::clone(&store),
        Arc::new(registry),
        NotifyConfig::default(),
    );

    // Fire at 10:05; nothing starts; the first tick past 10:06 must write
    // exactly one MISSED and push one delta.
    monitor.tick(at(10, 6, 1)).unwrap();
    let delta = match rx.try_recv().unwrap() {
        MonitorEvent::Delta(d) => d,
        other => panic!("expected delta, got {other:?}"),
    };
    assert_eq!(delta.new, JobState::Missed);

    notifier.handle_delta(delta, at(10, 6, 1)).unwrap();
    notifier.flush().await;

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (address, subject, body) = &sent[0];
    assert_eq!(address, "ops@example.com");
    assert_eq!(subject, "crab: backup on hostA: missed");
    assert!(body.contains("missed"), "{body}");

    // The alert row references the MISSED event and is marked delivered.
    let alert = store.last_alert(1, job).unwrap().unwrap();
    assert!(alert.delivered);
    let event = store.get_event(alert.eventid).unwrap().unwrap();
    assert_eq!(event.kind, EventKind::Missed);
    assert!(alert.dispatched_at >= event.datetime);

    // Later ticks change nothing: no second MISSED, no second alert.
    monitor.tick(at(10, 6, 31)).unwrap();
    assert!(rx.try_recv().is_err());
}
