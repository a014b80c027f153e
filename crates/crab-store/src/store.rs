use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::warn;

use crab_core::{
    AlertRecord, EventKind, EventRecord, JobConfigRecord, JobOutput, JobRecord, JobState,
    NotifyRule, Severity,
};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::output::OutputStore;

/// The single writer for all durable state.
///
/// Every other component goes through this type; write operations commit
/// fully or return a [`StoreError`], reads may return empty but never
/// partial rows. The connection is shared behind a mutex so HTTP handlers
/// and the monitor can use one store instance.
pub struct CrabStore {
    conn: Arc<Mutex<Connection>>,
    output: Option<Box<dyn OutputStore>>,
}

impl CrabStore {
    /// Wrap an existing connection, initialising the schema.
    pub fn new(conn: Connection, output: Option<Box<dyn OutputStore>>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            output,
        })
    }

    /// Open (or create) the database at `path` with the daemon pragmas.
    pub fn open(path: &str, output: Option<Box<dyn OutputStore>>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::new(conn, output)
    }

    // --- registrations ------------------------------------------------------

    /// Atomic upsert of a registration; the only way jobs come into being.
    ///
    /// Matching is by crabid when one is supplied, else by command text.
    /// A crabid arriving with a changed command retires the old row and
    /// inserts a fresh one (supersession); a crabid arriving for an
    /// existing crabid-less command row adopts that row instead.
    pub fn ensure_job(&self, host: &str, crabid: Option<&str>, command: &str) -> Result<i64> {
        let crabid = normalize_crabid(crabid);
        let now = ts(Utc::now());

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let id = match crabid {
            Some(crabid) => {
                let live: Option<(i64, String, bool)> = tx
                    .query_row(
                        "SELECT id, command, inhibited FROM job
                         WHERE host = ?1 AND crabid = ?2 AND retired IS NULL",
                        rusqlite::params![host, crabid],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;

                match live {
                    Some((id, stored_command, _)) if stored_command == command => {
                        tx.execute(
                            "UPDATE job SET last_seen = ?1 WHERE id = ?2",
                            rusqlite::params![now, id],
                        )?;
                        id
                    }
                    Some((old_id, _, inhibited)) => {
                        // Supersession: same identity, new command. The old
                        // row keeps its history; inhibition and the schedule
                        // follow the identity.
                        tx.execute(
                            "UPDATE job SET retired = ?1 WHERE id = ?2",
                            rusqlite::params![now, old_id],
                        )?;
                        tx.execute(
                            "INSERT INTO job
                             (host, crabid, command, first_seen, last_seen, inhibited)
                             VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                            rusqlite::params![host, crabid, command, now, inhibited],
                        )?;
                        let new_id = tx.last_insert_rowid();
                        tx.execute(
                            "UPDATE jobconfig SET jobid = ?1 WHERE jobid = ?2",
                            rusqlite::params![new_id, old_id],
                        )?;
                        new_id
                    }
                    None => {
                        // Revive an identical retired registration rather
                        // than accumulating duplicates of the same job.
                        let revived: Option<i64> = tx
                            .query_row(
                                "SELECT id FROM job
                                 WHERE host = ?1 AND crabid = ?2 AND command = ?3
                                   AND retired IS NOT NULL
                                 ORDER BY id DESC LIMIT 1",
                                rusqlite::params![host, crabid, command],
                                |row| row.get(0),
                            )
                            .optional()?;

                        if let Some(id) = revived {
                            tx.execute(
                                "UPDATE job SET retired = NULL, last_seen = ?1 WHERE id = ?2",
                                rusqlite::params![now, id],
                            )?;
                            id
                        } else {
                            // Adopt a live command-keyed row: the job
                            // existed before it was given an identifier.
                            let adopted: Option<i64> = tx
                                .query_row(
                                    "SELECT id FROM job
                                     WHERE host = ?1 AND crabid IS NULL
                                       AND command = ?2 AND retired IS NULL",
                                    rusqlite::params![host, command],
                                    |row| row.get(0),
                                )
                                .optional()?;

                            if let Some(id) = adopted {
                                tx.execute(
                                    "UPDATE job SET crabid = ?1, last_seen = ?2 WHERE id = ?3",
                                    rusqlite::params![crabid, now, id],
                                )?;
                                id
                            } else {
                                tx.execute(
                                    "INSERT INTO job
                                     (host, crabid, command, first_seen, last_seen)
                                     VALUES (?1, ?2, ?3, ?4, ?4)",
                                    rusqlite::params![host, crabid, command, now],
                                )?;
                                tx.last_insert_rowid()
                            }
                        }
                    }
                }
            }
            None => {
                // Command-keyed: attach to any live row with this command,
                // identified or not. Multiple copies of the same command
                // cannot be told apart without a crabid.
                let live: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM job
                         WHERE host = ?1 AND command = ?2 AND retired IS NULL
                         ORDER BY id LIMIT 1",
                        rusqlite::params![host, command],
                        |row| row.get(0),
                    )
                    .optional()?;

                if let Some(id) = live {
                    tx.execute(
                        "UPDATE job SET last_seen = ?1 WHERE id = ?2",
                        rusqlite::params![now, id],
                    )?;
                    id
                } else {
                    let revived: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM job
                             WHERE host = ?1 AND crabid IS NULL AND command = ?2
                               AND retired IS NOT NULL
                             ORDER BY id DESC LIMIT 1",
                            rusqlite::params![host, command],
                            |row| row.get(0),
                        )
                        .optional()?;

                    if let Some(id) = revived {
                        tx.execute(
                            "UPDATE job SET retired = NULL, last_seen = ?1 WHERE id = ?2",
                            rusqlite::params![now, id],
                        )?;
                        id
                    } else {
                        tx.execute(
                            "INSERT INTO job (host, command, first_seen, last_seen)
                             VALUES (?1, ?2, ?3, ?3)",
                            rusqlite::params![host, command, now],
                        )?;
                        tx.last_insert_rowid()
                    }
                }
            }
        };

        tx.commit()?;
        Ok(id)
    }

    /// Look up a live registration without creating one.
    pub fn find_job(&self, host: &str, crabid: Option<&str>, command: Option<&str>) -> Result<Option<JobRecord>> {
        let crabid = normalize_crabid(crabid);
        let conn = self.conn.lock().unwrap();

        let job = match (crabid, command) {
            (Some(crabid), _) => conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM job
                              WHERE host = ?1 AND crabid = ?2 AND retired IS NULL"),
                    rusqlite::params![host, crabid],
                    job_from_row,
                )
                .optional()?,
            (None, Some(command)) => conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM job
                              WHERE host = ?1 AND command = ?2 AND retired IS NULL
                              ORDER BY id LIMIT 1"),
                    rusqlite::params![host, command],
                    job_from_row,
                )
                .optional()?,
            (None, None) => None,
        };
        Ok(job)
    }

    pub fn get_job(&self, jobid: i64) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM job WHERE id = ?1"),
                [jobid],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// All registrations, ordered by host then age; retired rows only when
    /// asked for.
    pub fn get_jobs(&self, include_retired: bool) -> Result<Vec<JobRecord>> {
        let where_clause = if include_retired {
            ""
        } else {
            "WHERE retired IS NULL"
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job {where_clause} ORDER BY host ASC, id ASC"
        ))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Retire a registration; it stays for history but leaves liveness.
    pub fn retire_job(&self, jobid: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE job SET retired = ?1 WHERE id = ?2 AND retired IS NULL",
            rusqlite::params![ts(Utc::now()), jobid],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: format!("live job {jobid}"),
            });
        }
        Ok(())
    }

    /// Toggle the admin inhibition flag. Only reflected in start responses;
    /// event logging is never blocked.
    pub fn set_inhibit(&self, jobid: i64, inhibit: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE job SET inhibited = ?1 WHERE id = ?2",
            rusqlite::params![inhibit, jobid],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: format!("job {jobid}"),
            });
        }
        Ok(())
    }

    // --- events -------------------------------------------------------------

    /// Append an event row, routing any captured output to the output store.
    ///
    /// With a `synthetic_key`, the insert is an idempotent no-op when the
    /// key already exists and `Ok(None)` is returned; a daemon restart can
    /// therefore never double-emit monitor events.
    pub fn append_event(
        &self,
        jobid: i64,
        kind: EventKind,
        at: DateTime<Utc>,
        status: Option<i64>,
        output: Option<&JobOutput>,
        synthetic_key: Option<&str>,
    ) -> Result<Option<i64>> {
        let at = ts(at);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO jobevent (jobid, kind, datetime, status, synthetic_key)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![jobid, kind.to_string(), at, status, synthetic_key],
        )?;
        if inserted == 0 {
            // Synthetic key already present.
            return Ok(None);
        }
        let eventid = tx.last_insert_rowid();

        tx.execute(
            "UPDATE job SET last_seen = ?1 WHERE id = ?2",
            rusqlite::params![at, jobid],
        )?;

        if let Some(out) = output {
            if out.stdout.is_some() || out.stderr.is_some() {
                match &self.output {
                    Some(store) => {
                        store.write_output(eventid, out.stdout.as_deref(), out.stderr.as_deref())?
                    }
                    None => {
                        tx.execute(
                            "INSERT OR REPLACE INTO rawoutput (eventid, stdout, stderr)
                             VALUES (?1, ?2, ?3)",
                            rusqlite::params![eventid, out.stdout, out.stderr],
                        )?;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(Some(eventid))
    }

    /// Record a START reported by a wrapper.
    pub fn log_start(&self, jobid: i64, at: DateTime<Utc>) -> Result<i64> {
        let id = self.append_event(jobid, EventKind::Start, at, None, None, None)?;
        Ok(id.expect("non-synthetic insert always returns an id"))
    }

    /// Record a finish-like event (FINISH, ALREADYRUNNING, INHIBITED,
    /// COULDNOTSTART) with its exit status and captured output.
    pub fn log_finish(
        &self,
        jobid: i64,
        kind: EventKind,
        at: DateTime<Utc>,
        status: Option<i64>,
        output: Option<&JobOutput>,
    ) -> Result<i64> {
        let id = self.append_event(jobid, kind, at, status, output, None)?;
        Ok(id.expect("non-synthetic insert always returns an id"))
    }

    /// Record a monitor-materialised warning (LATE, MISSED, TIMEOUT),
    /// keyed for idempotence. Returns `None` when the key already existed.
    pub fn log_warning(
        &self,
        jobid: i64,
        kind: EventKind,
        at: DateTime<Utc>,
        synthetic_key: &str,
    ) -> Result<Option<i64>> {
        self.append_event(jobid, kind, at, None, None, Some(synthetic_key))
    }

    pub fn get_event(&self, eventid: i64) -> Result<Option<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let event = conn
            .query_row(
                "SELECT id, jobid, kind, datetime, status, synthetic_key
                 FROM jobevent WHERE id = ?1",
                [eventid],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Events for a job in ascending id order, optionally after a known id
    /// and/or capped.
    pub fn get_events(
        &self,
        jobid: i64,
        since: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, jobid, kind, datetime, status, synthetic_key FROM jobevent
             WHERE jobid = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
        )?;
        let events = stmt
            .query_map(
                rusqlite::params![jobid, since.unwrap_or(0), limit.map(i64::from).unwrap_or(-1)],
                event_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// The most recent `limit` events for a job, still in ascending order.
    pub fn get_recent_events(&self, jobid: i64, limit: u32) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, jobid, kind, datetime, status, synthetic_key FROM jobevent
             WHERE jobid = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut events = stmt
            .query_map(rusqlite::params![jobid, limit], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }

    /// Newest events across all live jobs, for the chronological feed.
    pub fn get_feed_events(&self, limit: u32) -> Result<Vec<(JobRecord, EventRecord)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS_QUALIFIED},
                    jobevent.id, jobevent.jobid, jobevent.kind,
                    jobevent.datetime, jobevent.status, jobevent.synthetic_key
             FROM jobevent JOIN job ON jobevent.jobid = job.id
             WHERE job.retired IS NULL
             ORDER BY jobevent.id DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok((job_from_row(row)?, event_from_row_at(row, 8)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Recent problem events across all live jobs: everything terminal that
    /// is neither a clean finish nor a LATE warning.
    pub fn get_fail_events(&self, limit: u32) -> Result<Vec<(JobRecord, EventRecord)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS_QUALIFIED},
                    jobevent.id, jobevent.jobid, jobevent.kind,
                    jobevent.datetime, jobevent.status, jobevent.synthetic_key
             FROM jobevent JOIN job ON jobevent.jobid = job.id
             WHERE job.retired IS NULL
               AND jobevent.kind NOT IN ('start', 'late')
               AND NOT (jobevent.kind = 'finish' AND COALESCE(jobevent.status, 0) = 0)
             ORDER BY jobevent.id DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok((job_from_row(row)?, event_from_row_at(row, 8)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Reassemble captured output for a finish event, wherever it lives.
    pub fn get_output(&self, eventid: i64) -> Result<Option<JobOutput>> {
        if let Some(store) = &self.output {
            return store.get_output(eventid);
        }
        let conn = self.conn.lock().unwrap();
        let output = conn
            .query_row(
                "SELECT stdout, stderr FROM rawoutput WHERE eventid = ?1",
                [eventid],
                |row| {
                    Ok(JobOutput {
                        stdout: row.get(0)?,
                        stderr: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(output)
    }

    // --- schedules ----------------------------------------------------------

    /// Set or replace a job's schedule and liveness overrides.
    pub fn set_schedule(
        &self,
        jobid: i64,
        time: Option<&str>,
        timezone: Option<&str>,
        graceperiod: Option<u64>,
        timeout: Option<u64>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobconfig (jobid, time, timezone, graceperiod, timeout)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (jobid) DO UPDATE SET
                 time = excluded.time,
                 timezone = excluded.timezone,
                 graceperiod = excluded.graceperiod,
                 timeout = excluded.timeout",
            rusqlite::params![jobid, time, timezone, graceperiod, timeout],
        )?;
        Ok(())
    }

    pub fn get_config(&self, jobid: i64) -> Result<Option<JobConfigRecord>> {
        let conn = self.conn.lock().unwrap();
        let config = conn
            .query_row(
                "SELECT jobid, time, timezone, graceperiod, timeout
                 FROM jobconfig WHERE jobid = ?1",
                [jobid],
                config_from_row,
            )
            .optional()?;
        Ok(config)
    }

    /// All job configs keyed by job, for the monitor's tick prefetch.
    pub fn get_configs(&self) -> Result<HashMap<i64, JobConfigRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached("SELECT jobid, time, timezone, graceperiod, timeout FROM jobconfig")?;
        let configs = stmt
            .query_map([], config_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(configs.into_iter().map(|c| (c.jobid, c)).collect())
    }

    // --- notification rules -------------------------------------------------

    pub fn get_notifications(&self) -> Result<Vec<NotifyRule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, host, crabid, min_severity, method, address,
                    skip_ok, include_output, cooldown
             FROM jobnotify ORDER BY id",
        )?;
        let rules = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, Option<u64>>(8)?,
                ))
            })?
            .filter_map(|r| {
                let (id, host, crabid, severity, method, address, skip_ok, include_output, cooldown) =
                    match r {
                        Ok(row) => row,
                        Err(e) => {
                            warn!("skipping unreadable notification row: {e}");
                            return None;
                        }
                    };
                let min_severity: Severity = match severity.parse() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(rule = id, "skipping notification rule: {e}");
                        return None;
                    }
                };
                let address: Vec<String> = match serde_json::from_str(&address) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(rule = id, "skipping notification rule with bad address list: {e}");
                        return None;
                    }
                };
                Some(NotifyRule {
                    id,
                    host,
                    crabid,
                    min_severity,
                    method,
                    address,
                    skip_ok,
                    include_output,
                    cooldown,
                })
            })
            .collect();
        Ok(rules)
    }

    /// Transactionally replace the whole rule set.
    ///
    /// Alert rows referencing removed rules keep their history; the
    /// `notifyid` column is nulled by the foreign key. Rule ids greater
    /// than zero are preserved so round-trips are exact.
    pub fn set_notifications(&self, rules: &[NotifyRule]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM jobnotify", [])?;
        for rule in rules {
            let address = serde_json::to_string(&rule.address)?;
            let id = if rule.id > 0 { Some(rule.id) } else { None };
            tx.execute(
                "INSERT INTO jobnotify
                 (id, host, crabid, min_severity, method, address,
                  skip_ok, include_output, cooldown)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id,
                    rule.host,
                    rule.crabid,
                    rule.min_severity.to_string(),
                    rule.method,
                    address,
                    rule.skip_ok,
                    rule.include_output,
                    rule.cooldown,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // --- alerts -------------------------------------------------------------

    /// Insert a pending alert row before dispatch begins.
    pub fn record_alert(
        &self,
        notifyid: i64,
        jobid: i64,
        eventid: i64,
        state: JobState,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobalert (notifyid, jobid, eventid, state, dispatched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![notifyid, jobid, eventid, state.to_string(), ts(at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record the final transport outcome for a pending alert.
    pub fn mark_alert(&self, alertid: i64, delivered: bool, detail: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobalert SET delivered = ?1, detail = ?2 WHERE id = ?3",
            rusqlite::params![delivered, detail, alertid],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: format!("alert {alertid}"),
            });
        }
        Ok(())
    }

    /// The most recent alert for a (rule, job) pair, for deduplication.
    pub fn last_alert(&self, notifyid: i64, jobid: i64) -> Result<Option<AlertRecord>> {
        let conn = self.conn.lock().unwrap();
        let alert = conn
            .query_row(
                "SELECT id, notifyid, jobid, eventid, state, dispatched_at, delivered, detail
                 FROM jobalert WHERE notifyid = ?1 AND jobid = ?2
                 ORDER BY id DESC LIMIT 1",
                rusqlite::params![notifyid, jobid],
                alert_from_row,
            )
            .optional()?;
        Ok(alert)
    }

    // --- retention ----------------------------------------------------------

    /// Delete events older than `retention_days`, their output, and their
    /// delivered alerts. Events referenced by a pending (undelivered) alert
    /// are kept until the alert resolves. Idempotent; returns the number of
    /// events removed.
    pub fn cleanup_events(&self, retention_days: u32, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = ts(now - Duration::days(i64::from(retention_days)));

        let doomed: Vec<i64> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM jobevent
                 WHERE datetime < ?1
                   AND id NOT IN (SELECT eventid FROM jobalert WHERE delivered = 0)",
            )?;
            let ids = stmt
                .query_map([&cutoff], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        if doomed.is_empty() {
            return Ok(0);
        }

        // Output rows in a secondary store are removed outside the main
        // transaction; a failure there leaves the event intact for the next
        // (idempotent) pass.
        if let Some(store) = &self.output {
            for &eventid in &doomed {
                store.delete_output(eventid)?;
            }
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let placeholders = placeholders(doomed.len());
        tx.execute(
            &format!("DELETE FROM jobalert WHERE eventid IN ({placeholders})"),
            rusqlite::params_from_iter(doomed.iter()),
        )?;
        tx.execute(
            &format!("DELETE FROM rawoutput WHERE eventid IN ({placeholders})"),
            rusqlite::params_from_iter(doomed.iter()),
        )?;
        let removed = tx.execute(
            &format!("DELETE FROM jobevent WHERE id IN ({placeholders})"),
            rusqlite::params_from_iter(doomed.iter()),
        )?;
        tx.commit()?;
        Ok(removed)
    }
}

// --- row mapping -----------------------------------------------------------

const JOB_COLUMNS: &str =
    "id, host, crabid, command, first_seen, last_seen, retired, inhibited";
const JOB_COLUMNS_QUALIFIED: &str =
    "job.id, job.host, job.crabid, job.command, job.first_seen, job.last_seen, \
     job.retired, job.inhibited";

fn ts(dt: DateTime<Utc>) -> String {
    // Fixed-width RFC 3339 so TEXT comparison orders correctly.
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn dt_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_dt_col(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}

fn job_from_row(row: &Row) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        host: row.get(1)?,
        crabid: row.get(2)?,
        command: row.get(3)?,
        first_seen: dt_col(row, 4)?,
        last_seen: dt_col(row, 5)?,
        retired: opt_dt_col(row, 6)?,
        inhibited: row.get(7)?,
    })
}

fn event_from_row(row: &Row) -> rusqlite::Result<EventRecord> {
    event_from_row_at(row, 0)
}

fn event_from_row_at(row: &Row, base: usize) -> rusqlite::Result<EventRecord> {
    let kind: String = row.get(base + 2)?;
    let kind = kind.parse::<EventKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(base + 2, Type::Text, e.into())
    })?;
    Ok(EventRecord {
        id: row.get(base)?,
        jobid: row.get(base + 1)?,
        kind,
        datetime: dt_col(row, base + 3)?,
        status: row.get(base + 4)?,
        synthetic_key: row.get(base + 5)?,
    })
}

fn config_from_row(row: &Row) -> rusqlite::Result<JobConfigRecord> {
    Ok(JobConfigRecord {
        jobid: row.get(0)?,
        time: row.get(1)?,
        timezone: row.get(2)?,
        graceperiod: row.get(3)?,
        timeout: row.get(4)?,
    })
}

fn alert_from_row(row: &Row) -> rusqlite::Result<AlertRecord> {
    let state: String = row.get(4)?;
    let state = state
        .parse::<JobState>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?;
    Ok(AlertRecord {
        id: row.get(0)?,
        notifyid: row.get(1)?,
        jobid: row.get(2)?,
        eventid: row.get(3)?,
        state,
        dispatched_at: dt_col(row, 5)?,
        delivered: row.get(6)?,
        detail: row.get(7)?,
    })
}

/// Empty-string crabid and missing crabid are the same business key.
fn normalize_crabid(crabid: Option<&str>) -> Option<&str> {
    crabid.filter(|s| !s.trim().is_empty())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
