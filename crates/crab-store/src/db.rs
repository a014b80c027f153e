use rusqlite::Connection;

use crate::error::Result;

/// Initialise the daemon schema in `conn`. Safe to call on every startup
/// (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job (
            id          INTEGER PRIMARY KEY,
            host        TEXT    NOT NULL,
            crabid      TEXT,               -- NULL: command text is the key
            command     TEXT    NOT NULL,
            first_seen  TEXT    NOT NULL,   -- RFC 3339 UTC
            last_seen   TEXT    NOT NULL,
            retired     TEXT,               -- retirement timestamp or NULL
            inhibited   INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        -- At most one live registration per (host, crabid) and per
        -- (host, command) among crabid-less rows.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_job_live_crabid
            ON job (host, crabid) WHERE retired IS NULL AND crabid IS NOT NULL;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_job_live_command
            ON job (host, command) WHERE retired IS NULL AND crabid IS NULL;

        -- AUTOINCREMENT keeps event IDs monotonic across retention deletes.
        CREATE TABLE IF NOT EXISTS jobevent (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            jobid         INTEGER NOT NULL REFERENCES job (id),
            kind          TEXT    NOT NULL,
            datetime      TEXT    NOT NULL,   -- RFC 3339 UTC, server-assigned
            status        INTEGER,            -- exit status for finish kinds
            synthetic_key TEXT UNIQUE         -- monitor idempotence key
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_jobevent_job ON jobevent (jobid, id);
        CREATE INDEX IF NOT EXISTS idx_jobevent_datetime ON jobevent (datetime);

        CREATE TABLE IF NOT EXISTS jobconfig (
            id          INTEGER PRIMARY KEY,
            jobid       INTEGER NOT NULL UNIQUE REFERENCES job (id),
            time        TEXT,               -- five-field cron spec
            timezone    TEXT,               -- IANA zone name
            graceperiod INTEGER,            -- seconds
            timeout     INTEGER             -- seconds
        ) STRICT;

        CREATE TABLE IF NOT EXISTS jobnotify (
            id             INTEGER PRIMARY KEY,
            host           TEXT,            -- NULL matches any host
            crabid         TEXT,            -- NULL matches any job
            min_severity   TEXT    NOT NULL DEFAULT 'warn',
            method         TEXT    NOT NULL,
            address        TEXT    NOT NULL, -- JSON array of strings
            skip_ok        INTEGER NOT NULL DEFAULT 1,
            include_output INTEGER NOT NULL DEFAULT 0,
            cooldown       INTEGER           -- dedup seconds; NULL = default
        ) STRICT;

        CREATE TABLE IF NOT EXISTS jobalert (
            id            INTEGER PRIMARY KEY,
            notifyid      INTEGER REFERENCES jobnotify (id) ON DELETE SET NULL,
            jobid         INTEGER NOT NULL REFERENCES job (id),
            eventid       INTEGER NOT NULL REFERENCES jobevent (id),
            state         TEXT    NOT NULL,
            dispatched_at TEXT    NOT NULL,
            delivered     INTEGER NOT NULL DEFAULT 0,
            detail        TEXT
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_jobalert_rule_job
            ON jobalert (notifyid, jobid, id);
        ",
    )?;

    init_rawoutput(conn)?;
    Ok(())
}

/// The `rawoutput` table lives either in the main database or in the
/// configured output store, so its DDL is shared. No foreign key: when the
/// table sits in a second database file it cannot reference `jobevent`.
pub fn init_rawoutput(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rawoutput (
            eventid INTEGER PRIMARY KEY,
            stdout  TEXT,
            stderr  TEXT
        ) STRICT;
        ",
    )?;
    Ok(())
}
