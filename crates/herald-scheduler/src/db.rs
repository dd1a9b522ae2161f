use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// How long a connection waits on a locked database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `scheduled_messages` table (idempotent) plus the two indexes
/// the background loops rely on: the due-query index and the stuck-sweep index.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_messages (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            phone            TEXT    NOT NULL,
            message          TEXT    NOT NULL,
            reply_message_id TEXT,
            is_forwarded     INTEGER NOT NULL DEFAULT 0,
            duration         INTEGER,            -- opaque, passed to the sender
            schedule_at      TEXT    NOT NULL,   -- UTC, see fmt_ts
            status           TEXT    NOT NULL DEFAULT 'pending',
            attempts         INTEGER NOT NULL DEFAULT 0,
            error            TEXT,
            message_id       TEXT,               -- provider-assigned
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL,
            sent_at          TEXT
        ) STRICT;

        -- Due query: WHERE status = 'pending' AND schedule_at <= ? ORDER BY schedule_at, id
        CREATE INDEX IF NOT EXISTS idx_scheduled_messages_due
            ON scheduled_messages (status, schedule_at, id);

        -- Stuck sweep: WHERE status = 'sending' AND updated_at <= ?
        CREATE INDEX IF NOT EXISTS idx_scheduled_messages_stuck
            ON scheduled_messages (status, updated_at);
        ",
    )?;
    Ok(())
}

/// Open a file-backed connection tuned for several writers racing on the
/// same database (WAL + busy timeout), and make sure the schema exists.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Fixed-width RFC 3339 in UTC with microseconds, so text order is time order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}
