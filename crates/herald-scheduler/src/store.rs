use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{types::Value, Connection, OptionalExtension};
use tracing::{debug, instrument, warn};

use crate::{
    clock::{Clock, SystemClock},
    db::{fmt_ts, init_db, parse_ts},
    error::{Result, SchedulerError},
    types::{MessageFields, MessageStatus, ScheduledMessage},
};

/// Default page size for [`MessageStore::list`].
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// Hard cap on a single page.
pub const MAX_LIST_LIMIT: usize = 500;

const COLUMNS: &str = "id, phone, message, reply_message_id, is_forwarded, duration,
                       schedule_at, status, attempts, error, message_id,
                       created_at, updated_at, sent_at";

/// Durable job table for scheduled messages.
///
/// Every state change is a single conditional `UPDATE`, so any number of
/// stores (in this process or others) can share one database file. Each
/// component should own its own store, mirroring one connection per task.
pub struct MessageStore {
    db: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl MessageStore {
    /// Wrap a connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        Self::with_clock(conn, Arc::new(SystemClock))
    }

    pub fn with_clock(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            clock,
        })
    }

    /// In-memory store, handy for tests and throwaway setups.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Poisoning carries no meaning for a SQLite handle.
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> MutexGuard<'_, Connection> {
        self.conn()
    }

    /// Insert a new `pending` row with `attempts = 0`.
    #[instrument(skip(self, fields), fields(phone = %fields.phone))]
    pub fn create(&self, fields: &MessageFields) -> Result<ScheduledMessage> {
        let now = fmt_ts(self.now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scheduled_messages
             (phone, message, reply_message_id, is_forwarded, duration, schedule_at,
              status, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?7)",
            rusqlite::params![
                fields.phone,
                fields.message,
                fields.reply_message_id,
                fields.is_forwarded,
                fields.duration,
                fmt_ts(fields.schedule_at),
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(job_id = id, "scheduled message created");
        fetch_one(&conn, id)?.ok_or(SchedulerError::NotFound { id })
    }

    /// Up to `limit` due rows, oldest `schedule_at` first, ties by id.
    #[instrument(skip(self))]
    pub fn fetch_pending(&self, limit: usize) -> Result<Vec<ScheduledMessage>> {
        let now = fmt_ts(self.now());
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM scheduled_messages
             WHERE status = 'pending' AND schedule_at <= ?1
             ORDER BY schedule_at ASC, id ASC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![now, limit as i64], RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawRow::into_message).collect()
    }

    /// Claim a row: `pending -> sending`, `attempts += 1`.
    ///
    /// Returns `true` only for the single caller whose update actually
    /// changed the row. Losing the race is not an error.
    #[instrument(skip(self))]
    pub fn mark_processing(&self, id: i64) -> Result<bool> {
        let now = fmt_ts(self.now());
        let n = self.conn().execute(
            "UPDATE scheduled_messages
             SET status = 'sending', attempts = attempts + 1, updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            rusqlite::params![now, id],
        )?;
        Ok(n == 1)
    }

    /// Record a successful delivery. Clears any previous error.
    #[instrument(skip(self))]
    pub fn mark_sent(&self, id: i64, provider_message_id: &str, sent_at: DateTime<Utc>) -> Result<()> {
        let now = fmt_ts(self.now());
        let n = self.conn().execute(
            "UPDATE scheduled_messages
             SET status = 'sent', message_id = ?1, sent_at = ?2, error = NULL, updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![provider_message_id, fmt_ts(sent_at), now, id],
        )?;
        if n == 0 {
            return Err(SchedulerError::NotFound { id });
        }
        Ok(())
    }

    /// Record a failed delivery attempt.
    #[instrument(skip(self))]
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let now = fmt_ts(self.now());
        let n = self.conn().execute(
            "UPDATE scheduled_messages
             SET status = 'failed', error = ?1, updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![error, now, id],
        )?;
        if n == 0 {
            return Err(SchedulerError::NotFound { id });
        }
        Ok(())
    }

    /// Return every row stuck in `sending` for at least `older_than` to
    /// `pending`. `attempts` is left alone so the interrupted claim still counts.
    #[instrument(skip(self))]
    pub fn reset_stuck(&self, older_than: Duration) -> Result<usize> {
        let now = self.now();
        let cutoff = fmt_ts(now - older_than);
        let n = self.conn().execute(
            "UPDATE scheduled_messages
             SET status = 'pending', updated_at = ?1
             WHERE status = 'sending' AND updated_at <= ?2",
            rusqlite::params![fmt_ts(now), cutoff],
        )?;
        Ok(n)
    }

    /// Fail stuck `sending` rows that have already used `max_attempts` claims,
    /// so the sweep stops reviving them.
    #[instrument(skip(self))]
    pub fn fail_exhausted(&self, older_than: Duration, max_attempts: u32) -> Result<usize> {
        let now = self.now();
        let cutoff = fmt_ts(now - older_than);
        let reason = format!("exceeded max attempts ({max_attempts}) while stuck in sending");
        let n = self.conn().execute(
            "UPDATE scheduled_messages
             SET status = 'failed', error = ?1, updated_at = ?2
             WHERE status = 'sending' AND updated_at <= ?3 AND attempts >= ?4",
            rusqlite::params![reason, fmt_ts(now), cutoff, max_attempts],
        )?;
        Ok(n)
    }

    /// Page through rows ordered by `schedule_at`, optionally filtered by status.
    ///
    /// `limit` defaults to [`DEFAULT_LIST_LIMIT`] and is capped at [`MAX_LIST_LIMIT`].
    #[instrument(skip(self))]
    pub fn list(
        &self,
        statuses: &[MessageStatus],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<ScheduledMessage>> {
        let limit = match limit {
            Some(0) | None => DEFAULT_LIST_LIMIT,
            Some(n) => n.min(MAX_LIST_LIMIT),
        };
        let offset = offset.unwrap_or(0);

        let mut params: Vec<Value> = statuses
            .iter()
            .map(|s| Value::Text(s.as_str().to_string()))
            .collect();
        let filter = if statuses.is_empty() {
            String::new()
        } else {
            let marks = vec!["?"; statuses.len()].join(", ");
            format!("WHERE status IN ({marks})")
        };
        params.push(Value::Integer(limit as i64));
        params.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));

        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM scheduled_messages
             {filter}
             ORDER BY schedule_at ASC, id ASC
             LIMIT ? OFFSET ?"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawRow::into_message).collect()
    }

    #[instrument(skip(self))]
    pub fn get_by_id(&self, id: i64) -> Result<ScheduledMessage> {
        fetch_one(&self.conn(), id)?.ok_or(SchedulerError::NotFound { id })
    }

    /// Rewrite the editable fields of a `pending`/`failed` row and re-queue it
    /// with a clean slate (`attempts = 0`, no error, no provider id).
    #[instrument(skip(self, fields))]
    pub fn update(&self, id: i64, fields: &MessageFields) -> Result<ScheduledMessage> {
        let now = fmt_ts(self.now());
        let conn = self.conn();
        let n = conn.execute(
            &format!(
                "UPDATE scheduled_messages
                 SET phone = ?1, message = ?2, reply_message_id = ?3, is_forwarded = ?4,
                     duration = ?5, schedule_at = ?6,
                     status = 'pending', attempts = 0, error = NULL,
                     message_id = NULL, sent_at = NULL, updated_at = ?7
                 WHERE id = ?8 AND status IN ({})",
                editable_statuses()
            ),
            rusqlite::params![
                fields.phone,
                fields.message,
                fields.reply_message_id,
                fields.is_forwarded,
                fields.duration,
                fmt_ts(fields.schedule_at),
                now,
                id,
            ],
        )?;
        if n == 0 {
            return Err(not_editable(&conn, id)?);
        }
        fetch_one(&conn, id)?.ok_or(SchedulerError::NotFound { id })
    }

    /// Delete a `pending`/`failed` row.
    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        let n = conn.execute(
            &format!(
                "DELETE FROM scheduled_messages WHERE id = ?1 AND status IN ({})",
                editable_statuses()
            ),
            [id],
        )?;
        if n == 0 {
            return Err(not_editable(&conn, id)?);
        }
        Ok(())
    }

    /// Row counts per status; every status is present, zero if empty.
    pub fn count_by_status(&self) -> Result<BTreeMap<String, u64>> {
        let mut counts: BTreeMap<String, u64> = MessageStatus::ALL
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM scheduled_messages GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            if status.parse::<MessageStatus>().is_err() {
                warn!(%status, "unknown status value in scheduled_messages");
            }
            counts.insert(status, n as u64);
        }
        Ok(counts)
    }
}

/// SQL list of the statuses update/delete accept, e.g. `'pending', 'failed'`.
fn editable_statuses() -> String {
    MessageStatus::ALL
        .iter()
        .filter(|s| s.is_editable())
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Explain why a conditional update/delete touched no row.
fn not_editable(conn: &Connection, id: i64) -> Result<SchedulerError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM scheduled_messages WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        None => Ok(SchedulerError::NotFound { id }),
        Some(raw) => {
            let status = raw.parse().map_err(SchedulerError::Corrupt)?;
            Ok(SchedulerError::Conflict { id, status })
        }
    }
}

fn fetch_one(conn: &Connection, id: i64) -> Result<Option<ScheduledMessage>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM scheduled_messages WHERE id = ?1"),
        [id],
        RawRow::from_row,
    )
    .optional()?
    .map(RawRow::into_message)
    .transpose()
}

/// A row as SQLite stores it, before timestamp/status decoding.
struct RawRow {
    id: i64,
    phone: String,
    message: String,
    reply_message_id: Option<String>,
    is_forwarded: bool,
    duration: Option<i64>,
    schedule_at: String,
    status: String,
    attempts: u32,
    error: Option<String>,
    message_id: Option<String>,
    created_at: String,
    updated_at: String,
    sent_at: Option<String>,
}

impl RawRow {
    /// Column order follows `COLUMNS`.
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            phone: row.get(1)?,
            message: row.get(2)?,
            reply_message_id: row.get(3)?,
            is_forwarded: row.get(4)?,
            duration: row.get(5)?,
            schedule_at: row.get(6)?,
            status: row.get(7)?,
            attempts: row.get(8)?,
            error: row.get(9)?,
            message_id: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            sent_at: row.get(13)?,
        })
    }

    fn into_message(self) -> Result<ScheduledMessage> {
        Ok(ScheduledMessage {
            id: self.id,
            phone: self.phone,
            message: self.message,
            reply_message_id: self.reply_message_id,
            is_forwarded: self.is_forwarded,
            duration: self.duration,
            schedule_at: parse_ts(&self.schedule_at)?,
            status: self.status.parse().map_err(SchedulerError::Corrupt)?,
            attempts: self.attempts,
            error: self.error,
            message_id: self.message_id,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            sent_at: self.sent_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}
