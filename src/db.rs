//! Database module for Nakle
//!
//! Persists the conversation → tool session mapping and per-request usage
//! records. Conversation content is never stored.

mod schema;

pub use schema::*;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Database I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Session Operations ====================

    /// Look up the stored session for a conversation
    pub fn get_session(&self, conversation_id: &str) -> DbResult<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, session_id, cumulative_input_tokens, cumulative_output_tokens,
                    created_at, last_activity_at
             FROM sessions WHERE conversation_id = ?1",
        )?;

        let record = stmt
            .query_row(params![conversation_id], |row| {
                Ok(SessionRecord {
                    conversation_id: row.get(0)?,
                    session_id: row.get(1)?,
                    cumulative: TokenCounts {
                        input_tokens: from_sql_count(row.get(2)?),
                        output_tokens: from_sql_count(row.get(3)?),
                    },
                    created_at: parse_datetime(&row.get::<_, String>(4)?),
                    last_activity_at: parse_datetime(&row.get::<_, String>(5)?),
                })
            })
            .optional()?;
        Ok(record)
    }

    /// Insert or replace the session for a conversation, touching its activity time
    pub fn upsert_session(
        &self,
        conversation_id: &str,
        session_id: &str,
        cumulative: TokenCounts,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let ts = format_datetime(now);

        conn.execute(
            "INSERT INTO sessions (conversation_id, session_id, cumulative_input_tokens,
                                   cumulative_output_tokens, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(conversation_id) DO UPDATE SET
                session_id = excluded.session_id,
                cumulative_input_tokens = excluded.cumulative_input_tokens,
                cumulative_output_tokens = excluded.cumulative_output_tokens,
                last_activity_at = excluded.last_activity_at",
            params![
                conversation_id,
                session_id,
                to_sql_count(cumulative.input_tokens),
                to_sql_count(cumulative.output_tokens),
                ts,
            ],
        )?;
        Ok(())
    }

    /// Drop sessions idle for longer than `ttl`, then trim to `max_sessions`
    /// keeping the most recently active. Returns the number of rows removed.
    pub fn evict_sessions(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
        max_sessions: usize,
    ) -> DbResult<usize> {
        let conn = self.conn.lock().unwrap();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let expired = conn.execute(
            "DELETE FROM sessions WHERE last_activity_at < ?1",
            params![format_datetime(cutoff)],
        )?;

        let over_cap = conn.execute(
            "DELETE FROM sessions WHERE conversation_id IN (
                SELECT conversation_id FROM sessions
                ORDER BY last_activity_at DESC
                LIMIT -1 OFFSET ?1
             )",
            params![i64::try_from(max_sessions).unwrap_or(i64::MAX)],
        )?;

        Ok(expired + over_cap)
    }

    /// Number of stored sessions
    #[allow(dead_code)] // Used in tests
    pub fn session_count(&self) -> DbResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    // ==================== Usage Operations ====================

    /// Record a single usage event
    pub fn record_usage(&self, record: &NewUsageRecord<'_>, now: DateTime<Utc>) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO usage_records
             (timestamp, source, model, input_tokens, output_tokens, total_tokens, conversation_id, request_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                format_datetime(now),
                record.source,
                record.model,
                to_sql_count(record.input_tokens),
                to_sql_count(record.output_tokens),
                to_sql_count(record.total_tokens),
                record.conversation_id,
                record.request_id,
            ],
        )?;
        Ok(())
    }

    /// Usage records matching `filter`, newest first, plus the unpaged total
    pub fn get_usage_records(
        &self,
        filter: &UsageFilter,
        limit: u32,
        offset: u32,
    ) -> DbResult<(Vec<UsageRecord>, u64)> {
        let (where_clause, mut args) = filter_clause(filter);
        let conn = self.conn.lock().unwrap();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM usage_records WHERE {where_clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        args.push(limit.to_string());
        args.push(offset.to_string());
        let mut stmt = conn.prepare(&format!(
            "SELECT timestamp, source, model, input_tokens, output_tokens,
                    total_tokens, conversation_id, request_id
             FROM usage_records
             WHERE {where_clause}
             ORDER BY timestamp DESC, id DESC
             LIMIT CAST(? AS INTEGER) OFFSET CAST(? AS INTEGER)"
        ))?;

        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok(UsageRecord {
                timestamp: row.get(0)?,
                source: row.get(1)?,
                model: row.get(2)?,
                input_tokens: from_sql_count(row.get(3)?),
                output_tokens: from_sql_count(row.get(4)?),
                total_tokens: from_sql_count(row.get(5)?),
                conversation_id: row.get(6)?,
                request_id: row.get(7)?,
            })
        })?;

        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok((records, from_sql_count(total)))
    }

    /// Aggregated usage grouped by source, largest consumers first
    pub fn get_usage_stats(&self, filter: &UsageFilter) -> DbResult<Vec<UsageStats>> {
        let (where_clause, args) = filter_clause(filter);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT source,
                    COUNT(*) AS total_requests,
                    SUM(input_tokens) AS total_input_tokens,
                    SUM(output_tokens) AS total_output_tokens,
                    SUM(total_tokens) AS total_tokens
             FROM usage_records
             WHERE {where_clause}
             GROUP BY source
             ORDER BY total_tokens DESC"
        ))?;

        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok(UsageStats {
                source: row.get(0)?,
                total_requests: from_sql_count(row.get(1)?),
                total_input_tokens: from_sql_count(row.get::<_, Option<i64>>(2)?.unwrap_or(0)),
                total_output_tokens: from_sql_count(row.get::<_, Option<i64>>(3)?.unwrap_or(0)),
                total_tokens: from_sql_count(row.get::<_, Option<i64>>(4)?.unwrap_or(0)),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

fn filter_clause(filter: &UsageFilter) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut args = Vec::new();

    if let Some(source) = &filter.source {
        conditions.push("source = ?");
        args.push(source.clone());
    }
    if let Some(start) = &filter.start_time {
        conditions.push("timestamp >= ?");
        args.push(start.clone());
    }
    if let Some(end) = &filter.end_time {
        conditions.push("timestamp <= ?");
        args.push(end.clone());
    }

    let clause = if conditions.is_empty() {
        "1=1".to_string()
    } else {
        conditions.join(" AND ")
    };
    (clause, args)
}

/// Fixed-width UTC timestamps so string comparison in SQL is chronological
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
