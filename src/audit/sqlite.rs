//! `SQLite`-backed audit store
//!
//! Timestamps are stored as UTC text (`YYYY-MM-DD HH:MM:SS.mmm`) so that
//! lexical comparison matches chronological order and `DATE()` works on them.

// SQLite returns i64 for row ids and counts, but they are never negative.
#![allow(clippy::cast_sign_loss)]

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{AuditRecord, AuditStore, LogFilter, LogSort, LogStats, PageRequest, RecordStatus};
use crate::error::AuditError;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const DATE_FORMAT: &str = "%Y-%m-%d";

const SELECT_COLUMNS: &str = "SELECT id, ip_address, endpoint, user_agent, request_data, blocked_reason, status, country_code, created_at FROM blocked_requests";

/// Audit store over a single `SQLite` connection
#[derive(Clone)]
pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
    /// Opens or creates the audit database at `path`, in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::initialize(conn)
    }

    /// Creates an in-memory audit store. Contents are lost on drop.
    pub fn in_memory() -> Result<Self, AuditError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, AuditError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AuditError> {
        self.conn.lock().map_err(|_| AuditError::LockPoisoned)
    }
}

/// WHERE clause plus its positional values.
fn where_clause(filter: &LogFilter) -> (String, Vec<Value>) {
    let mut clauses = vec!["1=1".to_string()];
    let mut values = Vec::new();

    if let Some(status) = filter.status {
        clauses.push("status = ?".to_string());
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(ip) = &filter.ip_search {
        clauses.push("ip_address LIKE ? ESCAPE '\\'".to_string());
        values.push(Value::Text(format!("%{}%", escape_like(ip))));
    }
    if let Some(from) = filter.date_from {
        clauses.push("DATE(created_at) >= ?".to_string());
        values.push(Value::Text(from.format(DATE_FORMAT).to_string()));
    }
    if let Some(to) = filter.date_to {
        clauses.push("DATE(created_at) <= ?".to_string());
        values.push(Value::Text(to.format(DATE_FORMAT).to_string()));
    }

    (clauses.join(" AND "), values)
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let request_data: String = row.get(4)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(8)?;

    let created_at = NaiveDateTime::parse_from_str(&created_at, TIMESTAMP_FORMAT)
        .map_err(|e| conversion_error(8, e))?
        .and_utc();
    let status = RecordStatus::parse(&status).ok_or_else(|| rusqlite::Error::InvalidColumnType(6, "status".to_string(), Type::Text))?;

    Ok(AuditRecord {
        id: Some(row.get::<_, i64>(0)? as u64),
        ip_address: row.get(1)?,
        endpoint: row.get(2)?,
        user_agent: row.get(3)?,
        request_data: serde_json::from_str(&request_data).map_err(|e| conversion_error(4, e))?,
        blocked_reason: row.get(5)?,
        status,
        country_code: row.get(7)?,
        created_at,
    })
}

impl AuditStore for SqliteAuditStore {
    fn append(&self, record: &AuditRecord) -> Result<u64, AuditError> {
        let request_data = serde_json::to_string(&record.request_data)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO blocked_requests (ip_address, endpoint, user_agent, request_data, blocked_reason, status, country_code, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.ip_address,
                record.endpoint,
                record.user_agent,
                request_data,
                record.blocked_reason,
                record.status.as_str(),
                record.country_code,
                format_timestamp(&record.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn query(&self, filter: &LogFilter, sort: LogSort, page: PageRequest) -> Result<Vec<AuditRecord>, AuditError> {
        let (where_sql, mut values) = where_clause(filter);
        // Column and direction come from closed enums, never from raw input.
        let sql = format!(
            "{} WHERE {} ORDER BY {} {}, id {} LIMIT ? OFFSET ?",
            SELECT_COLUMNS,
            where_sql,
            sort.column.column(),
            sort.order.keyword(),
            sort.order.keyword(),
        );
        values.push(Value::Integer(i64::from(page.per_page)));
        values.push(Value::Integer(page.offset() as i64));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values), record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn count(&self, filter: &LogFilter) -> Result<u64, AuditError> {
        let (where_sql, values) = where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM blocked_requests WHERE {}", where_sql);
        let conn = self.lock()?;
        let count: i64 = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count as u64)
    }

    fn export(&self, filter: &LogFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let (where_sql, values) = where_clause(filter);
        let sql = format!(
            "{} WHERE {} ORDER BY created_at DESC, id DESC",
            SELECT_COLUMNS, where_sql
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values), record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn counts_by_day(&self, since: NaiveDate) -> Result<Vec<(NaiveDate, RecordStatus, u64)>, AuditError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DATE(created_at) AS day, status, COUNT(*)
             FROM blocked_requests
             WHERE DATE(created_at) >= ?1
             GROUP BY day, status
             ORDER BY day ASC",
        )?;
        let rows = stmt
            .query_map(params![since.format(DATE_FORMAT).to_string()], |row| {
                let day: String = row.get(0)?;
                let status: String = row.get(1)?;
                let count: i64 = row.get(2)?;
                let day = NaiveDate::parse_from_str(&day, DATE_FORMAT).map_err(|e| conversion_error(0, e))?;
                let status = RecordStatus::parse(&status)
                    .ok_or_else(|| rusqlite::Error::InvalidColumnType(1, "status".to_string(), Type::Text))?;
                Ok((day, status, count as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AuditError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM blocked_requests WHERE created_at < ?1",
            params![format_timestamp(&cutoff)],
        )?;
        Ok(deleted as u64)
    }

    fn clear(&self) -> Result<u64, AuditError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM blocked_requests", [])?;
        Ok(deleted as u64)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<LogStats, AuditError> {
        let today = now.date_naive().format(DATE_FORMAT).to_string();
        let week_start = format_timestamp(&(now - Duration::days(7)));

        let conn = self.lock()?;
        let stats = conn.query_row(
            "SELECT
                COALESCE(SUM(status = 'logged'), 0),
                COALESCE(SUM(status = 'blocked'), 0),
                COALESCE(SUM(status = 'logged' AND DATE(created_at) = ?1), 0),
                COALESCE(SUM(status = 'blocked' AND DATE(created_at) = ?1), 0),
                COALESCE(SUM(status = 'logged' AND created_at >= ?2), 0),
                COALESCE(SUM(status = 'blocked' AND created_at >= ?2), 0),
                COUNT(DISTINCT ip_address)
             FROM blocked_requests",
            params![today, week_start],
            |row| {
                Ok(LogStats {
                    total_logged: row.get::<_, i64>(0)? as u64,
                    total_blocked: row.get::<_, i64>(1)? as u64,
                    logged_today: row.get::<_, i64>(2)? as u64,
                    blocked_today: row.get::<_, i64>(3)? as u64,
                    logged_week: row.get::<_, i64>(4)? as u64,
                    blocked_week: row.get::<_, i64>(5)? as u64,
                    unique_ips: row.get::<_, i64>(6)? as u64,
                })
            },
        )?;
        Ok(stats)
    }
}
