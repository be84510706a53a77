//! Audit log of flagged checkout requests
//!
//! Every request that raises at least one flag is appended here with its
//! outcome. Records are never modified; they leave the log only through an
//! explicit clear or the retention sweep.

mod sqlite;

pub use sqlite::SqliteAuditStore;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::AuditError;
use crate::signals::Flag;

/// Default page size for log listings
pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 500;
/// Longest daily series served, in days before today
pub const MAX_SERIES_DAYS: u32 = 366;

/// Outcome stored with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Logged,
    Blocked,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Logged => "logged",
            RecordStatus::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "logged" => Some(RecordStatus::Logged),
            "blocked" => Some(RecordStatus::Blocked),
            _ => None,
        }
    }
}

/// Request context serialized alongside each record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDetails {
    pub flags: Vec<Flag>,
    pub score: u32,
    pub threshold: u32,
    pub test_mode: bool,
    pub method: String,
    pub referer: String,
    /// `yes` when the client sent a token cookie at all
    pub has_token: String,
}

/// One flagged request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Assigned by the store on append
    pub id: Option<u64>,
    pub ip_address: String,
    pub endpoint: String,
    pub user_agent: String,
    pub request_data: RequestDetails,
    pub blocked_reason: String,
    pub status: RecordStatus,
    pub country_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Listing filter. Every field is optional; `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub status: Option<RecordStatus>,
    /// Substring of the client IP
    pub ip_search: Option<String>,
    /// Inclusive calendar day bounds on `created_at`
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl LogFilter {
    /// Build a filter from raw user input.
    ///
    /// Unknown statuses (including `all`) and unparseable dates are dropped
    /// rather than rejected.
    pub fn from_raw(status: &str, ip_search: &str, date_from: &str, date_to: &str) -> Self {
        Self {
            status: RecordStatus::parse(status.trim()),
            ip_search: Some(ip_search.trim().to_string()).filter(|s| !s.is_empty()),
            date_from: parse_date(date_from),
            date_to: parse_date(date_to),
        }
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

/// Columns a listing may be ordered by
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortColumn {
    Id,
    IpAddress,
    Endpoint,
    BlockedReason,
    Status,
    #[default]
    CreatedAt,
    CountryCode,
}

impl SortColumn {
    /// Anything outside the allow-list sorts by creation time.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "id" => SortColumn::Id,
            "ip_address" => SortColumn::IpAddress,
            "endpoint" => SortColumn::Endpoint,
            "blocked_reason" => SortColumn::BlockedReason,
            "status" => SortColumn::Status,
            "country_code" => SortColumn::CountryCode,
            _ => SortColumn::CreatedAt,
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            SortColumn::Id => "id",
            SortColumn::IpAddress => "ip_address",
            SortColumn::Endpoint => "endpoint",
            SortColumn::BlockedReason => "blocked_reason",
            SortColumn::Status => "status",
            SortColumn::CreatedAt => "created_at",
            SortColumn::CountryCode => "country_code",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("asc") {
            SortOrder::Asc
        } else {
            SortOrder::Desc
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Ordering for listings; defaults to newest first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogSort {
    pub column: SortColumn,
    pub order: SortOrder,
}

impl LogSort {
    pub fn from_raw(orderby: &str, order: &str) -> Self {
        Self {
            column: SortColumn::parse(orderby),
            order: SortOrder::parse(order),
        }
    }
}

/// 1-based pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PER_PAGE)
    }
}

/// Logged and blocked counts for one calendar day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub logged: u64,
    pub blocked: u64,
}

/// Dashboard totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    pub total_logged: u64,
    pub total_blocked: u64,
    pub logged_today: u64,
    pub blocked_today: u64,
    pub logged_week: u64,
    pub blocked_week: u64,
    pub unique_ips: u64,
}

/// Durable, append-only record store
pub trait AuditStore: Send + Sync {
    /// Insert a record; returns the assigned id.
    fn append(&self, record: &AuditRecord) -> Result<u64, AuditError>;

    /// One page of matching records.
    fn query(&self, filter: &LogFilter, sort: LogSort, page: PageRequest) -> Result<Vec<AuditRecord>, AuditError>;

    fn count(&self, filter: &LogFilter) -> Result<u64, AuditError>;

    /// Every matching record, newest first.
    fn export(&self, filter: &LogFilter) -> Result<Vec<AuditRecord>, AuditError>;

    /// Sparse per-day, per-status counts for days on or after `since`.
    fn counts_by_day(&self, since: NaiveDate) -> Result<Vec<(NaiveDate, RecordStatus, u64)>, AuditError>;

    /// Delete records created before `cutoff`; returns how many went.
    fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AuditError>;

    /// Delete everything; returns how many went.
    fn clear(&self) -> Result<u64, AuditError>;

    fn stats(&self, now: DateTime<Utc>) -> Result<LogStats, AuditError>;
}

/// Dense daily series from `today - days` through `today`, zero-filled.
/// `days` is capped at [`MAX_SERIES_DAYS`].
pub fn daily_series(store: &dyn AuditStore, days: u32, today: NaiveDate) -> Result<Vec<DailyCount>, AuditError> {
    let days = days.min(MAX_SERIES_DAYS);
    let start = today - Duration::days(i64::from(days));
    let sparse: HashMap<(NaiveDate, RecordStatus), u64> = store
        .counts_by_day(start)?
        .into_iter()
        .map(|(date, status, count)| ((date, status), count))
        .collect();

    Ok(start
        .iter_days()
        .take_while(|date| *date <= today)
        .map(|date| DailyCount {
            date,
            logged: sparse.get(&(date, RecordStatus::Logged)).copied().unwrap_or(0),
            blocked: sparse.get(&(date, RecordStatus::Blocked)).copied().unwrap_or(0),
        })
        .collect())
}

/// Retention sweep: drop records older than `days`. A window under one day
/// is treated as "keep everything".
pub fn purge_older_than(store: &dyn AuditStore, days: u32, now: DateTime<Utc>) -> Result<u64, AuditError> {
    if days < 1 {
        return Ok(0);
    }
    store.delete_before(now - Duration::days(i64::from(days)))
}
