//! Management operations and the admin API that exposes them
//!
//! The API lives under `/_guard` and is only mounted when an admin token is
//! configured. Every route requires `Authorization: Bearer <token>`.

use axum::{
    extract::{Query, Request, State},
    http::header,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::audit::{
    daily_series, AuditRecord, AuditStore, DailyCount, LogFilter, LogSort, LogStats, PageRequest,
    DEFAULT_PER_PAGE,
};
use crate::config::{GuardSettings, SharedSettings};
use crate::error::GuardError;
use crate::ip::is_valid_ip;
use crate::retention::sweep_once;

pub const ADMIN_PREFIX: &str = "/_guard";
pub const DEFAULT_CHART_DAYS: u32 = 14;

/// One page of a log listing
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub records: Vec<AuditRecord>,
}

/// Management operations over the audit store and live settings
#[derive(Clone)]
pub struct GuardAdmin {
    audit: Arc<dyn AuditStore>,
    settings: SharedSettings,
}

impl GuardAdmin {
    pub fn new(audit: Arc<dyn AuditStore>, settings: SharedSettings) -> Self {
        Self { audit, settings }
    }

    pub async fn settings(&self) -> GuardSettings {
        self.settings.read().await.clone()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Result<LogStats, GuardError> {
        Ok(self.audit.stats(now)?)
    }

    pub fn clear_logs(&self) -> Result<u64, GuardError> {
        let deleted = self.audit.clear()?;
        info!(deleted, "Audit log cleared");
        Ok(deleted)
    }

    /// Run the retention sweep now. Returns `None` when auto cleanup is off.
    pub async fn run_cleanup(&self, now: DateTime<Utc>) -> Result<Option<u64>, GuardError> {
        let deleted = sweep_once(self.audit.as_ref(), &self.settings, now).await?;
        if let Some(deleted) = deleted {
            info!(deleted, "Manual audit retention sweep complete");
        }
        Ok(deleted)
    }

    /// Add one IP literal to the whitelist. Returns whether it was new.
    pub async fn whitelist_ip(&self, ip: &str) -> Result<bool, GuardError> {
        let ip = ip.trim();
        if !is_valid_ip(ip) {
            return Err(GuardError::InvalidInput(format!("not an IP address: {}", ip)));
        }
        let added = self.settings.write().await.whitelist.add(ip);
        if added {
            info!(client_ip = ip, "IP whitelisted");
        }
        Ok(added)
    }

    /// Add every valid IP; invalid entries are skipped. Returns the net-new count.
    pub async fn bulk_whitelist<I, S>(&self, ips: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let valid: Vec<String> = ips
            .into_iter()
            .map(|ip| ip.as_ref().trim().to_string())
            .filter(|ip| is_valid_ip(ip))
            .collect();
        let added = self.settings.write().await.whitelist.bulk_add(&valid);
        info!(added, "Bulk whitelist applied");
        added
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.settings.write().await.enabled = enabled;
        info!(enabled, "Guard enabled flag changed");
    }

    pub async fn set_test_mode(&self, test_mode: bool) {
        self.settings.write().await.test_mode = test_mode;
        info!(test_mode, "Guard test mode changed");
    }

    pub fn export_logs(&self, filter: &LogFilter) -> Result<Vec<AuditRecord>, GuardError> {
        Ok(self.audit.export(filter)?)
    }

    pub fn list_logs(&self, filter: &LogFilter, sort: LogSort, page: PageRequest) -> Result<LogPage, GuardError> {
        let total = self.audit.count(filter)?;
        let records = self.audit.query(filter, sort, page)?;
        Ok(LogPage {
            total,
            page: page.page,
            per_page: page.per_page,
            records,
        })
    }

    pub fn daily_series(&self, days: u32, today: NaiveDate) -> Result<Vec<DailyCount>, GuardError> {
        Ok(daily_series(self.audit.as_ref(), days, today)?)
    }
}

#[derive(Clone)]
struct AdminState {
    admin: GuardAdmin,
    token: Arc<str>,
}

/// Raw listing parameters; sanitised into filter, sort and page.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogQuery {
    status: String,
    ip: String,
    date_from: String,
    date_to: String,
    orderby: String,
    order: String,
    page: Option<u32>,
    per_page: Option<u32>,
}

impl LogQuery {
    fn filter(&self) -> LogFilter {
        LogFilter::from_raw(&self.status, &self.ip, &self.date_from, &self.date_to)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChartQuery {
    days: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WhitelistBody {
    ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BulkWhitelistBody {
    List { ips: Vec<String> },
    /// Comma or newline separated
    Raw { ips: String },
}

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct TestModeBody {
    test_mode: bool,
}

#[derive(Debug, Serialize)]
struct SettingsView {
    enabled: bool,
    test_mode: bool,
    block_threshold: u32,
    rate_limit: u32,
    whitelist: Vec<String>,
    auto_cleanup: bool,
    cleanup_days: u32,
    site_origin: String,
}

impl From<GuardSettings> for SettingsView {
    fn from(s: GuardSettings) -> Self {
        Self {
            enabled: s.enabled,
            test_mode: s.test_mode,
            block_threshold: s.block_threshold,
            rate_limit: s.rate_limit,
            whitelist: s.whitelist.iter().map(str::to_string).collect(),
            auto_cleanup: s.auto_cleanup,
            cleanup_days: s.cleanup_days,
            site_origin: s.site_origin,
        }
    }
}

/// Admin routes, to be nested under [`ADMIN_PREFIX`].
pub fn admin_router<S>(admin: GuardAdmin, token: impl Into<String>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let state = AdminState {
        admin,
        token: Arc::from(token.into()),
    };

    Router::new()
        .route("/settings", get(get_settings))
        .route("/stats", get(get_stats))
        .route("/logs", get(list_logs).delete(clear_logs))
        .route("/logs/export", get(export_logs))
        .route("/chart", get(get_chart))
        .route("/cleanup", post(run_cleanup))
        .route("/whitelist", post(whitelist_ip))
        .route("/whitelist/bulk", post(bulk_whitelist))
        .route("/enabled", put(set_enabled))
        .route("/test-mode", put(set_test_mode))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_token))
        .with_state(state)
}

async fn require_admin_token(
    State(state): State<AdminState>,
    req: Request,
    next: Next,
) -> Result<Response, GuardError> {
    let supplied = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if supplied.is_empty() || !bool::from(supplied.as_bytes().ct_eq(state.token.as_bytes())) {
        warn!(path = %req.uri().path(), "Admin request rejected: bad or missing bearer token");
        return Err(GuardError::Unauthorized);
    }

    Ok(next.run(req).await)
}

async fn get_settings(State(state): State<AdminState>) -> Json<SettingsView> {
    Json(state.admin.settings().await.into())
}

async fn get_stats(State(state): State<AdminState>) -> Result<Json<LogStats>, GuardError> {
    Ok(Json(state.admin.stats(Utc::now())?))
}

async fn list_logs(
    State(state): State<AdminState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>, GuardError> {
    let sort = LogSort::from_raw(&query.orderby, &query.order);
    let page = PageRequest::new(query.page.unwrap_or(1), query.per_page.unwrap_or(DEFAULT_PER_PAGE));
    Ok(Json(state.admin.list_logs(&query.filter(), sort, page)?))
}

async fn export_logs(
    State(state): State<AdminState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<AuditRecord>>, GuardError> {
    Ok(Json(state.admin.export_logs(&query.filter())?))
}

async fn clear_logs(State(state): State<AdminState>) -> Result<Json<serde_json::Value>, GuardError> {
    let deleted = state.admin.clear_logs()?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn get_chart(
    State(state): State<AdminState>,
    Query(query): Query<ChartQuery>,
) -> Result<Json<Vec<DailyCount>>, GuardError> {
    let days = query.days.unwrap_or(DEFAULT_CHART_DAYS);
    Ok(Json(state.admin.daily_series(days, Utc::now().date_naive())?))
}

async fn run_cleanup(State(state): State<AdminState>) -> Result<Json<serde_json::Value>, GuardError> {
    let deleted = state.admin.run_cleanup(Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "ran": deleted.is_some(),
        "deleted": deleted.unwrap_or(0),
    })))
}

async fn whitelist_ip(
    State(state): State<AdminState>,
    Json(body): Json<WhitelistBody>,
) -> Result<Json<serde_json::Value>, GuardError> {
    let added = state.admin.whitelist_ip(&body.ip).await?;
    Ok(Json(serde_json::json!({ "added": added })))
}

async fn bulk_whitelist(
    State(state): State<AdminState>,
    Json(body): Json<BulkWhitelistBody>,
) -> Json<serde_json::Value> {
    let added = match body {
        BulkWhitelistBody::List { ips } => state.admin.bulk_whitelist(ips).await,
        BulkWhitelistBody::Raw { ips } => {
            state.admin.bulk_whitelist(ips.split([',', '\n'])).await
        }
    };
    Json(serde_json::json!({ "added": added }))
}

async fn set_enabled(State(state): State<AdminState>, Json(body): Json<EnabledBody>) -> Json<SettingsView> {
    state.admin.set_enabled(body.enabled).await;
    Json(state.admin.settings().await.into())
}

async fn set_test_mode(State(state): State<AdminState>, Json(body): Json<TestModeBody>) -> Json<SettingsView> {
    state.admin.set_test_mode(body.test_mode).await;
    Json(state.admin.settings().await.into())
}
