// Common test utilities
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use checkout_guard::audit::{AuditRecord, AuditStore, LogFilter, LogSort, LogStats, PageRequest, RecordStatus};
use std::time::Duration;

use checkout_guard::{
    AuditError, BrowsingSession, ClientIdentity, GeoLocator, GuardSettings, RequestContext, StoreError, TtlStore,
};

pub const ORIGIN: &str = "https://shop.example";

/// Settings with blocking on and the given thresholds
pub fn blocking_settings(threshold: u32, rate_limit: u32) -> GuardSettings {
    GuardSettings {
        enabled: true,
        test_mode: false,
        block_threshold: threshold,
        rate_limit,
        site_origin: ORIGIN.to_string(),
        ..GuardSettings::default()
    }
}

pub fn identity(ip: &str) -> ClientIdentity {
    ClientIdentity::new(ip, "Mozilla/5.0 (X11; Linux x86_64)")
}

/// A checkout POST with a valid referer and an initialised session without a customer
pub fn anonymous_checkout(ip: &str) -> RequestContext {
    RequestContext::new(identity(ip), "wc-ajax=checkout", "POST")
        .with_referer(format!("{}/checkout/", ORIGIN))
        .with_session(BrowsingSession::default())
}

pub fn customer_session() -> BrowsingSession {
    BrowsingSession {
        customer_id: Some("wc_session_42".to_string()),
        checkout_token: None,
    }
}

/// Geolocator answering a fixed country and counting calls
pub struct FixedGeoLocator {
    pub country: Option<String>,
    pub calls: AtomicUsize,
}

impl FixedGeoLocator {
    pub fn new(country: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            country: country.map(str::to_string),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoLocator for FixedGeoLocator {
    async fn lookup(&self, _ip: &str) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.country.clone()
    }
}

/// Audit store whose every operation fails
pub struct FailingAuditStore;

impl AuditStore for FailingAuditStore {
    fn append(&self, _record: &AuditRecord) -> Result<u64, AuditError> {
        Err(AuditError::LockPoisoned)
    }

    fn query(&self, _filter: &LogFilter, _sort: LogSort, _page: PageRequest) -> Result<Vec<AuditRecord>, AuditError> {
        Err(AuditError::LockPoisoned)
    }

    fn count(&self, _filter: &LogFilter) -> Result<u64, AuditError> {
        Err(AuditError::LockPoisoned)
    }

    fn export(&self, _filter: &LogFilter) -> Result<Vec<AuditRecord>, AuditError> {
        Err(AuditError::LockPoisoned)
    }

    fn counts_by_day(&self, _since: NaiveDate) -> Result<Vec<(NaiveDate, RecordStatus, u64)>, AuditError> {
        Err(AuditError::LockPoisoned)
    }

    fn delete_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, AuditError> {
        Err(AuditError::LockPoisoned)
    }

    fn clear(&self) -> Result<u64, AuditError> {
        Err(AuditError::LockPoisoned)
    }

    fn stats(&self, _now: DateTime<Utc>) -> Result<LogStats, AuditError> {
        Err(AuditError::LockPoisoned)
    }
}

/// TTL store that cannot be reached
pub struct UnreachableTtlStore;

impl TtlStore for UnreachableTtlStore {
    fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}
