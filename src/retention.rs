//! Background maintenance: audit retention and TTL store eviction

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::audit::{purge_older_than, AuditStore};
use crate::config::SharedSettings;
use crate::error::AuditError;
use crate::ttl_store::MemoryTtlStore;

pub const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const TTL_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// One retention pass against the current settings snapshot.
///
/// Returns `None` when auto cleanup is turned off.
pub async fn sweep_once(
    audit: &dyn AuditStore,
    settings: &SharedSettings,
    now: DateTime<Utc>,
) -> Result<Option<u64>, AuditError> {
    let (auto_cleanup, days) = {
        let s = settings.read().await;
        (s.auto_cleanup, s.cleanup_days)
    };
    if !auto_cleanup {
        return Ok(None);
    }
    purge_older_than(audit, days, now).map(Some)
}

/// Start the retention task.
///
/// Runs every `interval`, first tick immediately. Failures are logged and
/// the next tick tries again.
pub async fn start_retention_task(audit: Arc<dyn AuditStore>, settings: SharedSettings, interval: Duration) {
    let mut interval_timer = tokio::time::interval(interval);
    interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("🧹 Retention task started (interval: {}s)", interval.as_secs());

    loop {
        interval_timer.tick().await;

        match sweep_once(audit.as_ref(), &settings, Utc::now()).await {
            Ok(Some(deleted)) => info!(deleted, "🧹 Audit retention sweep complete"),
            Ok(None) => {}
            Err(e) => error!("🧹 Audit retention sweep failed: {}", e),
        }
    }
}

/// Evict expired tokens, counters and geolocation entries on a fixed cadence.
pub async fn start_ttl_eviction_task(store: MemoryTtlStore, interval: Duration) {
    let mut interval_timer = tokio::time::interval(interval);
    interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval_timer.tick().await;
        store.cleanup_expired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditRecord, LogFilter, RecordStatus, RequestDetails, SqliteAuditStore};
    use crate::config::GuardSettings;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::RwLock;

    fn record(created_at: DateTime<Utc>) -> AuditRecord {
        AuditRecord {
            id: None,
            ip_address: "198.51.100.7".to_string(),
            endpoint: "wc-ajax=checkout".to_string(),
            user_agent: String::new(),
            request_data: RequestDetails {
                flags: vec![],
                score: 0,
                threshold: 3,
                test_mode: true,
                method: "POST".to_string(),
                referer: String::new(),
                has_token: "no".to_string(),
            },
            blocked_reason: String::new(),
            status: RecordStatus::Logged,
            country_code: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_sweep_respects_auto_cleanup_and_days() {
        let audit = SqliteAuditStore::in_memory().unwrap();
        let now = Utc::now();
        audit.append(&record(now - ChronoDuration::days(10))).unwrap();
        audit.append(&record(now - ChronoDuration::hours(1))).unwrap();

        let settings: SharedSettings = Arc::new(RwLock::new(GuardSettings {
            auto_cleanup: false,
            cleanup_days: 5,
            ..GuardSettings::default()
        }));
        assert_eq!(sweep_once(&audit, &settings, now).await.unwrap(), None);

        settings.write().await.cleanup_days = 0;
        settings.write().await.auto_cleanup = true;
        assert_eq!(sweep_once(&audit, &settings, now).await.unwrap(), Some(0));

        settings.write().await.cleanup_days = 5;
        assert_eq!(sweep_once(&audit, &settings, now).await.unwrap(), Some(1));
        assert_eq!(audit.count(&LogFilter::default()).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retention_task_runs_first_tick_immediately() {
        let audit = Arc::new(SqliteAuditStore::in_memory().unwrap());
        audit.append(&record(Utc::now() - ChronoDuration::days(90))).unwrap();
        let settings: SharedSettings = Arc::new(RwLock::new(GuardSettings::default()));

        let handle = tokio::spawn(start_retention_task(audit.clone(), settings, RETENTION_INTERVAL));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(audit.count(&LogFilter::default()).unwrap(), 0);
    }
}
