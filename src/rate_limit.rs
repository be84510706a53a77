//! Per-IP attempt counter over a one-hour window
//!
//! Only flagged requests are counted, so legitimate traffic never moves the
//! counter. Each increment (re)sets the window expiry; once it lapses the
//! count starts again from zero.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::request::ClientIdentity;
use crate::ttl_store::TtlStore;

/// Default maximum flagged attempts per window
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_WINDOW_DURATION: Duration = Duration::from_secs(60 * 60);

const RATE_KEY_PREFIX: &str = "rate:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateStatus {
    Ok,
    Exceeded,
}

/// Attempt counter backed by the shared TTL store
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn TtlStore>,
    /// Counter lifetime, refreshed on every increment
    window_duration: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn TtlStore>) -> Self {
        Self::with_window(store, DEFAULT_WINDOW_DURATION)
    }

    pub fn with_window(store: Arc<dyn TtlStore>, window_duration: Duration) -> Self {
        Self {
            store,
            window_duration,
        }
    }

    /// Current attempt count; an absent counter counts as zero.
    pub fn attempts(&self, identity: &ClientIdentity) -> Result<u64, StoreError> {
        let key = rate_key(&identity.ip);
        match self.store.get(&key)? {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| StoreError::NotACounter { key }),
            None => Ok(0),
        }
    }

    /// `Exceeded` once the count has reached `max_attempts`.
    pub fn check(&self, identity: &ClientIdentity, max_attempts: u32) -> Result<RateStatus, StoreError> {
        let attempts = self.attempts(identity)?;
        if attempts >= u64::from(max_attempts) {
            Ok(RateStatus::Exceeded)
        } else {
            Ok(RateStatus::Ok)
        }
    }

    /// Record one flagged attempt. Returns the new count.
    pub fn increment(&self, identity: &ClientIdentity) -> Result<u64, StoreError> {
        self.store.increment(&rate_key(&identity.ip), self.window_duration)
    }
}

fn rate_key(ip: &str) -> String {
    let digest = Sha256::digest(ip.as_bytes());
    format!("{}{}", RATE_KEY_PREFIX, hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ttl_store::MemoryTtlStore;
    use std::thread;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryTtlStore::new()))
    }

    #[test]
    fn test_absent_counter_is_ok() {
        let identity = ClientIdentity::new("1.2.3.4", "ua");
        assert_eq!(limiter().check(&identity, 10).unwrap(), RateStatus::Ok);
    }

    #[test]
    fn test_exceeded_after_max_attempts() {
        let limiter = limiter();
        let identity = ClientIdentity::new("1.2.3.4", "ua");

        for _ in 0..9 {
            limiter.increment(&identity).unwrap();
        }
        assert_eq!(limiter.check(&identity, 10).unwrap(), RateStatus::Ok);

        limiter.increment(&identity).unwrap();
        assert_eq!(limiter.check(&identity, 10).unwrap(), RateStatus::Exceeded);
    }

    #[test]
    fn test_counter_ignores_user_agent() {
        let limiter = limiter();
        limiter.increment(&ClientIdentity::new("1.2.3.4", "a")).unwrap();
        limiter.increment(&ClientIdentity::new("1.2.3.4", "b")).unwrap();
        assert_eq!(limiter.attempts(&ClientIdentity::new("1.2.3.4", "c")).unwrap(), 2);
    }

    #[test]
    fn test_per_ip_counters() {
        let limiter = limiter();
        let a = ClientIdentity::new("1.2.3.4", "ua");
        let b = ClientIdentity::new("5.6.7.8", "ua");
        for _ in 0..3 {
            limiter.increment(&a).unwrap();
        }
        assert_eq!(limiter.check(&a, 3).unwrap(), RateStatus::Exceeded);
        assert_eq!(limiter.check(&b, 3).unwrap(), RateStatus::Ok);
    }

    #[test]
    fn test_window_expiry_resets() {
        let limiter = RateLimiter::with_window(Arc::new(MemoryTtlStore::new()), Duration::from_millis(80));
        let identity = ClientIdentity::new("1.2.3.4", "ua");
        for _ in 0..3 {
            limiter.increment(&identity).unwrap();
        }
        assert_eq!(limiter.check(&identity, 3).unwrap(), RateStatus::Exceeded);

        thread::sleep(Duration::from_millis(150));

        assert_eq!(limiter.check(&identity, 3).unwrap(), RateStatus::Ok);
        assert_eq!(limiter.increment(&identity).unwrap(), 1);
    }
}
