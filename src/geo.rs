//! Country lookup for audit records
//!
//! Lookups are best-effort: any failure yields `None` and the record is
//! written without a country.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::ip::is_public_ip;
use crate::ttl_store::TtlStore;

pub const GEO_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);
pub const GEO_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const GEO_KEY_PREFIX: &str = "geo:";

/// Resolves an IP to an ISO 3166-1 alpha-2 country code
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn lookup(&self, ip: &str) -> Option<String>;
}

/// Locator used when geolocation is turned off
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeoLocator;

#[async_trait]
impl GeoLocator for NoGeoLocator {
    async fn lookup(&self, _ip: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
}

/// ip-api.com style HTTP locator
#[derive(Clone)]
pub struct IpApiLocator {
    client: Client,
    endpoint: String,
}

impl IpApiLocator {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(GEO_LOOKUP_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLocator for IpApiLocator {
    async fn lookup(&self, ip: &str) -> Option<String> {
        let url = format!("{}/json/{}?fields=countryCode", self.endpoint, ip);
        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(client_ip = ip, status = r.status().as_u16(), "Geolocation lookup rejected");
                return None;
            }
            Err(e) => {
                debug!(client_ip = ip, error = %e, "Geolocation lookup failed");
                return None;
            }
        };

        let body: IpApiResponse = response.json().await.ok()?;
        body.country_code.as_deref().and_then(normalize_country)
    }
}

/// Two ASCII letters, upper-cased; anything else is rejected.
fn normalize_country(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_ascii_uppercase())
    } else {
        None
    }
}

/// Caches another locator's answers in the TTL store and skips addresses
/// that cannot have a public location.
///
/// Negative results are cached as the empty string so a failing API is hit
/// at most once per IP per day.
pub struct CachedGeoLocator {
    inner: Arc<dyn GeoLocator>,
    store: Arc<dyn TtlStore>,
    ttl: Duration,
}

impl CachedGeoLocator {
    pub fn new(inner: Arc<dyn GeoLocator>, store: Arc<dyn TtlStore>) -> Self {
        Self {
            inner,
            store,
            ttl: GEO_CACHE_TTL,
        }
    }
}

#[async_trait]
impl GeoLocator for CachedGeoLocator {
    async fn lookup(&self, ip: &str) -> Option<String> {
        if !is_public_ip(ip) {
            return None;
        }

        let key = geo_key(ip);
        if let Ok(Some(cached)) = self.store.get(&key) {
            return Some(cached).filter(|c| !c.is_empty());
        }

        let country = self.inner.lookup(ip).await;
        if let Err(e) = self.store.set(&key, country.as_deref().unwrap_or(""), self.ttl) {
            debug!(client_ip = ip, error = %e, "Could not cache geolocation result");
        }
        country
    }
}

fn geo_key(ip: &str) -> String {
    let digest = Sha256::digest(ip.as_bytes());
    format!("{}{}", GEO_KEY_PREFIX, hex::encode(digest))
}
