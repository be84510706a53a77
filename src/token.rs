//! Possession token issued on checkout/cart page views
//!
//! A page view stores a random token under a key derived from the client IP
//! and user agent, and hands it to the browser as a cookie. A protected call
//! without that cookie (an API hit that never loaded the page) fails
//! verification, which is the primary bot signal.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

use crate::error::StoreError;
use crate::request::ClientIdentity;
use crate::ttl_store::TtlStore;

/// Cookie carrying the token back to protected endpoints
pub const TOKEN_COOKIE: &str = "checkout_guard_token";

/// Token lifetime (30 minutes)
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

pub const TOKEN_LENGTH: usize = 32;

const TOKEN_KEY_PREFIX: &str = "token:";

/// A freshly issued token, ready for delivery to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub value: String,
    pub max_age: Duration,
}

impl IssuedToken {
    /// `Set-Cookie` header value for this token.
    pub fn cookie_header(&self) -> String {
        format!(
            "{}={}; Path=/; SameSite=Strict; Max-Age={}",
            TOKEN_COOKIE,
            self.value,
            self.max_age.as_secs()
        )
    }
}

/// Issues and verifies possession tokens
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn TtlStore>,
    ttl: Duration,
}

impl TokenManager {
    pub fn new(store: Arc<dyn TtlStore>) -> Self {
        Self::with_ttl(store, DEFAULT_TOKEN_TTL)
    }

    pub fn with_ttl(store: Arc<dyn TtlStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Generate and store a new token for `identity`, replacing any live one.
    pub fn issue(&self, identity: &ClientIdentity) -> Result<IssuedToken, StoreError> {
        let value = generate_token();
        self.store.set(&token_key(identity), &value, self.ttl)?;
        Ok(IssuedToken {
            value,
            max_age: self.ttl,
        })
    }

    /// Check a cookie-supplied token against the stored one and, failing that,
    /// against the storefront's session-scoped token.
    ///
    /// Returns `Ok(false)` when no token was supplied or nothing matches. A
    /// store read failure surfaces as `Err` only when the session token does
    /// not match either, so the caller can decide how to degrade.
    pub fn verify(
        &self,
        identity: &ClientIdentity,
        supplied: Option<&str>,
        session_token: Option<&str>,
    ) -> Result<bool, StoreError> {
        let supplied = match supplied {
            Some(s) if !s.is_empty() => s,
            _ => return Ok(false),
        };

        let stored = self.store.get(&token_key(identity));
        if let Ok(Some(stored)) = &stored {
            if tokens_match(stored, supplied) {
                return Ok(true);
            }
        }

        if let Some(session_token) = session_token.filter(|t| !t.is_empty()) {
            if tokens_match(session_token, supplied) {
                return Ok(true);
            }
        }

        stored.map(|_| false)
    }
}

/// Store key binding a token to an IP and user agent
pub fn token_key(identity: &ClientIdentity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.ip.as_bytes());
    hasher.update(identity.user_agent.as_bytes());
    format!("{}{}", TOKEN_KEY_PREFIX, hex::encode(hasher.finalize()))
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

fn tokens_match(expected: &str, supplied: &str) -> bool {
    expected.as_bytes().ct_eq(supplied.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ttl_store::MemoryTtlStore;
    use std::thread;

    struct BrokenStore;

    impl TtlStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    fn manager() -> TokenManager {
        TokenManager::new(Arc::new(MemoryTtlStore::new()))
    }

    fn alice() -> ClientIdentity {
        ClientIdentity::new("1.2.3.4", "Mozilla/5.0")
    }

    #[test]
    fn test_issued_token_shape() {
        let token = manager().issue(&alice()).unwrap();
        assert_eq!(token.value.len(), TOKEN_LENGTH);
        assert!(token.value.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(token.max_age, DEFAULT_TOKEN_TTL);
    }

    #[test]
    fn test_cookie_attributes() {
        let token = IssuedToken {
            value: "abc".into(),
            max_age: DEFAULT_TOKEN_TTL,
        };
        assert_eq!(
            token.cookie_header(),
            "checkout_guard_token=abc; Path=/; SameSite=Strict; Max-Age=1800"
        );
    }

    #[test]
    fn test_round_trip() {
        let tokens = manager();
        let token = tokens.issue(&alice()).unwrap();
        assert!(tokens.verify(&alice(), Some(&token.value), None).unwrap());
    }

    #[test]
    fn test_missing_cookie_fails_closed() {
        let tokens = manager();
        tokens.issue(&alice()).unwrap();
        assert!(!tokens.verify(&alice(), None, None).unwrap());
        assert!(!tokens.verify(&alice(), Some(""), None).unwrap());
    }

    #[test]
    fn test_never_issued_fails() {
        assert!(!manager().verify(&alice(), Some("guessed-token"), None).unwrap());
    }

    #[test]
    fn test_token_bound_to_identity() {
        let tokens = manager();
        let token = tokens.issue(&alice()).unwrap();

        let other_ip = ClientIdentity::new("5.6.7.8", "Mozilla/5.0");
        let other_ua = ClientIdentity::new("1.2.3.4", "curl/8.0");
        assert!(!tokens.verify(&other_ip, Some(&token.value), None).unwrap());
        assert!(!tokens.verify(&other_ua, Some(&token.value), None).unwrap());
    }

    #[test]
    fn test_reissue_overwrites() {
        let tokens = manager();
        let first = tokens.issue(&alice()).unwrap();
        let second = tokens.issue(&alice()).unwrap();
        assert_ne!(first.value, second.value);
        assert!(!tokens.verify(&alice(), Some(&first.value), None).unwrap());
        assert!(tokens.verify(&alice(), Some(&second.value), None).unwrap());
    }

    #[test]
    fn test_token_expires() {
        let tokens = TokenManager::with_ttl(Arc::new(MemoryTtlStore::new()), Duration::from_millis(50));
        let token = tokens.issue(&alice()).unwrap();

        thread::sleep(Duration::from_millis(100));

        assert!(!tokens.verify(&alice(), Some(&token.value), None).unwrap());
    }

    #[test]
    fn test_session_token_accepted() {
        let tokens = manager();
        assert!(tokens.verify(&alice(), Some("from-session"), Some("from-session")).unwrap());
        assert!(!tokens.verify(&alice(), Some("from-session"), Some("other")).unwrap());
    }

    #[test]
    fn test_store_failure_surfaces_unless_session_matches() {
        let tokens = TokenManager::new(Arc::new(BrokenStore));
        assert!(tokens.verify(&alice(), Some("t"), None).is_err());
        assert!(tokens.verify(&alice(), Some("t"), Some("t")).unwrap());
        assert!(!tokens.verify(&alice(), None, None).unwrap());
    }
}
