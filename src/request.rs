//! Per-request inputs handed to the guard by the hosting layer.

use axum::http::{header, HeaderMap};
use std::net::SocketAddr;

use crate::ip::resolve_client_ip;
use crate::token::TOKEN_COOKIE;

/// Evaluation key for a client: resolved IP plus the user agent that binds
/// the possession token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub ip: String,
    pub user_agent: String,
}

impl ClientIdentity {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
        }
    }

    pub fn from_headers(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> Self {
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        Self::new(resolve_client_ip(headers, remote_addr), user_agent)
    }
}

/// Browsing session as reported by the hosting storefront.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowsingSession {
    /// Set once the visitor has browsed the store.
    pub customer_id: Option<String>,
    /// Possession token the storefront kept in its own session, if any.
    pub checkout_token: Option<String>,
}

impl BrowsingSession {
    pub fn has_customer(&self) -> bool {
        self.customer_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// Everything the guard needs to evaluate one protected request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: ClientIdentity,
    /// Label recorded in the audit log (query string or REST route)
    pub endpoint: String,
    pub method: String,
    pub referer: Option<String>,
    /// Token supplied by the client cookie
    pub cookie_token: Option<String>,
    /// `None` while the storefront session subsystem is not initialised
    pub session: Option<BrowsingSession>,
}

impl RequestContext {
    pub fn new(identity: ClientIdentity, endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            identity,
            endpoint: endpoint.into(),
            method: method.into(),
            referer: None,
            cookie_token: None,
            session: None,
        }
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_cookie_token(mut self, token: impl Into<String>) -> Self {
        self.cookie_token = Some(token.into());
        self
    }

    pub fn with_session(mut self, session: BrowsingSession) -> Self {
        self.session = Some(session);
        self
    }

    /// Build a context from raw request headers.
    ///
    /// `session_cookie_prefix` names the storefront's session cookie. Without
    /// one the session subsystem is reported as not initialised.
    pub fn from_headers(
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
        method: &str,
        endpoint: &str,
        session_cookie_prefix: Option<&str>,
    ) -> Self {
        let identity = ClientIdentity::from_headers(headers, remote_addr);
        let cookies = parse_cookies(headers);

        let referer = headers
            .get(header::REFERER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let cookie_token = cookies
            .iter()
            .find(|(name, _)| name == TOKEN_COOKIE)
            .map(|(_, value)| value.clone());

        let session = session_cookie_prefix.map(|prefix| {
            let customer_id = cookies
                .iter()
                .find(|(name, value)| name.starts_with(prefix) && !value.is_empty())
                .map(|(_, value)| value.clone());
            BrowsingSession {
                customer_id,
                checkout_token: None,
            }
        });

        Self {
            identity,
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            referer,
            cookie_token,
            session,
        }
    }
}

/// Split every `Cookie` header into trimmed name/value pairs.
pub fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_parse_cookies_across_headers() {
        let h = headers(&[
            (header::COOKIE, "a=1; b = 2"),
            (header::COOKIE, "checkout_guard_token=abc"),
        ]);
        let cookies = parse_cookies(&h);
        assert_eq!(cookies.len(), 3);
        assert!(cookies.contains(&("b".to_string(), "2".to_string())));
    }

    #[test]
    fn test_context_from_headers() {
        let h = headers(&[
            (header::USER_AGENT, "Mozilla/5.0"),
            (header::REFERER, "https://shop.example/checkout"),
            (
                header::COOKIE,
                "checkout_guard_token=tok123; wp_woocommerce_session_abc=cust42",
            ),
        ]);
        let addr = "1.2.3.4:5000".parse().ok();
        let ctx = RequestContext::from_headers(
            &h,
            addr,
            "POST",
            "wc-ajax=checkout",
            Some("wp_woocommerce_session_"),
        );

        assert_eq!(ctx.identity, ClientIdentity::new("1.2.3.4", "Mozilla/5.0"));
        assert_eq!(ctx.cookie_token.as_deref(), Some("tok123"));
        assert_eq!(ctx.referer.as_deref(), Some("https://shop.example/checkout"));
        assert!(ctx.session.as_ref().unwrap().has_customer());
    }

    #[test]
    fn test_session_without_prefix_is_uninitialised() {
        let h = headers(&[(header::COOKIE, "wp_woocommerce_session_abc=cust42")]);
        let ctx = RequestContext::from_headers(&h, None, "POST", "x", None);
        assert!(ctx.session.is_none());
        assert_eq!(ctx.identity.ip, "unknown");
    }

    #[test]
    fn test_session_without_customer_cookie() {
        let ctx = RequestContext::from_headers(&HeaderMap::new(), None, "POST", "x", Some("sess_"));
        assert_eq!(ctx.session, Some(BrowsingSession::default()));
        assert!(!ctx.session.unwrap().has_customer());
    }
}
