//! Client IP resolution
//!
//! Stateless helpers shared by the evaluator, the audit path and geolocation.

use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Sentinel recorded when no valid client address can be determined
pub const UNKNOWN_IP: &str = "unknown";

/// Headers consulted before the socket address, most trusted first:
/// edge CDN, reverse proxy, then the general forwarded-for chain.
pub const CLIENT_IP_HEADERS: [&str; 3] = ["cf-connecting-ip", "x-real-ip", "x-forwarded-for"];

/// Resolve the client IP from proxy headers, falling back to the socket address.
///
/// The first non-empty source wins. For comma-separated values only the first
/// entry (the originating client) is used. Anything that is not an IP literal
/// resolves to [`UNKNOWN_IP`].
pub fn resolve_client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    let from_headers = CLIENT_IP_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    });

    let candidate = match from_headers {
        Some(value) => value,
        None => match remote_addr {
            Some(addr) => addr.ip().to_string(),
            None => return UNKNOWN_IP.to_string(),
        },
    };

    let first = candidate.split(',').next().unwrap_or_default().trim();
    normalize_ip(first)
}

/// Return the canonical text of an IP literal, or [`UNKNOWN_IP`].
pub fn normalize_ip(value: &str) -> String {
    canonical_ip(value).unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// Canonical text of an IP literal (lower-case, compressed IPv6), if it is one.
pub fn canonical_ip(value: &str) -> Option<String> {
    value.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

pub fn is_valid_ip(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok()
}

/// True for addresses worth a geolocation lookup: not private, loopback,
/// link-local, documentation or otherwise reserved.
pub fn is_public_ip(value: &str) -> bool {
    match value.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => is_public_v4(&v4),
        Ok(IpAddr::V6(v6)) => is_public_v6(&v6),
        Err(_) => false,
    }
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    let shared = a == 100 && (64..128).contains(&b);
    let this_network = a == 0;
    let reserved = a >= 240;
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        || shared
        || this_network
        || reserved)
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_public_v4(&mapped);
    }
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    let documentation = first == 0x2001 && ip.segments()[1] == 0x0db8;
    !(ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || unique_local || link_local || documentation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn socket(ip: &str) -> Option<SocketAddr> {
        Some(SocketAddr::new(ip.parse().unwrap(), 443))
    }

    #[test]
    fn test_header_priority() {
        let h = headers(&[
            ("x-forwarded-for", "9.9.9.9"),
            ("x-real-ip", "8.8.8.8"),
            ("cf-connecting-ip", "7.7.7.7"),
        ]);
        assert_eq!(resolve_client_ip(&h, socket("10.0.0.1")), "7.7.7.7");

        let h = headers(&[("x-forwarded-for", "9.9.9.9"), ("x-real-ip", "8.8.8.8")]);
        assert_eq!(resolve_client_ip(&h, socket("10.0.0.1")), "8.8.8.8");
    }

    #[test]
    fn test_forwarded_for_takes_first_entry() {
        let h = headers(&[("x-forwarded-for", " 203.0.113.5 , 10.0.0.2, 10.0.0.3")]);
        assert_eq!(resolve_client_ip(&h, None), "203.0.113.5");
    }

    #[test]
    fn test_falls_back_to_socket_address() {
        assert_eq!(resolve_client_ip(&HeaderMap::new(), socket("1.2.3.4")), "1.2.3.4");
        assert_eq!(resolve_client_ip(&HeaderMap::new(), None), UNKNOWN_IP);
    }

    #[test]
    fn test_malformed_header_yields_unknown() {
        let h = headers(&[("x-forwarded-for", "not-an-ip, 1.2.3.4")]);
        assert_eq!(resolve_client_ip(&h, socket("1.2.3.4")), UNKNOWN_IP);
    }

    #[test]
    fn test_ipv6_literal() {
        let h = headers(&[("x-real-ip", "2606:4700::1111")]);
        assert_eq!(resolve_client_ip(&h, None), "2606:4700::1111");
    }

    #[test]
    fn test_non_canonical_ipv6_is_compressed() {
        let h = headers(&[("x-real-ip", "2001:0DB8:0000::1")]);
        assert_eq!(resolve_client_ip(&h, None), "2001:db8::1");
        assert_eq!(canonical_ip(" 2001:0DB8:0000::1 ").as_deref(), Some("2001:db8::1"));
        assert_eq!(canonical_ip("not-an-ip"), None);
    }

    #[test]
    fn test_is_public_ip() {
        assert!(is_public_ip("8.8.8.8"));
        assert!(is_public_ip("2606:4700::1111"));
        assert!(!is_public_ip("127.0.0.1"));
        assert!(!is_public_ip("::1"));
        assert!(!is_public_ip("192.168.1.10"));
        assert!(!is_public_ip("10.1.2.3"));
        assert!(!is_public_ip("100.64.0.1"));
        assert!(!is_public_ip("fe80::1"));
        assert!(!is_public_ip("fd00::1"));
        assert!(!is_public_ip(UNKNOWN_IP));
    }
}
