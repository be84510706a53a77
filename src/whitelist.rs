//! Exact-match IP bypass list

use crate::ip::canonical_ip;

/// Ordered, de-duplicated set of IP strings that skip evaluation.
///
/// IP literals are stored in the same canonical form the client IP resolver
/// produces, then compared exactly; no CIDR ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    ips: Vec<String>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the comma-separated form used by configuration.
    pub fn parse(raw: &str) -> Self {
        let mut list = Self::new();
        list.bulk_add(raw.split(','));
        list
    }

    pub fn is_whitelisted(&self, ip: &str) -> bool {
        let ip = canonical_ip(ip).unwrap_or_else(|| ip.trim().to_string());
        self.ips.iter().any(|entry| *entry == ip)
    }

    /// Append `ip` unless present. Returns true if it was added.
    pub fn add(&mut self, ip: &str) -> bool {
        let ip = ip.trim();
        if ip.is_empty() {
            return false;
        }
        let ip = canonical_ip(ip).unwrap_or_else(|| ip.to_string());
        if self.ips.contains(&ip) {
            return false;
        }
        self.ips.push(ip);
        true
    }

    /// Add every new entry; returns how many were net-new.
    pub fn bulk_add<I, S>(&mut self, ips: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ips.into_iter().filter(|ip| self.add(ip.as_ref())).count()
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ips.iter().map(String::as_str)
    }
}
