//! Risk signals computed for one protected request

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::config::GuardSettings;
use crate::rate_limit::{RateLimiter, RateStatus};
use crate::request::RequestContext;
use crate::token::TokenManager;

/// A triggered risk signal. Weights are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    MissingToken,
    NoSession,
    RateLimitExceeded,
    InvalidReferer,
}

impl Flag {
    pub fn weight(self) -> u32 {
        match self {
            Flag::MissingToken => 2,
            Flag::NoSession => 1,
            Flag::RateLimitExceeded => 3,
            Flag::InvalidReferer => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Flag::MissingToken => "missing_token",
            Flag::NoSession => "no_session",
            Flag::RateLimitExceeded => "rate_limit_exceeded",
            Flag::InvalidReferer => "invalid_referer",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags raised for a request, in evaluation order, with their summed weight
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub flags: Vec<Flag>,
    pub score: u32,
}

impl Signals {
    pub fn raise(&mut self, flag: Flag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
            self.score += flag.weight();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn contains(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Runs the four checks in fixed order.
///
/// Token and rate checks that cannot read the store do not raise their flag.
#[derive(Clone)]
pub struct SignalEvaluator {
    tokens: TokenManager,
    limiter: RateLimiter,
}

impl SignalEvaluator {
    pub fn new(tokens: TokenManager, limiter: RateLimiter) -> Self {
        Self { tokens, limiter }
    }

    pub fn evaluate(&self, ctx: &RequestContext, settings: &GuardSettings) -> Signals {
        let mut signals = Signals::default();

        if !self.has_valid_token(ctx) {
            signals.raise(Flag::MissingToken);
        }

        if !has_session(ctx) {
            signals.raise(Flag::NoSession);
        }

        if self.rate_exceeded(ctx, settings.rate_limit) {
            signals.raise(Flag::RateLimitExceeded);
        }

        if !has_valid_referer(ctx.referer.as_deref(), &settings.site_origin) {
            signals.raise(Flag::InvalidReferer);
        }

        signals
    }

    fn has_valid_token(&self, ctx: &RequestContext) -> bool {
        let session_token = ctx.session.as_ref().and_then(|s| s.checkout_token.as_deref());
        match self
            .tokens
            .verify(&ctx.identity, ctx.cookie_token.as_deref(), session_token)
        {
            Ok(valid) => valid,
            Err(e) => {
                warn!(
                    client_ip = %ctx.identity.ip,
                    error = %e,
                    "Token store unreadable, skipping token check"
                );
                true
            }
        }
    }

    fn rate_exceeded(&self, ctx: &RequestContext, max_attempts: u32) -> bool {
        match self.limiter.check(&ctx.identity, max_attempts) {
            Ok(status) => status == RateStatus::Exceeded,
            Err(e) => {
                warn!(
                    client_ip = %ctx.identity.ip,
                    error = %e,
                    "Rate counter unreadable, skipping rate check"
                );
                false
            }
        }
    }
}

/// An uninitialised session subsystem gets the benefit of the doubt.
fn has_session(ctx: &RequestContext) -> bool {
    match &ctx.session {
        None => true,
        Some(session) => session.has_customer(),
    }
}

/// Referer must be present and start with the site origin (plain prefix match).
pub fn has_valid_referer(referer: Option<&str>, site_origin: &str) -> bool {
    match referer {
        Some(referer) => referer.starts_with(site_origin),
        None => false,
    }
}
