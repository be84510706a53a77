//! Decision engine
//!
//! Two seams face the storefront: [`CheckoutGuard::issue_token`] on page
//! views of the checkout and cart, and [`CheckoutGuard::check`] on every
//! protected checkout endpoint.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditRecord, AuditStore, RecordStatus, RequestDetails};
use crate::config::GuardSettings;
use crate::error::StoreError;
use crate::geo::GeoLocator;
use crate::rate_limit::RateLimiter;
use crate::request::{ClientIdentity, RequestContext};
use crate::signals::{Flag, SignalEvaluator, Signals};
use crate::token::{IssuedToken, TokenManager};
use crate::ttl_store::TtlStore;

/// What happens to a request that raised at least one flag, or none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// No flags; nothing recorded
    Allowed,
    /// Flagged and recorded, request proceeds
    Logged,
    /// Flagged, recorded and refused
    Blocked,
}

/// Outcome of a full evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub flags: Vec<Flag>,
    pub score: u32,
    pub threshold: u32,
    pub outcome: Outcome,
}

impl Decision {
    /// Human-readable reason stored with the audit record,
    /// e.g. `missing_token, no_session (score: 3/3)`.
    pub fn reason(&self) -> String {
        let flags: Vec<&str> = self.flags.iter().map(|f| f.as_str()).collect();
        format!("{} (score: {}/{})", flags.join(", "), self.score, self.threshold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Whitelisted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Evaluation did not run: no record, no counters
    Skipped(SkipReason),
    Evaluated(Decision),
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Evaluated(d) if d.outcome == Outcome::Blocked)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Verdict::Skipped(_) => None,
            Verdict::Evaluated(d) => Some(d.outcome),
        }
    }
}

/// Blocked iff the score reaches the threshold outside test mode.
pub fn decide(signals: &Signals, settings: &GuardSettings) -> Outcome {
    if signals.is_empty() {
        Outcome::Allowed
    } else if signals.score >= settings.block_threshold && !settings.test_mode {
        Outcome::Blocked
    } else {
        Outcome::Logged
    }
}

/// Wires token issuance, signal evaluation, audit and geolocation together
#[derive(Clone)]
pub struct CheckoutGuard {
    tokens: TokenManager,
    limiter: RateLimiter,
    evaluator: SignalEvaluator,
    audit: Arc<dyn AuditStore>,
    geo: Arc<dyn GeoLocator>,
}

impl CheckoutGuard {
    pub fn new(store: Arc<dyn TtlStore>, audit: Arc<dyn AuditStore>, geo: Arc<dyn GeoLocator>) -> Self {
        Self::with_parts(TokenManager::new(store.clone()), RateLimiter::new(store), audit, geo)
    }

    pub fn with_parts(
        tokens: TokenManager,
        limiter: RateLimiter,
        audit: Arc<dyn AuditStore>,
        geo: Arc<dyn GeoLocator>,
    ) -> Self {
        let evaluator = SignalEvaluator::new(tokens.clone(), limiter.clone());
        Self {
            tokens,
            limiter,
            evaluator,
            audit,
            geo,
        }
    }

    pub fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    /// Page-view seam: issue a fresh token bound to this client.
    pub fn issue_token(&self, identity: &ClientIdentity) -> Result<IssuedToken, StoreError> {
        self.tokens.issue(identity)
    }

    /// Protected-endpoint seam.
    ///
    /// Signals are evaluated before the rate counter is incremented, and the
    /// counter only moves for flagged requests. Audit and counter failures are
    /// logged and never change the outcome.
    pub async fn check(&self, ctx: &RequestContext, settings: &GuardSettings) -> Verdict {
        if !settings.enabled {
            return Verdict::Skipped(SkipReason::Disabled);
        }
        if settings.whitelist.is_whitelisted(&ctx.identity.ip) {
            info!(client_ip = %ctx.identity.ip, endpoint = %ctx.endpoint, "Whitelisted client, skipping checks");
            return Verdict::Skipped(SkipReason::Whitelisted);
        }

        let signals = self.evaluator.evaluate(ctx, settings);
        let outcome = decide(&signals, settings);
        let decision = Decision {
            flags: signals.flags,
            score: signals.score,
            threshold: settings.block_threshold,
            outcome,
        };

        if outcome == Outcome::Allowed {
            return Verdict::Evaluated(decision);
        }

        let reason = decision.reason();
        match outcome {
            Outcome::Blocked => warn!(
                policy_decision = "deny",
                reason = %reason,
                score = decision.score,
                threshold = decision.threshold,
                client_ip = %ctx.identity.ip,
                endpoint = %ctx.endpoint,
                "Checkout request blocked"
            ),
            _ => info!(
                policy_decision = "log",
                reason = %reason,
                score = decision.score,
                threshold = decision.threshold,
                test_mode = settings.test_mode,
                client_ip = %ctx.identity.ip,
                endpoint = %ctx.endpoint,
                "Suspicious checkout request logged"
            ),
        }

        let country_code = self.geo.lookup(&ctx.identity.ip).await;
        let record = build_record(ctx, &decision, settings, reason, country_code);
        if let Err(e) = self.audit.append(&record) {
            warn!(client_ip = %ctx.identity.ip, error = %e, "Failed to write audit record");
        }

        if let Err(e) = self.limiter.increment(&ctx.identity) {
            warn!(client_ip = %ctx.identity.ip, error = %e, "Failed to increment rate counter");
        }

        Verdict::Evaluated(decision)
    }
}

fn build_record(
    ctx: &RequestContext,
    decision: &Decision,
    settings: &GuardSettings,
    reason: String,
    country_code: Option<String>,
) -> AuditRecord {
    let status = match decision.outcome {
        Outcome::Blocked => RecordStatus::Blocked,
        _ => RecordStatus::Logged,
    };
    let has_token = ctx.cookie_token.is_some();

    AuditRecord {
        id: None,
        ip_address: ctx.identity.ip.clone(),
        endpoint: ctx.endpoint.clone(),
        user_agent: ctx.identity.user_agent.clone(),
        request_data: RequestDetails {
            flags: decision.flags.clone(),
            score: decision.score,
            threshold: decision.threshold,
            test_mode: settings.test_mode,
            method: ctx.method.clone(),
            referer: ctx.referer.clone().unwrap_or_default(),
            has_token: if has_token { "yes" } else { "no" }.to_string(),
        },
        blocked_reason: reason,
        status,
        country_code,
        created_at: Utc::now(),
    }
}
