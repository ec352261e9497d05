use serde::Serialize;

use crate::{
    config::{CompiledTierLimits, RemediationAction},
    error::AdmissionError,
    policy::Tier,
    service::Decision,
    utils::ceil_secs,
};

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Machine-readable reason carried by every rate-limit rejection
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

/// Response metadata for a metered decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    /// Whole tokens left
    pub remaining: u32,
    /// Unix seconds
    pub reset: i64,
    /// Only set on deny
    pub retry_after_secs: Option<u64>,
}

impl RateLimitHeaders {
    /// Header name/value pairs in the order they should be set
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after_secs {
            pairs.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        pairs
    }
}

/// Suggested next action for a rejected caller, serialized as a single
/// `upgrade_url` or `signup_url` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RemediationHint {
    #[serde(rename = "upgrade_url")]
    Upgrade(String),
    #[serde(rename = "signup_url")]
    Signup(String),
}

/// Body of a 429 response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub error: &'static str,
    pub message: String,
    pub tier: Tier,
    pub retry_after_secs: u64,
    #[serde(flatten)]
    pub hint: Option<RemediationHint>,
}

/// Body of a 500 response for requests that could not be classified
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// Everything the HTTP layer needs to act on a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// `None` for unlimited callers
    pub headers: Option<RateLimitHeaders>,
    /// `Some` exactly when the request must not proceed
    pub rejection: Option<Rejection>,
}

impl Report {
    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

/// Turns decisions into response metadata and rejection payloads.
#[derive(Debug, Clone)]
pub struct DecisionReporter {
    limits: CompiledTierLimits,
}

impl DecisionReporter {
    pub fn new(limits: CompiledTierLimits) -> Self {
        Self { limits }
    }

    pub fn report(&self, decision: &Decision) -> Report {
        let headers = match (decision.limit, decision.remaining, decision.reset_at) {
            (Some(limit), Some(remaining), Some(reset)) => Some(RateLimitHeaders {
                limit,
                remaining,
                reset,
                retry_after_secs: (!decision.allowed).then(|| ceil_secs(decision.retry_after)),
            }),
            _ => None,
        };

        let rejection = (!decision.allowed).then(|| self.rejection(decision));

        Report { headers, rejection }
    }

    fn rejection(&self, decision: &Decision) -> Rejection {
        let tier = decision.tier;
        let limit = self.limits.limit(tier);
        let remediation = self.limits.remediation(tier);

        let allowance = match limit {
            Some(limit) => format!("{} requests per {}", limit.requests_per_unit, limit.window_label),
            None => "a limited number of requests".to_string(),
        };
        let prefix = match tier {
            Tier::Guest => format!("Guest users are limited to {}.", allowance),
            _ => format!("Free tier allows {}.", allowance),
        };
        let suffix = match remediation.map(|r| r.action) {
            Some(RemediationAction::Upgrade) => " Upgrade to premium for unlimited access.",
            Some(RemediationAction::Signup) => " Please sign up for more access.",
            None => "",
        };

        let hint = remediation.map(|r| match r.action {
            RemediationAction::Upgrade => RemediationHint::Upgrade(r.url.clone()),
            RemediationAction::Signup => RemediationHint::Signup(r.url.clone()),
        });

        Rejection {
            error: RATE_LIMIT_EXCEEDED,
            message: format!("{}{}", prefix, suffix),
            tier,
            retry_after_secs: ceil_secs(decision.retry_after),
            hint,
        }
    }

    /// Payload for a request that failed before a decision was made
    pub fn report_error(&self, error: &AdmissionError) -> ErrorBody {
        ErrorBody {
            error: "internal_error",
            message: error.to_string(),
        }
    }
}
