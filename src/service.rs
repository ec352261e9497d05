use std::{net::IpAddr, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

use crate::{
    config::{AdmissionConfig, CompiledTierLimits, RegistrySettings},
    error::{AdmissionError, Result},
    metrics::Metrics,
    policy::{AdmissionPolicy, AdmissionRequest, Tier},
    registry::LimiterRegistry,
    reporter::{DecisionReporter, Report},
    sweeper::EvictionSweeper,
    utils::{ceil_secs, TimeSource},
};

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub tier: Tier,
    /// Requests per window; `None` for unlimited callers
    pub limit: Option<u32>,
    /// Whole tokens left after this request
    pub remaining: Option<u32>,
    /// Unix seconds at which the bucket is full again
    pub reset_at: Option<i64>,
    /// Zero unless denied
    pub retry_after: Duration,
}

impl Decision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            tier: Tier::Unlimited,
            limit: None,
            remaining: None,
            reset_at: None,
            retry_after: Duration::ZERO,
        }
    }
}

/// Entry point the HTTP layer calls before dispatching a request
pub struct AdmissionService {
    policy: AdmissionPolicy,
    registry: Arc<LimiterRegistry>,
    reporter: DecisionReporter,
    metrics: Arc<Metrics>,
    trusted_proxies: Vec<IpAddr>,
}

impl AdmissionService {
    pub fn new(
        policy: AdmissionPolicy,
        registry: Arc<LimiterRegistry>,
        reporter: DecisionReporter,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            policy,
            registry,
            reporter,
            metrics,
            trusted_proxies: Vec::new(),
        }
    }

    /// Honour forwarding headers from these socket peers
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    /// Validate a configuration and build the full admission stack from it
    pub fn from_config(
        config: &AdmissionConfig,
        clock: Arc<dyn TimeSource>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let limits = CompiledTierLimits::compile(&config.tiers)?;
        let settings = RegistrySettings::from_config(&config.registry)?;

        let registry = Arc::new(LimiterRegistry::new(limits.clone(), settings, clock));
        let policy = AdmissionPolicy::new(config.unlimited_roles.iter().cloned());
        let reporter = DecisionReporter::new(limits);

        Ok(Self::new(policy, registry, reporter, metrics)
            .with_trusted_proxies(config.trusted_proxies.clone()))
    }

    /// Decide whether `request` may proceed.
    ///
    /// A denial is `Ok` with `allowed == false`. `Err` means the request could
    /// not be classified and should be answered with an internal error.
    pub fn admit(&self, request: &AdmissionRequest) -> Result<Decision> {
        let _timer = self.metrics.start_decision_timer();

        let classification = self.policy.classify(request).map_err(|e| {
            self.metrics.record_configuration_error();
            error!("Rejecting unclassifiable request: {}", e);
            e
        })?;

        if !classification.tier.is_metered() {
            debug!(identity = %classification.identity, "unlimited caller admitted");
            self.metrics.record_decision(Tier::Unlimited.as_str(), true);
            return Ok(Decision::unlimited());
        }

        let tier = classification.tier;
        let limit = self
            .registry
            .limit_for(tier)
            .ok_or(AdmissionError::TierNotMetered(tier))?
            .requests_per_unit;

        let (outcome, time_to_full) = {
            let mut bucket = self.registry.acquire(tier, &classification.identity)?;
            let outcome = bucket.try_consume();
            (outcome, bucket.time_to_full())
        };

        let remaining = outcome.remaining.floor() as u32;
        let reset_at = self.registry.clock().unix_now() + ceil_secs(time_to_full) as i64;

        if outcome.allowed {
            debug!(
                tier = tier.as_str(),
                identity = %classification.identity,
                remaining,
                "request admitted"
            );
        } else {
            warn!(
                tier = tier.as_str(),
                identity = %classification.identity,
                retry_after_ms = outcome.retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
        }
        self.metrics.record_decision(tier.as_str(), outcome.allowed);

        Ok(Decision {
            allowed: outcome.allowed,
            tier,
            limit: Some(limit),
            remaining: Some(remaining),
            reset_at: Some(reset_at),
            retry_after: outcome.retry_after,
        })
    }

    /// Response metadata for a decision
    pub fn report(&self, decision: &Decision) -> Report {
        self.reporter.report(decision)
    }

    pub fn reporter(&self) -> &DecisionReporter {
        &self.reporter
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn trusted_proxies(&self) -> &[IpAddr] {
        &self.trusted_proxies
    }

    /// Start periodic eviction for this service's registry
    pub fn start_sweeper(&self) -> EvictionSweeper {
        EvictionSweeper::start(self.registry.clone(), self.metrics.clone())
    }
}
