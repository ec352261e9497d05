use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for admission control
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    decisions: CounterVec,
    configuration_errors: Counter,
    decision_duration: Histogram,

    // Registry metrics
    registry_entries: Gauge,
    evictions: Counter,
    sweeps: Counter,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "admission_decisions_total",
                "Admission decisions by tier and outcome",
            ),
            &["tier", "outcome"],
        )?;

        let configuration_errors = Counter::new(
            "admission_configuration_errors_total",
            "Requests rejected because a required identity field was missing",
        )?;

        let decision_duration = Histogram::with_opts(HistogramOpts::new(
            "admission_decision_duration_seconds",
            "Duration of admission decisions in seconds",
        ))?;

        let registry_entries = Gauge::new(
            "admission_registry_entries",
            "Number of live per-identity buckets",
        )?;

        let evictions = Counter::new(
            "admission_evictions_total",
            "Number of idle buckets evicted",
        )?;

        let sweeps = Counter::new(
            "admission_sweeps_total",
            "Number of eviction sweeps run",
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(configuration_errors.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;
        registry.register(Box::new(registry_entries.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(sweeps.clone()))?;

        Ok(Self {
            registry,
            decisions,
            configuration_errors,
            decision_duration,
            registry_entries,
            evictions,
            sweeps,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an admission decision
    pub fn record_decision(&self, tier: &str, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.decisions.with_label_values(&[tier, outcome]).inc();
    }

    pub fn decisions_total(&self, tier: &str, outcome: &str) -> f64 {
        self.decisions.with_label_values(&[tier, outcome]).get()
    }

    pub fn record_configuration_error(&self) {
        self.configuration_errors.inc();
    }

    pub fn configuration_errors_total(&self) -> f64 {
        self.configuration_errors.get()
    }

    /// Create a timer for measuring decision duration
    pub fn start_decision_timer(&self) -> prometheus::HistogramTimer {
        self.decision_duration.start_timer()
    }

    /// Record the result of an eviction sweep
    pub fn record_sweep(&self, removed: usize, entries: usize) {
        self.sweeps.inc();
        self.evictions.inc_by(removed as f64);
        self.registry_entries.set(entries as f64);
    }

    pub fn set_registry_entries(&self, entries: usize) {
        self.registry_entries.set(entries as f64);
    }

    pub fn evictions_total(&self) -> f64 {
        self.evictions.get()
    }
}
