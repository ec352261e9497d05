use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{metrics::Metrics, registry::LimiterRegistry};

/// Background task that periodically evicts idle buckets.
///
/// Runs every sweep interval, and immediately when the registry signals
/// memory pressure. Dropping the handle without calling [`stop`](Self::stop)
/// leaves the task running until the runtime shuts down.
pub struct EvictionSweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl EvictionSweeper {
    /// Spawn the sweep loop on the current tokio runtime
    pub fn start(registry: Arc<LimiterRegistry>, metrics: Arc<Metrics>) -> Self {
        let period = registry.settings().sweep_interval;
        Self::start_with_interval(registry, metrics, period)
    }

    pub fn start_with_interval(
        registry: Arc<LimiterRegistry>,
        metrics: Arc<Metrics>,
        period: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        info!(interval_secs = period.as_secs_f64(), "starting registry eviction sweeper");

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = registry.pressure_signal() => {
                        warn!(entries = registry.len(), "registry pressure, sweeping early");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let removed = registry.evict();
                metrics.record_sweep(removed, registry.len());
                debug!(removed, "eviction sweep tick completed");
            }

            info!("registry eviction sweeper stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the loop to exit and wait for it
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("eviction sweeper task failed: {}", e);
        }
    }
}
