//! Concurrent per-identity bucket storage.
//!
//! Buckets live in a sharded [`DashMap`]. Acquiring a bucket holds the write
//! lock of the key's shard until the returned [`BucketGuard`] drops. Creation
//! and refill+consume for one identity therefore happen under one lock, and
//! eviction, which takes the same lock, cannot remove a bucket in use.
//! Identities on other shards proceed in parallel.

use dashmap::{mapref::entry::Entry, mapref::one::RefMut, DashMap};
use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::{
    bucket::{ConsumeOutcome, TokenBucket},
    config::{CompiledTierLimits, RegistrySettings, TierLimit},
    error::{AdmissionError, Result},
    policy::Tier,
    utils::TimeSource,
};

/// Registry key: one bucket per identity per tier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub tier: Tier,
    pub identity: String,
}

struct RegistryEntry {
    bucket: TokenBucket,
    last_accessed: Instant,
}

/// Exclusive access to one identity's bucket for the duration of a check.
pub struct BucketGuard<'a> {
    entry: RefMut<'a, BucketKey, RegistryEntry>,
    now: Instant,
}

impl BucketGuard<'_> {
    /// Refill and consume one token at the time of acquisition
    pub fn try_consume(&mut self) -> ConsumeOutcome {
        let now = self.now;
        self.entry.bucket.try_consume(now)
    }

    pub fn key(&self) -> &BucketKey {
        self.entry.key()
    }
}

impl Deref for BucketGuard<'_> {
    type Target = TokenBucket;

    fn deref(&self) -> &TokenBucket {
        &self.entry.bucket
    }
}

/// Owns every token bucket, keyed by `(tier, identity)`.
pub struct LimiterRegistry {
    buckets: DashMap<BucketKey, RegistryEntry>,
    entries: AtomicUsize,
    limits: CompiledTierLimits,
    settings: RegistrySettings,
    clock: Arc<dyn TimeSource>,
    pressure: Notify,
}

impl LimiterRegistry {
    pub fn new(
        limits: CompiledTierLimits,
        settings: RegistrySettings,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            buckets: DashMap::new(),
            entries: AtomicUsize::new(0),
            limits,
            settings,
            clock,
            pressure: Notify::new(),
        }
    }

    /// Get the bucket for `(tier, identity)`, creating a full one on first use.
    ///
    /// Concurrent first acquires for the same key all end up on one bucket.
    /// Keep the guard short-lived: it blocks other keys on the same shard.
    pub fn acquire(&self, tier: Tier, identity: &str) -> Result<BucketGuard<'_>> {
        let limit = self
            .limits
            .limit(tier)
            .ok_or(AdmissionError::TierNotMetered(tier))?;
        if identity.is_empty() {
            return Err(AdmissionError::Configuration(format!(
                "empty identity for {} tier",
                tier
            )));
        }

        let key = BucketKey {
            tier,
            identity: identity.to_string(),
        };

        let entry = self.buckets.entry(key);
        // Read the clock under the shard lock so instants applied to one
        // bucket never go backwards.
        let now = self.clock.now();
        let mut entry = match entry {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => {
                let live = self.entries.fetch_add(1, Ordering::Relaxed) + 1;
                if live >= self.settings.max_entries {
                    self.pressure.notify_one();
                }
                vacant.insert(RegistryEntry {
                    bucket: TokenBucket::new(limit, now),
                    last_accessed: now,
                })
            }
        };
        entry.last_accessed = now;

        Ok(BucketGuard { entry, now })
    }

    /// Acquire and consume in one step
    pub fn try_consume(&self, tier: Tier, identity: &str) -> Result<ConsumeOutcome> {
        let mut guard = self.acquire(tier, identity)?;
        Ok(guard.try_consume())
    }

    /// Remove buckets idle for longer than the idle window. Under memory
    /// pressure the shorter pressure window applies. Returns the number of
    /// buckets removed.
    pub fn evict(&self) -> usize {
        let under_pressure = self.is_under_pressure();
        let idle_timeout = if under_pressure {
            self.settings.pressure_idle_timeout
        } else {
            self.settings.idle_timeout
        };

        let now = self.clock.now();
        let mut removed = 0;
        self.buckets.retain(|_, entry| {
            let keep = now.saturating_duration_since(entry.last_accessed) < idle_timeout;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.entries.fetch_sub(removed, Ordering::Relaxed);

        if under_pressure {
            warn!(
                removed,
                remaining = self.len(),
                max_entries = self.settings.max_entries,
                "registry under pressure, evicted with shortened idle window"
            );
        } else {
            debug!(removed, remaining = self.len(), "registry sweep complete");
        }

        removed
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, tier: Tier, identity: &str) -> bool {
        self.buckets.contains_key(&BucketKey {
            tier,
            identity: identity.to_string(),
        })
    }

    pub fn is_under_pressure(&self) -> bool {
        self.len() >= self.settings.max_entries
    }

    /// Configured limit for a metered tier
    pub fn limit_for(&self, tier: Tier) -> Option<&TierLimit> {
        self.limits.limit(tier)
    }

    pub fn limits(&self) -> &CompiledTierLimits {
        &self.limits
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn TimeSource> {
        &self.clock
    }

    /// Resolves when a new bucket pushes the registry to its entry limit
    pub(crate) async fn pressure_signal(&self) {
        self.pressure.notified().await
    }
}
