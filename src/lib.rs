//! Tiered Rate Limiting
//!
//! In-process admission control for an AI API gateway. Every inbound request
//! is classified into a tier (unlimited, standard or guest) and, unless
//! unlimited, checked against a per-identity continuous token bucket.
//! Idle buckets are evicted by a background sweeper so memory tracks the set
//! of recently active callers.

pub mod bucket;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod reporter;
pub mod service;
pub mod sweeper;
pub mod utils;

// Re-export main types
pub use bucket::{ConsumeOutcome, TokenBucket};
pub use config::{AdmissionConfig, CompiledTierLimits};
pub use error::{AdmissionError, Result};
pub use policy::{AdmissionPolicy, AdmissionRequest, AuthContext, Tier};
pub use registry::LimiterRegistry;
pub use reporter::{DecisionReporter, Report};
pub use service::{AdmissionService, Decision};
pub use sweeper::EvictionSweeper;
