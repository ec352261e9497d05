use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use crate::{
    error::{AdmissionError, Result},
    policy::Tier,
    utils::Unit,
};

/// Admission control configuration, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub tiers: TiersConfig,
    /// Roles that bypass metering entirely
    pub unlimited_roles: Vec<String>,
    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are honoured
    pub trusted_proxies: Vec<IpAddr>,
    pub registry: RegistryConfig,
}

/// Budgets for the metered tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub standard: TierConfig,
    pub guest: TierConfig,
}

/// Budget for one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Bucket capacity
    pub burst: u32,
    pub requests_per_unit: u32,
    pub unit: Unit,
    /// Defaults to the unit name
    pub window_label: Option<String>,
    pub remediation: Remediation,
}

/// Where a denied caller should go next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub action: RemediationAction,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationAction {
    Upgrade,
    Signup,
}

/// Registry maintenance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Live entry count that counts as memory pressure
    pub max_entries: usize,
    /// Idle window used while under pressure
    pub pressure_idle_timeout_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            tiers: TiersConfig::default(),
            unlimited_roles: vec!["user".to_string(), "admin".to_string()],
            trusted_proxies: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
            registry: RegistryConfig::default(),
        }
    }
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            standard: TierConfig {
                burst: 5,
                requests_per_unit: 10,
                unit: Unit::Minute,
                window_label: None,
                remediation: Remediation {
                    action: RemediationAction::Upgrade,
                    url: "/api/public/upgrade".to_string(),
                },
            },
            guest: TierConfig {
                burst: 2,
                requests_per_unit: 3,
                unit: Unit::Minute,
                window_label: None,
                remediation: Remediation {
                    action: RemediationAction::Signup,
                    url: "/api/public/register-user".to_string(),
                },
            },
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            sweep_interval_secs: 60,
            max_entries: 100_000,
            pressure_idle_timeout_secs: 60,
        }
    }
}

/// Validated runtime limit for one metered tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierLimit {
    pub burst: u32,
    pub requests_per_unit: u32,
    pub unit: Unit,
    pub window_label: String,
}

/// Validated registry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_entries: usize,
    pub pressure_idle_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            max_entries: 100_000,
            pressure_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl RegistrySettings {
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        if config.idle_timeout_secs == 0 {
            return Err(AdmissionError::Config(
                "registry.idle_timeout_secs must be positive".to_string(),
            ));
        }
        if config.sweep_interval_secs == 0 {
            return Err(AdmissionError::Config(
                "registry.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if config.max_entries == 0 {
            return Err(AdmissionError::Config(
                "registry.max_entries must be positive".to_string(),
            ));
        }

        // Pressure can only shorten the idle window.
        let pressure_secs = config
            .pressure_idle_timeout_secs
            .clamp(1, config.idle_timeout_secs);

        Ok(Self {
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            max_entries: config.max_entries,
            pressure_idle_timeout: Duration::from_secs(pressure_secs),
        })
    }
}

/// Immutable per-tier lookup table built from [`AdmissionConfig`]
#[derive(Debug, Clone)]
pub struct CompiledTierLimits {
    limits: HashMap<Tier, TierLimit>,
    remediations: HashMap<Tier, Remediation>,
}

impl CompiledTierLimits {
    /// Validate and compile the tier section of a configuration
    pub fn compile(config: &TiersConfig) -> Result<Self> {
        let mut limits = HashMap::new();
        let mut remediations = HashMap::new();

        for (tier, tier_config) in [(Tier::Standard, &config.standard), (Tier::Guest, &config.guest)] {
            limits.insert(tier, Self::compile_tier(tier, tier_config)?);
            remediations.insert(tier, tier_config.remediation.clone());
        }

        Ok(Self {
            limits,
            remediations,
        })
    }

    fn compile_tier(tier: Tier, config: &TierConfig) -> Result<TierLimit> {
        if config.burst == 0 {
            return Err(AdmissionError::Config(format!(
                "{} tier burst must be positive",
                tier
            )));
        }
        if config.requests_per_unit == 0 {
            return Err(AdmissionError::Config(format!(
                "{} tier requests_per_unit must be positive",
                tier
            )));
        }

        Ok(TierLimit {
            burst: config.burst,
            requests_per_unit: config.requests_per_unit,
            unit: config.unit,
            window_label: config
                .window_label
                .clone()
                .unwrap_or_else(|| config.unit.as_str().to_string()),
        })
    }

    /// Limit for a metered tier; `None` for unlimited
    pub fn limit(&self, tier: Tier) -> Option<&TierLimit> {
        self.limits.get(&tier)
    }

    pub fn remediation(&self, tier: Tier) -> Option<&Remediation> {
        self.remediations.get(&tier)
    }
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<AdmissionConfig> {
    serde_yaml::from_str(yaml).map_err(|e| {
        AdmissionError::Config(format!("Failed to parse YAML: {}", e))
    })
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<AdmissionConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}

/// Load configuration from an optional YAML file layered under
/// `ADMISSION__*` environment variables, e.g.
/// `ADMISSION__REGISTRY__IDLE_TIMEOUT_SECS=300`.
pub fn load_layered_config(path: Option<&str>) -> Result<AdmissionConfig> {
    let defaults = ::config::Config::try_from(&AdmissionConfig::default())?;
    let mut builder = ::config::Config::builder().add_source(defaults);

    if let Some(path) = path {
        builder = builder.add_source(
            ::config::File::new(path, ::config::FileFormat::Yaml).required(true),
        );
    }

    let settings = builder
        .add_source(
            ::config::Environment::with_prefix("ADMISSION")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("unlimited_roles")
                .with_list_parse_key("trusted_proxies"),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}
