//! Per-subsystem configuration loaded from the environment, following
//! the teacher's `CoordinatorConfig::from_env` / `InventoryConfig::from_env`
//! convention: a plain struct with a `Default` impl, overridden field by
//! field from env vars that parse cleanly, never a single monolithic
//! config object.

use std::env;
use std::time::Duration;

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub heartbeat_sweep_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub command_expiry_interval: Duration,
    pub zombie_reaper_interval: Duration,
    pub pricing_consolidation_interval: Duration,
    pub decision_cycle_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_sweep_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            command_expiry_interval: Duration::from_secs(60),
            zombie_reaper_interval: Duration::from_secs(60),
            pricing_consolidation_interval: Duration::from_secs(12 * 3600),
            decision_cycle_interval: Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            heartbeat_sweep_interval: env_duration_secs("HEARTBEAT_SWEEP_INTERVAL_SECS", d.heartbeat_sweep_interval),
            heartbeat_timeout: env_duration_secs("HEARTBEAT_TIMEOUT_SECS", d.heartbeat_timeout),
            command_expiry_interval: env_duration_secs("COMMAND_EXPIRY_INTERVAL_SECS", d.command_expiry_interval),
            zombie_reaper_interval: env_duration_secs("ZOMBIE_REAPER_INTERVAL_SECS", d.zombie_reaper_interval),
            pricing_consolidation_interval: env_duration_secs(
                "PRICING_CONSOLIDATION_INTERVAL_SECS",
                d.pricing_consolidation_interval,
            ),
            decision_cycle_interval: env_duration_secs("DECISION_CYCLE_INTERVAL_SECS", d.decision_cycle_interval),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub default_deadline: Duration,
    pub emergency_deadline: Duration,
    pub termination_cooldown: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_deadline: Duration::from_secs(600),
            emergency_deadline: Duration::from_secs(120),
            termination_cooldown: Duration::from_secs(300),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_deadline: env_duration_secs("COMMAND_DEFAULT_DEADLINE_SECS", d.default_deadline),
            emergency_deadline: env_duration_secs("COMMAND_EMERGENCY_DEADLINE_SECS", d.emergency_deadline),
            termination_cooldown: env_duration_secs("TERMINATION_COOLDOWN_SECS", d.termination_cooldown),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub risk_floor: f64,
    pub min_az_diversity: usize,
    pub max_pool_concentration: f64,
    pub min_ondemand_buffer: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            risk_floor: 0.75,
            min_az_diversity: 3,
            max_pool_concentration: 0.20,
            min_ondemand_buffer: 0.15,
        }
    }
}

impl SafetyConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            risk_floor: env_f64("SAFETY_RISK_FLOOR", d.risk_floor),
            min_az_diversity: env::var("SAFETY_MIN_AZ_DIVERSITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.min_az_diversity),
            max_pool_concentration: env_f64("SAFETY_MAX_POOL_CONCENTRATION", d.max_pool_concentration),
            min_ondemand_buffer: env_f64("SAFETY_MIN_ONDEMAND_BUFFER", d.min_ondemand_buffer),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmergencyConfig {
    pub rebalance_horizon: Duration,
    pub rebalance_create_replica_deadline: Duration,
    pub termination_promote_deadline: Duration,
    pub termination_create_replica_deadline: Duration,
    pub min_boot_time_samples: u32,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            rebalance_horizon: Duration::from_secs(120),
            rebalance_create_replica_deadline: Duration::from_secs(120),
            termination_promote_deadline: Duration::from_secs(30),
            termination_create_replica_deadline: Duration::from_secs(60),
            min_boot_time_samples: 3,
        }
    }
}

impl EmergencyConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            rebalance_horizon: env_duration_secs("EMERGENCY_REBALANCE_HORIZON_SECS", d.rebalance_horizon),
            rebalance_create_replica_deadline: env_duration_secs(
                "EMERGENCY_REBALANCE_DEADLINE_SECS",
                d.rebalance_create_replica_deadline,
            ),
            termination_promote_deadline: env_duration_secs(
                "EMERGENCY_TERMINATION_PROMOTE_DEADLINE_SECS",
                d.termination_promote_deadline,
            ),
            termination_create_replica_deadline: env_duration_secs(
                "EMERGENCY_TERMINATION_CREATE_DEADLINE_SECS",
                d.termination_create_replica_deadline,
            ),
            min_boot_time_samples: d.min_boot_time_samples,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub bucket: Duration,
    pub gap_lookback: Duration,
    pub raw_retention: Duration,
    pub consolidated_retention: Duration,
    pub canonical_retention: Duration,
    pub interpolation_confidence: f64,
    pub backfill_confidence: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            bucket: Duration::from_secs(300),
            gap_lookback: Duration::from_secs(13 * 3600),
            raw_retention: Duration::from_secs(7 * 86400),
            consolidated_retention: Duration::from_secs(90 * 86400),
            canonical_retention: Duration::from_secs(365 * 86400),
            interpolation_confidence: 0.80,
            backfill_confidence: 0.90,
        }
    }
}

impl PricingConfig {
    pub fn from_env() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub rate_limit_per_minute: u32,
    pub price_sample_buffer_per_pool_per_minute: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            rate_limit_per_minute: 600,
            price_sample_buffer_per_pool_per_minute: 120,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_string("BIND_ADDR", &d.bind_addr),
            rate_limit_per_minute: env::var("RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.rate_limit_per_minute),
            price_sample_buffer_per_pool_per_minute: env::var("PRICE_SAMPLE_BUFFER_PER_POOL_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.price_sample_buffer_per_pool_per_minute),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
}

impl StoreConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        Ok(Self { database_url })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub safety: SafetyConfig,
    pub emergency: EmergencyConfig,
    pub pricing: PricingConfig,
    pub api: ApiConfig,
    pub scorer_artifact_path: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self {
            scheduler: SchedulerConfig::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            safety: SafetyConfig::from_env(),
            emergency: EmergencyConfig::from_env(),
            pricing: PricingConfig::from_env(),
            api: ApiConfig::from_env(),
            scorer_artifact_path: env::var("SCORER_ARTIFACT_PATH").ok(),
        }
    }
}
