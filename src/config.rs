//! Risk daemon configuration management.
//!
//! Config is stored as TOML. On first launch a default config is written to
//! the config path so operators have a file to edit.

use crate::providers::{CarrierInfo, CountryRisk, CountryRiskTier};
use crate::scoring::ScoringConfig;
use crate::signals::VelocityLimits;
use crate::velocity_tracker::VelocityKeying;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where per-key velocity and rate-limit state lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window and key
    pub limit: u32,
    pub window_ms: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window_ms: 60_000,
        }
    }
}

/// Risk daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address the line protocol is served on
    pub listen_addr: String,
    pub database_path: String,
    pub log_file: String,
    pub velocity_keying: VelocityKeying,
    pub state_backend: StateBackend,
    /// Seconds between idle-state sweeps
    pub maintenance_interval_secs: u64,
    pub rate_limit: RateLimitConfig,
    pub velocity_limits: VelocityLimits,
    pub scoring: ScoringConfig,
    /// Profile the static carrier lookup answers with
    pub carrier_defaults: CarrierInfo,
    /// IP address to country code, for the static geo lookup
    pub ip_country: HashMap<String, String>,
    /// Rows seeded into the country risk table at startup
    pub country_risk: Vec<CountryRisk>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7171".to_string(),
            database_path: "storage/riskd.db".to_string(),
            log_file: "logs/riskd.log".to_string(),
            velocity_keying: VelocityKeying::default(),
            state_backend: StateBackend::default(),
            maintenance_interval_secs: 300,
            rate_limit: RateLimitConfig::default(),
            velocity_limits: VelocityLimits::default(),
            scoring: ScoringConfig::default(),
            carrier_defaults: CarrierInfo::default(),
            ip_country: HashMap::new(),
            country_risk: default_country_risk(),
        }
    }
}

fn country(code: &str, name: &str, risk_tier: CountryRiskTier, base_score: f64, fraud_rate: f64) -> CountryRisk {
    CountryRisk {
        code: code.to_string(),
        name: name.to_string(),
        risk_tier,
        base_score,
        fraud_rate,
    }
}

fn default_country_risk() -> Vec<CountryRisk> {
    vec![
        country("US", "United States", CountryRiskTier::Low, 10.0, 0.01),
        country("GB", "United Kingdom", CountryRiskTier::Low, 10.0, 0.01),
        country("DE", "Germany", CountryRiskTier::Low, 10.0, 0.01),
        country("FR", "France", CountryRiskTier::Low, 15.0, 0.02),
        country("JP", "Japan", CountryRiskTier::Low, 10.0, 0.01),
        country("AU", "Australia", CountryRiskTier::Low, 10.0, 0.01),
        country("BR", "Brazil", CountryRiskTier::Medium, 40.0, 0.05),
        country("MX", "Mexico", CountryRiskTier::Medium, 40.0, 0.05),
        country("IN", "India", CountryRiskTier::Medium, 45.0, 0.06),
        country("CN", "China", CountryRiskTier::Medium, 45.0, 0.06),
        country("TH", "Thailand", CountryRiskTier::Medium, 50.0, 0.07),
        country("ID", "Indonesia", CountryRiskTier::High, 70.0, 0.15),
        country("PH", "Philippines", CountryRiskTier::High, 70.0, 0.15),
        country("VN", "Vietnam", CountryRiskTier::High, 70.0, 0.15),
        country("PK", "Pakistan", CountryRiskTier::High, 75.0, 0.18),
        country("NG", "Nigeria", CountryRiskTier::High, 80.0, 0.20),
    ]
}

impl ServerConfig {
    /// Load config from file, or write and use the defaults if it doesn't exist
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            log::info!("No config found at {:?}, writing defaults", config_path);
            let config = Self::default();
            config.save(config_path)?;
            Ok(config)
        }
    }

    /// Load config from TOML file
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        let config: ServerConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config TOML")?;
        config.validate()?;
        log::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    /// Save config to TOML file
    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config to {:?}", config_path))?;
        log::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Scoring weights and thresholds are already checked on deserialization;
    /// this covers the rest.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.limit == 0 || self.rate_limit.window_ms <= 0 {
            anyhow::bail!(
                "Rate limit must admit at least one request per positive window, got {:?}",
                self.rate_limit
            );
        }
        let v = &self.velocity_limits;
        if v.max_1min == 0 || v.max_5min == 0 || v.max_1hr == 0 {
            anyhow::bail!("Velocity limits must be non-zero, got {:?}", v);
        }
        if self.maintenance_interval_secs == 0 {
            anyhow::bail!("maintenance_interval_secs must be non-zero");
        }
        if let Some(bad) = self.country_risk.iter().find(|c| !(0.0..=100.0).contains(&c.base_score)) {
            anyhow::bail!("Country {} base_score {} is outside 0-100", bad.code, bad.base_score);
        }
        Ok(())
    }

    /// Apply `DATABASE_PATH`, `LOG_FILE_PATH` and `LISTEN_ADDR` overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("DATABASE_PATH") {
            self.database_path = path;
        }
        if let Some(path) = var("LOG_FILE_PATH") {
            self.log_file = path;
        }
        if let Some(addr) = var("LISTEN_ADDR") {
            self.listen_addr = addr;
        }
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        PathBuf::from("config/riskd.toml")
    }
}
