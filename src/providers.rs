//! Lookups the detection pipeline depends on but does not own.
//!
//! Every provider may fail; the pipeline substitutes documented defaults and
//! keeps going.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneType {
    #[default]
    Mobile,
    Voip,
    Landline,
    TollFree,
    Unknown,
}

impl PhoneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhoneType::Mobile => "mobile",
            PhoneType::Voip => "voip",
            PhoneType::Landline => "landline",
            PhoneType::TollFree => "toll_free",
            PhoneType::Unknown => "unknown",
        }
    }

    /// Lenient parse; anything unrecognized is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "mobile" => PhoneType::Mobile,
            "voip" => PhoneType::Voip,
            "landline" => PhoneType::Landline,
            "toll_free" => PhoneType::TollFree,
            _ => PhoneType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountryRiskTier {
    Low,
    #[default]
    Medium,
    High,
}

impl CountryRiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CountryRiskTier::Low => "low",
            CountryRiskTier::Medium => "medium",
            CountryRiskTier::High => "high",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" => CountryRiskTier::Low,
            "high" => CountryRiskTier::High,
            _ => CountryRiskTier::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryRisk {
    pub code: String,
    pub name: String,
    pub risk_tier: CountryRiskTier,
    pub base_score: f64,
    pub fraud_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierInfo {
    pub name: Option<String>,
    #[serde(rename = "carrier_type")]
    pub phone_type: PhoneType,
    pub risk_score: f64,
    pub delivery_rate: f64,
}

impl Default for CarrierInfo {
    /// What an unreachable carrier lookup degrades to.
    fn default() -> Self {
        Self {
            name: None,
            phone_type: PhoneType::Mobile,
            risk_score: 30.0,
            delivery_rate: 0.95,
        }
    }
}

#[async_trait]
pub trait CountryRiskProvider: Send + Sync {
    async fn lookup(&self, country_code: &str) -> Result<Option<CountryRisk>>;
}

#[async_trait]
pub trait CarrierProvider: Send + Sync {
    async fn lookup(&self, phone_number: &str) -> Result<CarrierInfo>;
}

#[async_trait]
pub trait IpGeoProvider: Send + Sync {
    /// Country code of the address, `None` when unknown.
    async fn lookup(&self, ip: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait ConversionRateProvider: Send + Sync {
    /// Historical verification rate in `[0, 1]` for numbers under the prefix,
    /// over the lookback ending at `now_ms`.
    async fn rate(&self, phone_prefix: &str, now_ms: i64) -> Result<f64>;
}

/// Carrier lookup that answers every number with the same configured profile.
pub struct StaticCarrierLookup {
    info: CarrierInfo,
}

impl StaticCarrierLookup {
    pub fn new(info: CarrierInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl CarrierProvider for StaticCarrierLookup {
    async fn lookup(&self, _phone_number: &str) -> Result<CarrierInfo> {
        Ok(self.info.clone())
    }
}

/// Fixed IP-to-country table. Addresses not listed resolve to `None`, which
/// disables the geo-mismatch penalty.
#[derive(Default)]
pub struct StaticIpGeo {
    table: HashMap<String, String>,
}

impl StaticIpGeo {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl IpGeoProvider for StaticIpGeo {
    async fn lookup(&self, ip: &str) -> Result<Option<String>> {
        Ok(self.table.get(ip).cloned())
    }
}
