//! End-to-end analysis of one verification request.
//!
//! Parses the number, snapshots (and records) velocity, consults the
//! providers, runs the signal calculators and scores the result. A
//! well-formed request always gets a decision: every provider or storage
//! failure degrades to a documented default.

use crate::db_utils::DEFAULT_CONVERSION_RATE;
use crate::phone::parse_phone_number;
use crate::providers::{
    CarrierInfo, CarrierProvider, ConversionRateProvider, CountryRiskProvider, CountryRiskTier,
    IpGeoProvider, PhoneType,
};
use crate::scoring::{
    calculate_fraud_score, decide, explain, risk_tier, Decision, RiskTier, ScoringConfig,
    SignalBreakdown,
};
use crate::signals::{
    behavior_risk, carrier_risk, geo_risk, user_agent_risk, velocity_risk, VelocityLimits,
    DEFAULT_COUNTRY_SCORE,
};
use crate::velocity_tracker::{VelocityData, VelocityTracker};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

/// Caller-supplied context for one SMS verification attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub phone_number: String,
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Time from page load to the SMS request, when the client reports it
    #[serde(default, deserialize_with = "lenient_duration")]
    pub session_duration_ms: Option<u64>,
}

/// Fractional durations are truncated; negative or non-finite ones are
/// treated as not reported.
fn lenient_duration<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?;
    Ok(raw
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| ms as u64))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneInfo {
    pub country: String,
    pub carrier: Option<String>,
    #[serde(rename = "type")]
    pub phone_type: PhoneType,
    pub risk_level: CountryRiskTier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub signals: SignalBreakdown,
    pub phone_info: PhoneInfo,
    pub decision: Decision,
    pub fraud_score: u8,
    pub risk_tier: RiskTier,
    pub explanation: String,
    pub velocity: VelocityData,
    /// Digits of the number, for storage and prefix queries
    #[serde(skip)]
    pub phone_digits: String,
}

/// External lookups used by the pipeline.
#[derive(Clone)]
pub struct Providers {
    pub country_risk: Arc<dyn CountryRiskProvider>,
    pub carrier: Arc<dyn CarrierProvider>,
    pub ip_geo: Arc<dyn IpGeoProvider>,
    pub conversion: Arc<dyn ConversionRateProvider>,
}

pub struct Detector {
    tracker: Arc<VelocityTracker>,
    providers: Providers,
    limits: VelocityLimits,
    scoring: ScoringConfig,
}

impl Detector {
    pub fn new(
        tracker: Arc<VelocityTracker>,
        providers: Providers,
        limits: VelocityLimits,
        scoring: ScoringConfig,
    ) -> Self {
        Self {
            tracker,
            providers,
            limits,
            scoring,
        }
    }

    pub fn scoring(&self) -> &ScoringConfig {
        &self.scoring
    }

    pub fn tracker(&self) -> &VelocityTracker {
        &self.tracker
    }

    pub async fn analyze(&self, request: &CheckRequest, now_ms: i64) -> DetectionResult {
        self.analyze_with(request, &self.scoring, now_ms).await
    }

    /// Analyze with a per-call scoring override.
    pub async fn analyze_with(
        &self,
        request: &CheckRequest,
        scoring: &ScoringConfig,
        now_ms: i64,
    ) -> DetectionResult {
        let parsed = parse_phone_number(&request.phone_number);

        let country_risk = match self.providers.country_risk.lookup(&parsed.country).await {
            Ok(risk) => risk,
            Err(e) => {
                log::warn!("Country risk lookup failed for {}: {}", parsed.country, e);
                None
            }
        };
        let base_score = country_risk
            .as_ref()
            .map_or(DEFAULT_COUNTRY_SCORE, |r| r.base_score);

        let ip_country = match self.providers.ip_geo.lookup(&request.ip_address).await {
            Ok(country) => country,
            Err(e) => {
                log::warn!("IP geo lookup failed for {}: {}", request.ip_address, e);
                None
            }
        };
        let geo = geo_risk(base_score, ip_country.as_deref(), &parsed.country);

        let velocity = self
            .tracker
            .observe(&request.ip_address, &parsed.prefix, &request.phone_number, now_ms)
            .await;
        let velocity_score = velocity_risk(&velocity, &self.limits);

        let carrier_info = match self.providers.carrier.lookup(&request.phone_number).await {
            Ok(info) => info,
            Err(e) => {
                log::warn!("Carrier lookup failed for prefix {}: {}", parsed.prefix, e);
                CarrierInfo::default()
            }
        };
        let carrier = carrier_risk(
            carrier_info.phone_type,
            carrier_info.risk_score,
            carrier_info.delivery_rate,
        );

        let conversion_rate = match self.providers.conversion.rate(&parsed.prefix, now_ms).await {
            Ok(rate) => rate,
            Err(e) => {
                log::warn!("Conversion rate lookup failed for {}: {}", parsed.prefix, e);
                DEFAULT_CONVERSION_RATE
            }
        };
        let behavior = behavior_risk(
            request.session_duration_ms,
            conversion_rate,
            user_agent_risk(request.user_agent.as_deref()),
        );

        let signals = SignalBreakdown {
            geo_risk: geo,
            velocity_risk: velocity_score,
            carrier_risk: carrier,
            behavior_risk: behavior,
        };
        let fraud_score = calculate_fraud_score(&signals, scoring);
        let decision = decide(fraud_score, scoring);

        log::info!(
            "Scored request country={} prefix={} score={} decision={}",
            parsed.country,
            parsed.prefix,
            fraud_score,
            decision.as_str()
        );

        DetectionResult {
            signals,
            phone_info: PhoneInfo {
                country: parsed.country,
                carrier: carrier_info.name,
                phone_type: carrier_info.phone_type,
                risk_level: country_risk.map(|r| r.risk_tier).unwrap_or_default(),
            },
            decision,
            fraud_score,
            risk_tier: risk_tier(fraud_score),
            explanation: explain(&signals),
            velocity,
            phone_digits: parsed.digits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::{FixedConversionRate, FixedCountryRisk, Unavailable};
    use crate::providers::{StaticCarrierLookup, StaticIpGeo};
    use crate::scoring::{ScoringThresholds, ScoringWeights};
    use crate::state_store::MemoryStateStore;
    use crate::velocity_tracker::VelocityKeying;
    use std::collections::HashMap;

    const NOW: i64 = 1_700_000_000_000;
    const CHROME_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15";

    fn tracker() -> Arc<VelocityTracker> {
        Arc::new(VelocityTracker::new(
            Arc::new(MemoryStateStore::new()),
            VelocityKeying::Ip,
        ))
    }

    fn providers(ip_table: &[(&str, &str)], carrier: CarrierInfo, conversion: f64) -> Providers {
        Providers {
            country_risk: Arc::new(FixedCountryRisk::with(&[
                ("US", CountryRiskTier::Low, 10.0),
                ("NG", CountryRiskTier::High, 70.0),
            ])),
            carrier: Arc::new(StaticCarrierLookup::new(carrier)),
            ip_geo: Arc::new(StaticIpGeo::new(
                ip_table
                    .iter()
                    .map(|(ip, c)| (ip.to_string(), c.to_string()))
                    .collect::<HashMap<_, _>>(),
            )),
            conversion: Arc::new(FixedConversionRate(conversion)),
        }
    }

    fn request(phone: &str, ip: &str) -> CheckRequest {
        CheckRequest {
            phone_number: phone.to_string(),
            ip_address: ip.to_string(),
            user_agent: Some(CHROME_UA.to_string()),
            session_id: Some("sess_1".to_string()),
            session_duration_ms: Some(15_000),
        }
    }

    fn detector(providers: Providers) -> Detector {
        Detector::new(
            tracker(),
            providers,
            VelocityLimits::default(),
            ScoringConfig::default(),
        )
    }

    #[test]
    fn test_session_duration_parsing() {
        let parse = |duration: &str| -> Option<u64> {
            let line = format!(
                r#"{{"phoneNumber":"+15550100001","ipAddress":"10.0.0.1","sessionDurationMs":{}}}"#,
                duration
            );
            serde_json::from_str::<CheckRequest>(&line).unwrap().session_duration_ms
        };
        assert_eq!(parse("1500"), Some(1500));
        assert_eq!(parse("1500.5"), Some(1500));
        assert_eq!(parse("-1"), None);
        assert_eq!(parse("null"), None);

        let absent: CheckRequest =
            serde_json::from_str(r#"{"phoneNumber":"+15550100001","ipAddress":"10.0.0.1"}"#).unwrap();
        assert_eq!(absent.session_duration_ms, None);
    }

    #[tokio::test]
    async fn test_clean_request_is_allowed() {
        let d = detector(providers(&[("198.51.100.1", "US")], CarrierInfo::default(), 0.9));
        let result = d.analyze(&request("+1 555 010 0001", "198.51.100.1"), NOW).await;

        assert_eq!(result.signals.geo_risk, 10.0);
        assert_eq!(result.signals.velocity_risk, 0.0);
        assert_eq!(result.signals.carrier_risk, 30.0);
        assert_eq!(result.signals.behavior_risk, 0.0);
        // 2.5 + 0 + 7.5 + 0 = 10
        assert_eq!(result.fraud_score, 10);
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.phone_info.country, "US");
        assert_eq!(result.phone_info.risk_level, CountryRiskTier::Low);
        assert_eq!(result.phone_info.phone_type, PhoneType::Mobile);
        assert_eq!(result.risk_tier, RiskTier::Low);
        assert_eq!(result.phone_digits, "15550100001");
    }

    #[tokio::test]
    async fn test_pumping_pattern_is_blocked() {
        let voip = CarrierInfo {
            name: Some("Cheap VoIP".to_string()),
            phone_type: PhoneType::Voip,
            risk_score: 40.0,
            delivery_rate: 0.5,
        };
        let d = detector(providers(&[("203.0.113.7", "US")], voip, 0.05));

        let mut last = None;
        for i in 0..12 {
            let mut req = request(&format!("+234801000{:04}", i), "203.0.113.7");
            req.user_agent = Some("python-requests/2.31".to_string());
            req.session_duration_ms = Some(200);
            last = Some(d.analyze(&req, NOW + i * 1_000).await);
        }
        let result = last.unwrap();

        // 11 prior requests in the last minute, sequential numbers
        assert_eq!(result.velocity.requests_1min, 11);
        assert!(result.velocity.sequential_detected);
        // NG base 70 + mismatch 25
        assert_eq!(result.signals.geo_risk, 95.0);
        // min(40, 11/5*20) + 30
        assert_eq!(result.signals.velocity_risk, 70.0);
        // 40 + 25 + 20
        assert_eq!(result.signals.carrier_risk, 85.0);
        // 30 + 40 + 25
        assert_eq!(result.signals.behavior_risk, 95.0);
        assert_eq!(result.decision, Decision::Block);
        assert_eq!(result.phone_info.carrier.as_deref(), Some("Cheap VoIP"));
        assert!(result.explanation.starts_with("Elevated risk due to: high-risk geographic region"));
    }

    #[tokio::test]
    async fn test_request_never_counts_itself() {
        let d = detector(providers(&[], CarrierInfo::default(), 0.9));
        let first = d.analyze(&request("+15550100001", "10.0.0.1"), NOW).await;
        assert_eq!(first.velocity, VelocityData::default());
        let second = d.analyze(&request("+15550100002", "10.0.0.1"), NOW).await;
        assert_eq!(second.velocity.requests_1min, 1);
    }

    #[tokio::test]
    async fn test_unavailable_providers_use_defaults() {
        let providers = Providers {
            country_risk: Arc::new(Unavailable),
            carrier: Arc::new(Unavailable),
            ip_geo: Arc::new(Unavailable),
            conversion: Arc::new(Unavailable),
        };
        let d = detector(providers);
        let mut req = request("+999 12345", "10.0.0.1");
        req.user_agent = None;
        req.session_duration_ms = None;
        let result = d.analyze(&req, NOW).await;

        assert_eq!(result.phone_info.country, "UNKNOWN");
        assert_eq!(result.signals.geo_risk, 50.0);
        assert_eq!(result.signals.carrier_risk, 30.0);
        // Missing UA 20, default conversion 0.5 adds nothing
        assert_eq!(result.signals.behavior_risk, 20.0);
        assert_eq!(result.phone_info.risk_level, CountryRiskTier::Medium);
        // 12.5 + 0 + 7.5 + 4 = 24
        assert_eq!(result.fraud_score, 24);
        assert_eq!(result.decision, Decision::Allow);
    }

    #[tokio::test]
    async fn test_scoring_override() {
        let d = detector(providers(&[], CarrierInfo::default(), 0.9));
        let strict = ScoringConfig::new(
            ScoringWeights::default(),
            ScoringThresholds {
                allow_max: 5,
                block_min: 20,
            },
        )
        .unwrap();
        let result = d
            .analyze_with(&request("+15550100001", "10.0.0.1"), &strict, NOW)
            .await;
        assert_eq!(result.fraud_score, 10);
        assert_eq!(result.decision, Decision::Review);
    }
}
