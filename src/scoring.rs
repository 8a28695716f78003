//! Weighted fraud score, three-way decision and explanation text.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;
const EXPLAIN_THRESHOLD: f64 = 60.0;

/// Per-request risk signals, each in `[0, 100]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub geo_risk: f64,
    pub velocity_risk: f64,
    pub carrier_risk: f64,
    pub behavior_risk: f64,
}

/// Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Review,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Review => "review",
            Decision::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub geo_risk: f64,
    pub velocity_risk: f64,
    pub carrier_risk: f64,
    pub behavior_risk: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            geo_risk: 0.25,
            velocity_risk: 0.30,
            carrier_risk: 0.25,
            behavior_risk: 0.20,
        }
    }
}

impl ScoringWeights {
    fn as_array(&self) -> [f64; 4] {
        [
            self.geo_risk,
            self.velocity_risk,
            self.carrier_risk,
            self.behavior_risk,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringThresholds {
    /// Highest score that is still allowed
    pub allow_max: u8,
    /// Lowest score that is blocked
    pub block_min: u8,
}

impl Default for ScoringThresholds {
    fn default() -> Self {
        Self {
            allow_max: 30,
            block_min: 71,
        }
    }
}

#[derive(Deserialize)]
struct RawScoringConfig {
    #[serde(default)]
    weights: ScoringWeights,
    #[serde(default)]
    thresholds: ScoringThresholds,
}

impl TryFrom<RawScoringConfig> for ScoringConfig {
    type Error = anyhow::Error;

    fn try_from(raw: RawScoringConfig) -> Result<Self> {
        ScoringConfig::new(raw.weights, raw.thresholds)
    }
}

/// Validated weights and thresholds. Can only be built through `new` (or
/// deserialization, which calls it), so scoring never sees a malformed config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScoringConfig")]
pub struct ScoringConfig {
    weights: ScoringWeights,
    thresholds: ScoringThresholds,
}

impl ScoringConfig {
    pub fn new(weights: ScoringWeights, thresholds: ScoringThresholds) -> Result<Self> {
        let parts = weights.as_array();
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            bail!("Scoring weights must be finite and non-negative: {:?}", weights);
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            bail!("Scoring weights must sum to 1.0, got {}", sum);
        }
        if thresholds.allow_max >= thresholds.block_min {
            bail!(
                "allow_max ({}) must be below block_min ({})",
                thresholds.allow_max,
                thresholds.block_min
            );
        }
        if thresholds.block_min > 100 {
            bail!("block_min ({}) must be at most 100", thresholds.block_min);
        }
        Ok(Self {
            weights,
            thresholds,
        })
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn thresholds(&self) -> &ScoringThresholds {
        &self.thresholds
    }
}

/// Weighted sum of the signals, rounded and clamped to `[0, 100]`.
pub fn calculate_fraud_score(signals: &SignalBreakdown, config: &ScoringConfig) -> u8 {
    let w = &config.weights;
    let score = signals.geo_risk * w.geo_risk
        + signals.velocity_risk * w.velocity_risk
        + signals.carrier_risk * w.carrier_risk
        + signals.behavior_risk * w.behavior_risk;
    if score.is_nan() {
        return 0;
    }
    score.clamp(0.0, 100.0).round() as u8
}

pub fn decide(score: u8, config: &ScoringConfig) -> Decision {
    if score <= config.thresholds.allow_max {
        Decision::Allow
    } else if score >= config.thresholds.block_min {
        Decision::Block
    } else {
        Decision::Review
    }
}

pub fn risk_tier(score: u8) -> RiskTier {
    match score {
        0..=25 => RiskTier::Low,
        26..=50 => RiskTier::Medium,
        51..=75 => RiskTier::High,
        _ => RiskTier::Critical,
    }
}

pub fn explain(signals: &SignalBreakdown) -> String {
    let factors: Vec<&str> = [
        (signals.geo_risk, "high-risk geographic region"),
        (signals.velocity_risk, "unusual request velocity"),
        (signals.carrier_risk, "suspicious carrier or number type"),
        (signals.behavior_risk, "abnormal behavioral patterns"),
    ]
    .iter()
    .filter(|(value, _)| *value >= EXPLAIN_THRESHOLD)
    .map(|(_, label)| *label)
    .collect();

    if factors.is_empty() {
        return "Low fraud probability based on all signals.".to_string();
    }
    format!("Elevated risk due to: {}.", factors.join(", "))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredSignals {
    pub score: u8,
    pub decision: Decision,
}

pub fn batch_score(batch: &[SignalBreakdown], config: &ScoringConfig) -> Vec<ScoredSignals> {
    batch
        .iter()
        .map(|signals| {
            let score = calculate_fraud_score(signals, config);
            ScoredSignals {
                score,
                decision: decide(score, config),
            }
        })
        .collect()
}
