//! Risk signal calculators. Each returns a score in `[0, 100]` and depends
//! only on its arguments.

use crate::providers::PhoneType;
use crate::velocity_tracker::VelocityData;
use serde::{Deserialize, Serialize};

/// Default base score for countries with no risk data.
pub const DEFAULT_COUNTRY_SCORE: f64 = 50.0;

const GEO_MISMATCH_PENALTY: f64 = 25.0;
const SEQUENTIAL_PENALTY: f64 = 30.0;
const VOIP_PENALTY: f64 = 25.0;
const MISSING_USER_AGENT_RISK: f64 = 20.0;
const USER_AGENT_RISK_CAP: f64 = 50.0;

const BOT_INDICATORS: &[&str] = &["bot", "crawler", "spider", "headless", "phantom", "selenium"];
const BROWSER_TOKENS: &[&str] = &["mozilla", "chrome", "safari"];

/// Per-window request ceilings above which velocity starts adding risk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityLimits {
    pub max_1min: u32,
    pub max_5min: u32,
    pub max_1hr: u32,
}

impl Default for VelocityLimits {
    fn default() -> Self {
        Self {
            max_1min: 5,
            max_5min: 20,
            max_1hr: 100,
        }
    }
}

fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

/// Country base score plus a penalty when the IP country is known and
/// differs from the phone's country.
pub fn geo_risk(base_country_score: f64, ip_country: Option<&str>, phone_country: &str) -> f64 {
    let mut score = base_country_score;
    if let Some(ip_country) = ip_country {
        if !ip_country.eq_ignore_ascii_case(phone_country) {
            score += GEO_MISMATCH_PENALTY;
        }
    }
    clamp_score(score)
}

pub fn velocity_risk(velocity: &VelocityData, limits: &VelocityLimits) -> f64 {
    let terms = [
        (velocity.requests_1min, limits.max_1min, 40.0, 20.0),
        (velocity.requests_5min, limits.max_5min, 30.0, 15.0),
        (velocity.requests_1hr, limits.max_1hr, 20.0, 10.0),
    ];

    let mut score = 0.0;
    for (actual, limit, cap, scale) in terms {
        if actual > limit {
            let ratio = if limit == 0 {
                f64::INFINITY
            } else {
                f64::from(actual) / f64::from(limit)
            };
            score += f64::min(cap, ratio * scale);
        }
    }
    if velocity.sequential_detected {
        score += SEQUENTIAL_PENALTY;
    }
    clamp_score(score)
}

pub fn carrier_risk(phone_type: PhoneType, carrier_base_score: f64, delivery_rate: f64) -> f64 {
    let mut score = carrier_base_score;
    if phone_type == PhoneType::Voip {
        score += VOIP_PENALTY;
    }
    if delivery_rate < 0.7 {
        score += 20.0;
    } else if delivery_rate < 0.85 {
        score += 10.0;
    }
    clamp_score(score)
}

/// Bot heuristics over the raw user agent, capped at 50.
pub fn user_agent_risk(user_agent: Option<&str>) -> f64 {
    let user_agent = match user_agent {
        Some(ua) if !ua.is_empty() => ua,
        _ => return MISSING_USER_AGENT_RISK,
    };
    let ua = user_agent.to_lowercase();

    let mut risk = 0.0;
    if BOT_INDICATORS.iter().any(|bot| ua.contains(bot)) {
        risk += 40.0;
    }
    if !BROWSER_TOKENS.iter().any(|token| ua.contains(token)) {
        risk += 15.0;
    }
    if user_agent.chars().count() < 50 {
        risk += 10.0;
    }
    f64::min(USER_AGENT_RISK_CAP, risk)
}

/// Session timing, historical conversion and user agent risk combined.
pub fn behavior_risk(session_duration_ms: Option<u64>, conversion_rate: f64, user_agent_risk: f64) -> f64 {
    let mut score = 0.0;

    if let Some(duration) = session_duration_ms {
        if duration < 1_000 {
            score += 30.0;
        } else if duration < 3_000 {
            score += 15.0;
        }
    }

    if conversion_rate < 0.1 {
        score += 40.0;
    } else if conversion_rate < 0.3 {
        score += 20.0;
    } else if conversion_rate < 0.5 {
        score += 10.0;
    }

    clamp_score(score + user_agent_risk)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

    fn velocity(m1: u32, m5: u32, h1: u32, sequential: bool) -> VelocityData {
        VelocityData {
            requests_1min: m1,
            requests_5min: m5,
            requests_1hr: h1,
            requests_24hr: h1,
            unique_numbers_1hr: 0,
            sequential_detected: sequential,
        }
    }

    #[test]
    fn test_geo_risk() {
        assert_eq!(geo_risk(10.0, None, "US"), 10.0);
        assert_eq!(geo_risk(10.0, Some("us"), "US"), 10.0);
        assert_eq!(geo_risk(10.0, Some("NG"), "US"), 35.0);
        assert_eq!(geo_risk(90.0, Some("NG"), "US"), 100.0);
        assert_eq!(geo_risk(DEFAULT_COUNTRY_SCORE, None, "UNKNOWN"), 50.0);
    }

    #[test]
    fn test_velocity_risk_caps_one_minute_term() {
        let limits = VelocityLimits::default();
        // 10 per minute is twice the limit: 2 * 20 = 40, the cap
        assert_eq!(velocity_risk(&velocity(10, 10, 10, false), &limits), 40.0);
        // Far beyond the limit still stops at the cap
        assert_eq!(velocity_risk(&velocity(50, 20, 100, false), &limits), 40.0);
    }

    #[test]
    fn test_velocity_risk_terms() {
        let limits = VelocityLimits::default();
        assert_eq!(velocity_risk(&velocity(5, 20, 100, false), &limits), 0.0);
        // 6/5 * 20 = 24
        assert!((velocity_risk(&velocity(6, 6, 6, false), &limits) - 24.0).abs() < 1e-9);
        // 5min: 30/20 * 15 = 22.5, 1hr: 150/100 * 10 = 15
        assert!((velocity_risk(&velocity(5, 30, 150, false), &limits) - 37.5).abs() < 1e-9);
        assert_eq!(velocity_risk(&velocity(0, 0, 0, true), &limits), 30.0);
        // 40 + 30 + 20 + 30 clamps to 100
        assert_eq!(velocity_risk(&velocity(100, 100, 1000, true), &limits), 100.0);
    }

    #[test]
    fn test_carrier_risk() {
        assert_eq!(carrier_risk(PhoneType::Mobile, 30.0, 0.95), 30.0);
        assert_eq!(carrier_risk(PhoneType::Voip, 30.0, 0.95), 55.0);
        assert_eq!(carrier_risk(PhoneType::Mobile, 30.0, 0.8), 40.0);
        assert_eq!(carrier_risk(PhoneType::Mobile, 30.0, 0.5), 50.0);
        assert_eq!(carrier_risk(PhoneType::Voip, 80.0, 0.1), 100.0);
    }

    #[test]
    fn test_user_agent_risk() {
        assert_eq!(user_agent_risk(None), 20.0);
        assert_eq!(user_agent_risk(Some("")), 20.0);
        assert_eq!(user_agent_risk(Some(CHROME_UA)), 0.0);
        // Short, no browser token
        assert_eq!(user_agent_risk(Some("curl/8.4.0")), 25.0);
        // Bot + no browser token + short, capped at 50
        assert_eq!(user_agent_risk(Some("Googlebot/2.1")), 50.0);
        // Case-folded match against a long browser string
        let headless = format!("{} HeadlessChrome", CHROME_UA);
        assert_eq!(user_agent_risk(Some(&headless)), 40.0);
    }

    #[test]
    fn test_behavior_risk() {
        assert_eq!(behavior_risk(None, 0.5, 0.0), 0.0);
        assert_eq!(behavior_risk(Some(500), 0.5, 0.0), 30.0);
        assert_eq!(behavior_risk(Some(2_000), 0.5, 0.0), 15.0);
        assert_eq!(behavior_risk(Some(10_000), 0.4, 0.0), 10.0);
        assert_eq!(behavior_risk(None, 0.2, 0.0), 20.0);
        assert_eq!(behavior_risk(None, 0.05, 20.0), 60.0);
        assert_eq!(behavior_risk(Some(100), 0.0, 50.0), 100.0);
    }
}
