//! Line protocol dispatch: one JSON request in, one JSON response out.

use crate::config::RateLimitConfig;
use crate::db_utils::{CheckRecord, DbUtils};
use crate::detection::{CheckRequest, Detector};
use crate::phone::parse_phone_number;
use crate::rate_limiter::RateLimiter;
use crate::response::{error_codes, error_response, error_response_with, success_response};
use crate::scoring::{batch_score, SignalBreakdown};
use chrono::Utc;
use rand::distributions::{Alphanumeric, DistString};
use serde_json::{json, Value};
use std::sync::Arc;

const CHECK_ID_PREFIX: &str = "chk_";
const CHECK_ID_LEN: usize = 24;

fn new_check_id() -> String {
    format!(
        "{}{}",
        CHECK_ID_PREFIX,
        Alphanumeric.sample_string(&mut rand::thread_rng(), CHECK_ID_LEN)
    )
}

/// Non-empty string field, or `None`.
fn str_field<'a>(data: &'a Value, name: &str) -> Option<&'a str> {
    data.get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

struct ReportRequest {
    check_id: String,
    sms_sent: bool,
    code_verified: bool,
}

impl ReportRequest {
    fn from_value(data: &Value) -> Option<Self> {
        let check_id = str_field(data, "checkId")?.to_string();
        Some(Self {
            check_id,
            sms_sent: data.get("smsSent").and_then(Value::as_bool).unwrap_or(true),
            code_verified: data.get("codeVerified").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

pub struct RequestHandler {
    detector: Arc<Detector>,
    rate_limiter: Arc<RateLimiter>,
    db: Arc<DbUtils>,
    rate_limit: RateLimitConfig,
}

impl RequestHandler {
    pub fn new(
        detector: Arc<Detector>,
        rate_limiter: Arc<RateLimiter>,
        db: Arc<DbUtils>,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self {
            detector,
            rate_limiter,
            db,
            rate_limit,
        }
    }

    pub async fn handle_line(&self, line: &str) -> String {
        self.handle_line_at(line, Utc::now().timestamp_millis()).await
    }

    pub async fn handle_line_at(&self, line: &str, now_ms: i64) -> String {
        log::debug!("Incoming raw request: {}", line);
        let data: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                log::error!("JSON decode error: {}", e);
                return error_response(error_codes::INVALID_REQUEST, "Request is not valid JSON");
            }
        };

        let Some(action) = data.get("action").and_then(Value::as_str) else {
            return error_response(error_codes::MISSING_FIELDS, "Request missing 'action' field");
        };

        match action {
            "check" => self.handle_check(&data, now_ms).await,
            "report" => self.handle_report(&data).await,
            "velocity" => self.handle_velocity(&data, now_ms).await,
            "score" => self.handle_score(&data),
            "health" => success_response(json!({"status": "ok", "timestamp": now_ms})),
            _ => {
                log::warn!("Unknown action: {}", action);
                error_response(
                    error_codes::UNKNOWN_ACTION,
                    &format!("Unknown action '{}'", action),
                )
            }
        }
    }

    async fn handle_check(&self, data: &Value, now_ms: i64) -> String {
        if str_field(data, "phoneNumber").is_none() || str_field(data, "ipAddress").is_none() {
            return error_response(
                error_codes::MISSING_FIELDS,
                "phoneNumber and ipAddress are required",
            );
        }

        // Only requests that can be scored count against the caller's limit
        let request: CheckRequest = match serde_json::from_value(data.clone()) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Malformed check request: {}", e);
                return error_response(error_codes::INVALID_REQUEST, &format!("Malformed check request: {}", e));
            }
        };

        let limit_key = match str_field(data, "apiKey") {
            Some(api_key) => format!("api:{}", api_key),
            None => format!("ip:{}", request.ip_address),
        };
        let limit = self
            .rate_limiter
            .check_at(&limit_key, self.rate_limit.limit, self.rate_limit.window_ms, now_ms)
            .await;
        if !limit.allowed {
            return error_response_with(
                error_codes::RATE_LIMITED,
                "Too many requests",
                json!({"remaining": limit.remaining, "resetAt": limit.reset_at}),
            );
        }

        let result = self.detector.analyze(&request, now_ms).await;
        let id = new_check_id();

        let record = CheckRecord {
            id: id.clone(),
            phone_number: request.phone_number.clone(),
            phone_digits: result.phone_digits.clone(),
            phone_country: result.phone_info.country.clone(),
            phone_carrier: result.phone_info.carrier.clone(),
            phone_type: result.phone_info.phone_type,
            ip_address: request.ip_address.clone(),
            user_agent: request.user_agent.clone(),
            session_id: request.session_id.clone(),
            fraud_score: result.fraud_score,
            decision: result.decision,
            signals: result.signals,
            created_at_ms: now_ms,
            sms_sent: false,
            code_verified: false,
        };
        if let Err(e) = self.db.store_check(&record).await {
            log::error!("Failed to store check {}: {}", id, e);
        }

        success_response(json!({
            "id": id,
            "decision": result.decision,
            "fraud_score": result.fraud_score,
            "risk_tier": result.risk_tier,
            "signals": result.signals,
            "phone_info": result.phone_info,
            "explanation": result.explanation,
            "created_at": now_ms,
        }))
    }

    async fn handle_report(&self, data: &Value) -> String {
        let Some(req) = ReportRequest::from_value(data) else {
            return error_response(error_codes::MISSING_FIELDS, "checkId is required");
        };

        match self
            .db
            .report_outcome(&req.check_id, req.sms_sent, req.code_verified)
            .await
        {
            Ok(true) => {
                log::info!(
                    "Outcome reported for {}: sms_sent={} code_verified={}",
                    req.check_id,
                    req.sms_sent,
                    req.code_verified
                );
                success_response(json!({
                    "checkId": req.check_id,
                    "smsSent": req.sms_sent,
                    "codeVerified": req.code_verified,
                }))
            }
            Ok(false) => error_response(
                error_codes::NOT_FOUND,
                &format!("No check with id '{}'", req.check_id),
            ),
            Err(e) => {
                log::error!("Failed to report outcome for {}: {}", req.check_id, e);
                error_response(error_codes::INTERNAL_ERROR, "Failed to record outcome")
            }
        }
    }

    async fn handle_velocity(&self, data: &Value, now_ms: i64) -> String {
        let (Some(ip), Some(phone)) = (str_field(data, "ipAddress"), str_field(data, "phoneNumber")) else {
            return error_response(
                error_codes::MISSING_FIELDS,
                "ipAddress and phoneNumber are required",
            );
        };
        let prefix = parse_phone_number(phone).prefix;
        let velocity = self
            .detector
            .tracker()
            .get_velocity_at(ip, &prefix, phone, now_ms)
            .await;
        success_response(json!(velocity))
    }

    fn handle_score(&self, data: &Value) -> String {
        let Some(raw) = data.get("signals") else {
            return error_response(error_codes::MISSING_FIELDS, "signals is required");
        };
        let batch: Vec<SignalBreakdown> = match serde_json::from_value(raw.clone()) {
            Ok(b) => b,
            Err(e) => {
                return error_response(
                    error_codes::INVALID_REQUEST,
                    &format!("signals must be a list of signal breakdowns: {}", e),
                );
            }
        };
        let results = batch_score(&batch, self.detector.scoring());
        success_response(json!({ "results": results }))
    }
}
