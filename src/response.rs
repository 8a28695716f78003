//! Standardized response formatting for the risk daemon.
//!
//! Every reply line is either a success envelope carrying `data` or an error
//! envelope carrying a stable `error_code`.

use serde_json::{json, Value};

/// Standardized error response codes
pub mod error_codes {
    pub const MISSING_FIELDS: &str = "MISSING_FIELDS";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Create a standardized error response JSON
pub fn error_response(code: &str, message: &str) -> String {
    error_response_with(code, message, Value::Null)
}

/// Error response with extra fields merged into the envelope.
pub fn error_response_with(code: &str, message: &str, extra: Value) -> String {
    let mut response = json!({
        "status": "error",
        "error_code": code,
        "message": message
    });
    if let (Some(envelope), Value::Object(extra)) = (response.as_object_mut(), extra) {
        envelope.extend(extra);
    }
    response.to_string()
}

/// Create a standardized success response JSON with data
pub fn success_response(data: Value) -> String {
    json!({
        "status": "success",
        "data": data
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_format() {
        let response = error_response(error_codes::MISSING_FIELDS, "phoneNumber required");
        let parsed: Value = serde_json::from_str(&response).unwrap();

        assert_eq!(parsed["status"], "error");
        assert_eq!(parsed["error_code"], "MISSING_FIELDS");
        assert_eq!(parsed["message"], "phoneNumber required");
        assert_eq!(parsed.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_error_response_with_extra_fields() {
        let response = error_response_with(
            error_codes::RATE_LIMITED,
            "Too many requests",
            json!({"remaining": 0, "resetAt": 1_000}),
        );
        let parsed: Value = serde_json::from_str(&response).unwrap();

        assert_eq!(parsed["error_code"], "RATE_LIMITED");
        assert_eq!(parsed["remaining"], 0);
        assert_eq!(parsed["resetAt"], 1_000);
    }

    #[test]
    fn test_success_response_format() {
        let data = json!({"id": "chk_abc", "fraud_score": 42});
        let response = success_response(data);
        let parsed: Value = serde_json::from_str(&response).unwrap();

        assert_eq!(parsed["status"], "success");
        assert_eq!(parsed["data"]["id"], "chk_abc");
        assert_eq!(parsed["data"]["fraud_score"], 42);
    }
}
